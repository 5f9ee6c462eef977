use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;

use crate::store::Store;
use crate::transport::Transport;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub transport: Arc<dyn Transport>,
    pub updates: broadcast::Sender<()>,
    pub stream_interval: Duration,
    pub batch_size: i64,
    pub send_delay: Duration,
    pub send_timeout: Duration,
}
