use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::service;
use crate::state::AppState;

/// Background processor loop. Each tick drains one batch of due jobs; a
/// failed pass is logged and the loop keeps going.
pub async fn run(state: AppState, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match service::process_queue(&state).await {
            Ok(report) if report.processed > 0 => {
                tracing::info!(
                    processed = report.processed,
                    sent = report.sent,
                    failed = report.failed,
                    "queue pass finished"
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(error = %err, "queue pass aborted");
            }
        }
    }
}
