use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::handlers::{
    campaign_jobs, cancel_job, create_campaign, create_contact, create_template, healthz,
    list_campaigns, overdue_jobs, pause_campaign, process_queue, queue_campaign, readyz,
    resume_campaign, stream, summary, track_click, track_open, unsubscribe_contact,
};
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/v1/summary", get(summary))
        .route("/v1/stream", get(stream))
        .route("/v1/contacts", post(create_contact))
        .route("/v1/contacts/unsubscribe", post(unsubscribe_contact))
        .route("/v1/templates", post(create_template))
        .route("/v1/campaigns", get(list_campaigns))
        .route("/v1/campaigns", post(create_campaign))
        .route("/v1/campaigns/:id/queue", post(queue_campaign))
        .route("/v1/campaigns/:id/pause", post(pause_campaign))
        .route("/v1/campaigns/:id/resume", post(resume_campaign))
        .route("/v1/campaigns/:id/jobs", get(campaign_jobs))
        .route("/v1/queue/process", post(process_queue))
        .route("/v1/queue/overdue", get(overdue_jobs))
        .route("/v1/jobs/:id/cancel", post(cancel_job))
        .route("/track/open/:id", get(track_open))
        .route("/track/click/:id", get(track_click))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
