use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{sse::Event, sse::KeepAlive, sse::Sse, IntoResponse, Redirect},
    Json,
};
use serde::Deserialize;
use std::{convert::Infallible, time::Duration};

use crate::models::{NewCampaign, NewContact, NewTemplate, StatusResponse, UnsubscribeRequest};
use crate::service;
use crate::state::AppState;

// Transparent 1x1 GIF returned by the open-tracking endpoint.
const TRACKING_PIXEL: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xFF, 0xFF, 0xFF, 0x21, 0xF9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2C, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3B,
];

pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

pub async fn readyz() -> StatusCode {
    StatusCode::OK
}

pub async fn summary(State(state): State<AppState>) -> impl IntoResponse {
    match service::build_live_summary(&state).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(err) => (err.status(), Json(err.to_response())).into_response(),
    }
}

pub async fn stream(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let mut updates = state.updates.subscribe();
    let interval = state.stream_interval;

    let stream = async_stream::stream! {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = updates.recv() => {},
            }

            match service::build_live_summary(&state).await {
                Ok(summary) => {
                    if let Ok(event) = Event::default().json_data(summary) {
                        yield Ok(event);
                    }
                }
                Err(err) => {
                    let fallback = serde_json::json!({ "error": err.to_string() });
                    if let Ok(event) = Event::default().json_data(fallback) {
                        yield Ok(event);
                    }
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

pub async fn create_contact(
    State(state): State<AppState>,
    Json(payload): Json<NewContact>,
) -> impl IntoResponse {
    match service::create_contact(&state, payload).await {
        Ok(contact) => (StatusCode::CREATED, Json(contact)).into_response(),
        Err(err) => (err.status(), Json(err.to_response())).into_response(),
    }
}

pub async fn unsubscribe_contact(
    State(state): State<AppState>,
    Json(payload): Json<UnsubscribeRequest>,
) -> impl IntoResponse {
    match service::unsubscribe_contact(&state, &payload.email).await {
        Ok(()) => (
            StatusCode::OK,
            Json(StatusResponse {
                status: "unsubscribed",
            }),
        )
            .into_response(),
        Err(err) => (err.status(), Json(err.to_response())).into_response(),
    }
}

pub async fn create_template(
    State(state): State<AppState>,
    Json(payload): Json<NewTemplate>,
) -> impl IntoResponse {
    match service::create_template(&state, payload).await {
        Ok(template) => (StatusCode::CREATED, Json(template)).into_response(),
        Err(err) => (err.status(), Json(err.to_response())).into_response(),
    }
}

pub async fn list_campaigns(State(state): State<AppState>) -> impl IntoResponse {
    match service::list_campaigns(&state).await {
        Ok(campaigns) => (StatusCode::OK, Json(campaigns)).into_response(),
        Err(err) => (err.status(), Json(err.to_response())).into_response(),
    }
}

pub async fn create_campaign(
    State(state): State<AppState>,
    Json(payload): Json<NewCampaign>,
) -> impl IntoResponse {
    match service::create_campaign(&state, payload).await {
        Ok(campaign) => (StatusCode::CREATED, Json(campaign)).into_response(),
        Err(err) => (err.status(), Json(err.to_response())).into_response(),
    }
}

pub async fn pause_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<i64>,
) -> impl IntoResponse {
    match service::pause_campaign(&state, campaign_id).await {
        Ok(()) => (StatusCode::OK, Json(StatusResponse { status: "paused" })).into_response(),
        Err(err) => (err.status(), Json(err.to_response())).into_response(),
    }
}

pub async fn resume_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<i64>,
) -> impl IntoResponse {
    match service::resume_campaign(&state, campaign_id).await {
        Ok(()) => (StatusCode::OK, Json(StatusResponse { status: "scheduled" })).into_response(),
        Err(err) => (err.status(), Json(err.to_response())).into_response(),
    }
}

pub async fn queue_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<i64>,
) -> impl IntoResponse {
    match service::queue_campaign(&state, campaign_id).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(err) => (err.status(), Json(err.to_response())).into_response(),
    }
}

pub async fn campaign_jobs(
    State(state): State<AppState>,
    Path(campaign_id): Path<i64>,
) -> impl IntoResponse {
    match service::jobs_for_campaign(&state, campaign_id).await {
        Ok(jobs) => (StatusCode::OK, Json(jobs)).into_response(),
        Err(err) => (err.status(), Json(err.to_response())).into_response(),
    }
}

pub async fn process_queue(State(state): State<AppState>) -> impl IntoResponse {
    match service::process_queue(&state).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(err) => (err.status(), Json(err.to_response())).into_response(),
    }
}

pub async fn overdue_jobs(State(state): State<AppState>) -> impl IntoResponse {
    match service::overdue_jobs(&state).await {
        Ok(jobs) => (StatusCode::OK, Json(jobs)).into_response(),
        Err(err) => (err.status(), Json(err.to_response())).into_response(),
    }
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
) -> impl IntoResponse {
    match service::cancel_job(&state, job_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(StatusResponse {
                status: "cancelled",
            }),
        )
            .into_response(),
        Err(err) => (err.status(), Json(err.to_response())).into_response(),
    }
}

/// Open tracking. Always answers with the pixel so a broken store never
/// breaks image rendering in the recipient's client.
pub async fn track_open(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
) -> impl IntoResponse {
    if let Err(err) = service::track_open(&state, job_id).await {
        tracing::error!(job = job_id, error = %err, "open tracking failed");
    }
    (
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        TRACKING_PIXEL.to_vec(),
    )
}

#[derive(Deserialize)]
pub struct ClickParams {
    pub url: Option<String>,
}

/// Click tracking. Redirects to the wrapped destination when one is given,
/// otherwise returns 204. The destination is recipient-supplied, so only
/// values that form a valid Location header are redirected to.
pub async fn track_click(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
    Query(params): Query<ClickParams>,
) -> impl IntoResponse {
    if let Err(err) = service::track_click(&state, job_id).await {
        tracing::error!(job = job_id, error = %err, "click tracking failed");
    }
    match params.url {
        Some(url) if HeaderValue::try_from(url.as_str()).is_ok() => {
            Redirect::temporary(&url).into_response()
        }
        Some(url) => {
            tracing::warn!(job = job_id, url, "refusing redirect to malformed url");
            StatusCode::NO_CONTENT.into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
