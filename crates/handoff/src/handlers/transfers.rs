use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use crate::app::AppState;
use crate::error::HandoffError;
use crate::queue::PickOutcome;
use handoff_models::*;

pub async fn create_transfer(
    State(state): State<AppState>,
    identity: Identity,
    Json(input): Json<CreateTransfer>,
) -> Result<(StatusCode, Json<Transfer>), HandoffError> {
    let transfer = state.queue.create_transfer(&identity, input)?;
    Ok((StatusCode::CREATED, Json(transfer)))
}

pub async fn list_queue(
    State(state): State<AppState>,
    identity: Identity,
    Query(filter): Query<QueueFilter>,
) -> Result<Json<Vec<Transfer>>, HandoffError> {
    let queue = state.queue.list_queue(&identity, filter.team_id.as_deref())?;
    Ok(Json(queue))
}

pub async fn get_transfer(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<Transfer>, HandoffError> {
    Ok(Json(state.queue.get_transfer(&identity, &id)?))
}

pub async fn pick_next(
    State(state): State<AppState>,
    identity: Identity,
    body: Option<Json<PickNextRequest>>,
) -> Result<Json<PickNextResponse>, HandoffError> {
    let team_id = body.and_then(|Json(b)| b.team_id);
    let response = match state.queue.pick_next_transfer(&identity, team_id.as_deref())? {
        PickOutcome::Picked(transfer) => PickNextResponse {
            transfer: Some(transfer),
            message: "transfer picked".to_string(),
        },
        PickOutcome::QueueEmpty => PickNextResponse {
            transfer: None,
            message: "no transfers waiting".to_string(),
        },
    };
    Ok(Json(response))
}

pub async fn assign_transfer(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
    body: Option<Json<AssignTransfer>>,
) -> Result<Json<Transfer>, HandoffError> {
    let input = body.map(|Json(b)| b).unwrap_or_default();
    Ok(Json(state.queue.assign_transfer(&identity, &id, &input)?))
}

pub async fn resume_transfer(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<Transfer>, HandoffError> {
    Ok(Json(state.queue.resume_from_transfer(&identity, &id)?))
}

pub async fn record_first_response(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<Transfer>, HandoffError> {
    Ok(Json(state.queue.record_first_response(&identity, &id)?))
}
