use axum::{
    extract::{Path, State},
    Json,
};

use crate::app::AppState;
use crate::error::HandoffError;
use handoff_models::*;

/// Run the team's assignment strategy and report who it picked.
pub async fn select_agent(
    State(state): State<AppState>,
    identity: Identity,
    Path(team_id): Path<String>,
) -> Result<Json<SelectAgentResponse>, HandoffError> {
    if !identity.can_manage() {
        return Err(HandoffError::Forbidden(
            "only managers can run team assignment".to_string(),
        ));
    }
    let agent_id = state
        .queue
        .assign_to_team(&team_id, identity.organization_id())?;
    Ok(Json(SelectAgentResponse { team_id, agent_id }))
}
