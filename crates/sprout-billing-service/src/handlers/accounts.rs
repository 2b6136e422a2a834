//! Account opening.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::handlers::credits::BalanceResponse;
use crate::state::AppState;

/// Open the caller's account and grant the welcome bonus.
///
/// Returns 409 if the account already exists.
pub async fn open_account(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<BalanceResponse>, ApiError> {
    let balance = state.ledger.open_account(&auth.user_id).await?;
    Ok(Json(BalanceResponse::from(&balance)))
}
