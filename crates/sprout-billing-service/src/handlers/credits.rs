//! Credit balance, history and ledger mutation handlers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use sprout_billing_core::{AppendRequest, Balance, LedgerEntry, Replay, TransactionType, UserId};

use crate::auth::{AdminAuth, AuthUser, ServiceAuth};
use crate::error::ApiError;
use crate::ledger::Appended;
use crate::state::AppState;

/// Balance response.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    /// User ID.
    pub user_id: String,
    /// Credits usable now.
    pub available: i64,
    /// Credits on hold.
    pub frozen: i64,
    /// Credits owed after a chargeback.
    pub debt: i64,
    /// Sequence of the last applied entry.
    pub version: u64,
    /// Last change.
    pub updated_at: String,
}

impl From<&Balance> for BalanceResponse {
    fn from(balance: &Balance) -> Self {
        Self {
            user_id: balance.user_id.to_string(),
            available: balance.available,
            frozen: balance.frozen,
            debt: balance.debt,
            version: balance.version,
            updated_at: balance.updated_at.to_rfc3339(),
        }
    }
}

/// Get current credit balance.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<BalanceResponse>, ApiError> {
    let balance = state.ledger.get_balance(&auth.user_id).await?;
    Ok(Json(BalanceResponse::from(&balance)))
}

/// History query parameters.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Maximum number of entries to return (default: 50, max: 100).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination (default: 0).
    #[serde(default)]
    pub offset: usize,
    /// Only entries of this type.
    #[serde(rename = "type")]
    pub transaction_type: Option<String>,
}

fn default_limit() -> usize {
    50
}

/// Ledger entry response.
#[derive(Debug, Serialize)]
pub struct EntryResponse {
    /// Entry ID.
    pub id: String,
    /// Position in the user's ledger.
    pub sequence: u64,
    /// Entry type.
    pub transaction_type: TransactionType,
    /// Signed credits.
    pub credits_changed: i64,
    /// Available credits after this entry.
    pub balance_after: i64,
    /// Related payment.
    pub related_payment_id: Option<String>,
    /// Description.
    pub description: String,
    /// Entry status.
    pub status: String,
    /// Timestamp.
    pub created_at: String,
}

impl From<&LedgerEntry> for EntryResponse {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            sequence: entry.sequence,
            transaction_type: entry.transaction_type,
            credits_changed: entry.credits_changed,
            balance_after: entry.balance_after,
            related_payment_id: entry.related_payment_id.map(|p| p.to_string()),
            description: entry.description.clone(),
            status: entry.status.as_str().to_string(),
            created_at: entry.created_at.to_rfc3339(),
        }
    }
}

/// History response.
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    /// Entries (newest first).
    pub entries: Vec<EntryResponse>,
    /// Whether there are more entries.
    pub has_more: bool,
}

/// List ledger history.
pub async fn history(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let transaction_type = query
        .transaction_type
        .as_deref()
        .map(str::parse::<TransactionType>)
        .transpose()?;

    let page = state
        .ledger
        .history(&auth.user_id, query.limit, query.offset, transaction_type)
        .await?;

    Ok(Json(HistoryResponse {
        entries: page.entries.iter().map(EntryResponse::from).collect(),
        has_more: page.has_more,
    }))
}

/// Audit response.
#[derive(Debug, Serialize)]
pub struct AuditResponse {
    /// Whether replay matched the live balance.
    pub consistent: bool,
    /// Balance reconstructed from the ledger.
    pub replay: Replay,
    /// Live balance.
    pub balance: BalanceResponse,
}

/// Replay the caller's ledger against the live balance.
///
/// An inconsistency fails with 500 rather than returning a guess.
pub async fn audit(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<AuditResponse>, ApiError> {
    let replay = state.ledger.replay_balance(&auth.user_id).await?;
    let balance = state.ledger.get_balance(&auth.user_id).await?;
    Ok(Json(AuditResponse {
        consistent: true,
        replay,
        balance: BalanceResponse::from(&balance),
    }))
}

/// Credit mutation request from a service.
#[derive(Debug, Deserialize)]
pub struct CreditRequest {
    /// Target user.
    pub user_id: UserId,
    /// Credits to consume, hold or release (positive).
    pub credits: i64,
    /// Reason, for the ledger.
    #[serde(default)]
    pub description: Option<String>,
    /// Extra context stored on the entry.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Ledger mutation response.
#[derive(Debug, Serialize)]
pub struct MutationResponse {
    /// The appended entry.
    pub entry: EntryResponse,
    /// Balance afterwards.
    pub balance: BalanceResponse,
}

impl From<Appended> for MutationResponse {
    fn from(appended: Appended) -> Self {
        Self {
            entry: EntryResponse::from(&appended.entry),
            balance: BalanceResponse::from(&appended.balance),
        }
    }
}

fn positive(credits: i64) -> Result<i64, ApiError> {
    if credits > 0 {
        Ok(credits)
    } else {
        Err(ApiError::BadRequest("credits must be positive".into()))
    }
}

async fn apply(
    state: &AppState,
    service: &str,
    request: AppendRequest,
    metadata: Option<serde_json::Value>,
) -> Result<Json<MutationResponse>, ApiError> {
    let request = match metadata {
        Some(metadata) => request.with_metadata(metadata),
        None => request,
    };
    let user_id = request.user_id;
    let transaction_type = request.transaction_type;

    let appended = state.ledger.append(request).await.map_err(|e| {
        tracing::info!(
            user_id = %user_id,
            service = %service,
            transaction_type = %transaction_type.as_str(),
            error = %e,
            "Ledger append refused"
        );
        e
    })?;
    Ok(Json(MutationResponse::from(appended)))
}

/// Consume credits for an analysis.
pub async fn usage(
    State(state): State<Arc<AppState>>,
    service: ServiceAuth,
    Json(body): Json<CreditRequest>,
) -> Result<Json<MutationResponse>, ApiError> {
    let credits = positive(body.credits)?;
    let description = body.description.unwrap_or_else(|| "Resume analysis".into());
    apply(
        &state,
        &service.service_name,
        AppendRequest::usage(body.user_id, credits, description),
        body.metadata,
    )
    .await
}

/// Move credits from available to frozen.
pub async fn freeze(
    State(state): State<Arc<AppState>>,
    service: ServiceAuth,
    Json(body): Json<CreditRequest>,
) -> Result<Json<MutationResponse>, ApiError> {
    let credits = positive(body.credits)?;
    let description = body.description.unwrap_or_else(|| "Credits held".into());
    apply(
        &state,
        &service.service_name,
        AppendRequest::freeze(body.user_id, credits, description),
        body.metadata,
    )
    .await
}

/// Move credits from frozen back to available.
pub async fn unfreeze(
    State(state): State<Arc<AppState>>,
    service: ServiceAuth,
    Json(body): Json<CreditRequest>,
) -> Result<Json<MutationResponse>, ApiError> {
    let credits = positive(body.credits)?;
    let description = body.description.unwrap_or_else(|| "Hold released".into());
    apply(
        &state,
        &service.service_name,
        AppendRequest::unfreeze(body.user_id, credits, description),
        body.metadata,
    )
    .await
}

/// Kind of manual adjustment.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    /// Add credits.
    Bonus,
    /// Remove expired credits.
    Expiry,
}

/// Admin grant request.
#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    /// Target user.
    pub user_id: UserId,
    /// Credits to add or expire (positive).
    pub credits: i64,
    /// Adjustment kind.
    pub kind: GrantKind,
    /// Reason, for the ledger.
    pub description: String,
}

/// Manual bonus or expiry adjustment.
pub async fn grant(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Json(body): Json<GrantRequest>,
) -> Result<Json<MutationResponse>, ApiError> {
    let credits = positive(body.credits)?;
    let request = match body.kind {
        GrantKind::Bonus => AppendRequest::bonus(body.user_id, credits, body.description),
        GrantKind::Expiry => AppendRequest::expiry(body.user_id, credits, body.description),
    };

    tracing::info!(
        admin_id = %admin.admin_id,
        user_id = %body.user_id,
        kind = ?body.kind,
        credits,
        "Admin credit adjustment"
    );

    let metadata = serde_json::json!({ "admin_id": admin.admin_id });
    apply(&state, "admin", request, Some(metadata)).await
}
