//! JSON API under `/api/v1`.
//!
//! The acting identity comes from the auth provider as `x-actor-id` and `x-actor-role`
//! headers and is trusted as given. Public catalog reads need no identity.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use embudo_core::{
    Actor, AgreementFieldRule, ApplicationError, FieldRuleId, HistoryEntry, InterfaceError,
    NewFieldRule, NewOpportunity, NewStage, NewTransition, Opportunity, OpportunityId, Role,
    Stage, StageId, StagePatch, Transition, TransitionId, TransitionPatch, UserId,
};
use embudo_engine::{FunnelService, RequestContext};

const ACTOR_ID_HEADER: &str = "x-actor-id";
const ACTOR_ROLE_HEADER: &str = "x-actor-role";
const CORRELATION_HEADER: &str = "x-correlation-id";
const DEFAULT_POOL_PAGE: u32 = 50;

#[derive(Clone)]
pub struct ApiState {
    service: Arc<FunnelService>,
}

pub fn router(service: Arc<FunnelService>) -> Router {
    let routes = Router::new()
        .route("/stages", get(list_stages))
        .route("/stages/{id}/transitions", get(list_transitions))
        .route("/pool", get(list_pool))
        .route("/opportunities", post(create_opportunity))
        .route("/opportunities/{id}", get(get_opportunity))
        .route("/opportunities/{id}/history", get(opportunity_history))
        .route("/opportunities/{id}/missing-fields", get(missing_fields))
        .route("/opportunities/{id}/transition", post(execute_transition))
        .route("/opportunities/{id}/claim", post(claim))
        .route("/opportunities/{id}/release", post(release))
        .route("/opportunities/{id}/reassign", post(reassign))
        .route("/admin/stages", get(admin_list_stages).post(create_stage))
        .route("/admin/stages/{id}", patch(update_stage))
        .route("/admin/transitions", get(admin_list_transitions).post(create_transition))
        .route("/admin/transitions/{id}", patch(update_transition))
        .route("/admin/field-rules", get(list_field_rules).post(upsert_field_rule))
        .route("/admin/field-rules/{id}", delete(delete_field_rule));

    Router::new().nest("/api/v1", routes).with_state(ApiState { service })
}

// ---------------------------------------------------------------------------
// Identity and errors
// ---------------------------------------------------------------------------

/// Request context resolved from the auth headers.
pub struct ActorContext(pub RequestContext);

impl<S> FromRequestParts<S> for ActorContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let correlation_id = correlation_id(&parts.headers);
        let bad_request = |message: String| {
            ApiError(InterfaceError::BadRequest { message, correlation_id: correlation_id.clone() })
        };

        let id = header_value(&parts.headers, ACTOR_ID_HEADER)
            .ok_or_else(|| bad_request(format!("`{ACTOR_ID_HEADER}` header is required")))?
            .parse::<i64>()
            .map_err(|_| bad_request(format!("`{ACTOR_ID_HEADER}` must be an integer")))?;
        let role = header_value(&parts.headers, ACTOR_ROLE_HEADER)
            .ok_or_else(|| bad_request(format!("`{ACTOR_ROLE_HEADER}` header is required")))?;
        let role = Role::parse(role)
            .ok_or_else(|| bad_request(format!("unknown role `{role}`")))?;

        let actor = Actor::user(UserId(id), role);
        Ok(Self(RequestContext::with_correlation_id(actor, correlation_id.clone())))
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok()).map(str::trim)
}

fn correlation_id(headers: &HeaderMap) -> String {
    header_value(headers, CORRELATION_HEADER)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("req-{}", Uuid::new_v4()))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub user_message: String,
    pub correlation_id: String,
}

#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl ApiError {
    fn from_application(error: ApplicationError, correlation_id: &str) -> Self {
        Self(error.into_interface(correlation_id))
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            InterfaceError::BadRequest { .. } => (StatusCode::BAD_REQUEST, "bad_request"),
            InterfaceError::Forbidden { .. } => (StatusCode::FORBIDDEN, "forbidden"),
            InterfaceError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            InterfaceError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
            InterfaceError::Unprocessable { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "unprocessable")
            }
            InterfaceError::ServiceUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            InterfaceError::Internal { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(
                event_name = "api.request.failed",
                correlation_id = %self.0.correlation_id(),
                error_code = code,
                error = %self.0.message(),
                "request failed"
            );
        } else {
            warn!(
                event_name = "api.request.rejected",
                correlation_id = %self.0.correlation_id(),
                error_code = code,
                error = %self.0.message(),
                "request rejected"
            );
        }

        let body = ErrorBody {
            error: code.to_string(),
            message: self.0.message().to_string(),
            user_message: self.0.user_message().to_string(),
            correlation_id: self.0.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn respond<T>(result: Result<T, ApplicationError>, correlation_id: &str) -> ApiResult<T> {
    result.map(Json).map_err(|error| ApiError::from_application(error, correlation_id))
}

// ---------------------------------------------------------------------------
// Catalog reads
// ---------------------------------------------------------------------------

pub async fn list_stages(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<Vec<Stage>> {
    respond(state.service.list_stages().await, &correlation_id(&headers))
}

pub async fn list_transitions(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult<Vec<Transition>> {
    respond(state.service.list_transitions(StageId(id)).await, &correlation_id(&headers))
}

// ---------------------------------------------------------------------------
// Opportunities
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct PoolQuery {
    pub limit: Option<u32>,
}

pub async fn list_pool(
    State(state): State<ApiState>,
    ActorContext(ctx): ActorContext,
    Query(query): Query<PoolQuery>,
) -> ApiResult<Vec<Opportunity>> {
    let limit = query.limit.unwrap_or(DEFAULT_POOL_PAGE);
    respond(state.service.list_pool(&ctx, limit).await, &ctx.correlation_id)
}

pub async fn create_opportunity(
    State(state): State<ApiState>,
    ActorContext(ctx): ActorContext,
    Json(new): Json<NewOpportunity>,
) -> Result<(StatusCode, Json<Opportunity>), ApiError> {
    let created = respond(state.service.create_opportunity(&ctx, new).await, &ctx.correlation_id)?;
    Ok((StatusCode::CREATED, created))
}

pub async fn get_opportunity(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    ActorContext(ctx): ActorContext,
) -> ApiResult<Opportunity> {
    respond(state.service.get_opportunity(OpportunityId(id)).await, &ctx.correlation_id)
}

pub async fn opportunity_history(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    ActorContext(ctx): ActorContext,
) -> ApiResult<Vec<HistoryEntry>> {
    respond(state.service.history(OpportunityId(id)).await, &ctx.correlation_id)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingFieldsResponse {
    pub opportunity_id: OpportunityId,
    pub missing: Vec<String>,
}

pub async fn missing_fields(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    ActorContext(ctx): ActorContext,
) -> ApiResult<MissingFieldsResponse> {
    let opportunity_id = OpportunityId(id);
    let result = state
        .service
        .missing_fields(opportunity_id)
        .await
        .map(|missing| MissingFieldsResponse { opportunity_id, missing });
    respond(result, &ctx.correlation_id)
}

#[derive(Clone, Debug, Deserialize)]
pub struct TransitionRequest {
    pub transition_id: i64,
    #[serde(default)]
    pub note: Option<String>,
}

pub async fn execute_transition(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    ActorContext(ctx): ActorContext,
    Json(request): Json<TransitionRequest>,
) -> ApiResult<Opportunity> {
    let result = state
        .service
        .execute_transition(
            &ctx,
            OpportunityId(id),
            TransitionId(request.transition_id),
            request.note.as_deref(),
        )
        .await;
    respond(result, &ctx.correlation_id)
}

pub async fn claim(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    ActorContext(ctx): ActorContext,
) -> ApiResult<Opportunity> {
    respond(state.service.claim(&ctx, OpportunityId(id)).await, &ctx.correlation_id)
}

pub async fn release(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    ActorContext(ctx): ActorContext,
) -> ApiResult<Opportunity> {
    respond(state.service.release(&ctx, OpportunityId(id)).await, &ctx.correlation_id)
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReassignRequest {
    pub new_owner: i64,
    #[serde(default)]
    pub note: Option<String>,
}

pub async fn reassign(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    ActorContext(ctx): ActorContext,
    Json(request): Json<ReassignRequest>,
) -> ApiResult<Opportunity> {
    let result = state
        .service
        .reassign(&ctx, OpportunityId(id), UserId(request.new_owner), request.note.as_deref())
        .await;
    respond(result, &ctx.correlation_id)
}

// ---------------------------------------------------------------------------
// Catalog administration
// ---------------------------------------------------------------------------

pub async fn admin_list_stages(
    State(state): State<ApiState>,
    ActorContext(ctx): ActorContext,
) -> ApiResult<Vec<Stage>> {
    respond(state.service.admin_list_stages(&ctx).await, &ctx.correlation_id)
}

pub async fn create_stage(
    State(state): State<ApiState>,
    ActorContext(ctx): ActorContext,
    Json(new): Json<NewStage>,
) -> Result<(StatusCode, Json<Stage>), ApiError> {
    let created = respond(state.service.create_stage(&ctx, new).await, &ctx.correlation_id)?;
    Ok((StatusCode::CREATED, created))
}

pub async fn update_stage(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    ActorContext(ctx): ActorContext,
    Json(patch): Json<StagePatch>,
) -> ApiResult<Stage> {
    respond(state.service.update_stage(&ctx, StageId(id), patch).await, &ctx.correlation_id)
}

pub async fn admin_list_transitions(
    State(state): State<ApiState>,
    ActorContext(ctx): ActorContext,
) -> ApiResult<Vec<Transition>> {
    respond(state.service.admin_list_transitions(&ctx).await, &ctx.correlation_id)
}

pub async fn create_transition(
    State(state): State<ApiState>,
    ActorContext(ctx): ActorContext,
    Json(new): Json<NewTransition>,
) -> Result<(StatusCode, Json<Transition>), ApiError> {
    let created =
        respond(state.service.create_transition(&ctx, new).await, &ctx.correlation_id)?;
    Ok((StatusCode::CREATED, created))
}

pub async fn update_transition(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    ActorContext(ctx): ActorContext,
    Json(patch): Json<TransitionPatch>,
) -> ApiResult<Transition> {
    let result = state.service.update_transition(&ctx, TransitionId(id), patch).await;
    respond(result, &ctx.correlation_id)
}

#[derive(Clone, Debug, Deserialize)]
pub struct FieldRuleQuery {
    pub agreement_type: Option<String>,
}

pub async fn list_field_rules(
    State(state): State<ApiState>,
    ActorContext(ctx): ActorContext,
    Query(query): Query<FieldRuleQuery>,
) -> ApiResult<Vec<AgreementFieldRule>> {
    let result = state.service.list_field_rules(&ctx, query.agreement_type.as_deref()).await;
    respond(result, &ctx.correlation_id)
}

pub async fn upsert_field_rule(
    State(state): State<ApiState>,
    ActorContext(ctx): ActorContext,
    Json(rule): Json<NewFieldRule>,
) -> ApiResult<AgreementFieldRule> {
    respond(state.service.upsert_field_rule(&ctx, rule).await, &ctx.correlation_id)
}

pub async fn delete_field_rule(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    ActorContext(ctx): ActorContext,
) -> Result<StatusCode, ApiError> {
    state
        .service
        .delete_field_rule(&ctx, FieldRuleId(id))
        .await
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(|error| ApiError::from_application(error, &ctx.correlation_id))
}
