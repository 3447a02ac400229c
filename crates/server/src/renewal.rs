//! Staff-facing HTTP surface of the renewal workflow.
//!
//! One route per step under `/api/renewal-workflow`. Successful replies are
//! `{"success": true, ...}`; failures are `{"success": false, error, message, correlation_id}`
//! with the status taken from the interface error class.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use renewdesk_core::config::AuthConfig;
use renewdesk_core::providers::Plan;
use renewdesk_core::workflow::{
    ApplicationSummary, ChatRole, ComparisonOutcome, CustomerFound, DeviceChosen, DeviceListing,
    DeviceOsChosen, DeviceRecommendations, DeviceTypeChosen, EligibilityOutcome, PhoneListing,
    PlanChosen, PlanListing, PromotionSearch, StartedSession, Submitted, UpgradeQuote,
    WorkflowSession,
};
use renewdesk_core::{ApplicationError, InterfaceError, RenewalWorkflow};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::StaffIdentity;

pub const BASE_PATH: &str = "/api/renewal-workflow";

#[derive(Clone)]
pub struct ApiState {
    pub workflow: Arc<RenewalWorkflow>,
    pub auth: Arc<AuthConfig>,
}

#[derive(Debug, Serialize)]
pub struct Success<T> {
    pub success: bool,
    #[serde(flatten)]
    pub body: T,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: &'static str,
    pub message: String,
    pub correlation_id: String,
}

pub type ApiError = (StatusCode, Json<ErrorBody>);
pub type ApiResult<T> = Result<Json<Success<T>>, ApiError>;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SessionRequest {
    pub session_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct QueryCustomerRequest {
    pub session_id: String,
    pub id_number: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SelectPhoneRequest {
    pub session_id: String,
    pub phone_number: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SelectDeviceTypeRequest {
    pub session_id: String,
    pub device_type: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SelectDeviceOsRequest {
    pub session_id: String,
    pub os_type: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct QueryDevicesRequest {
    pub session_id: String,
    pub store_id: Option<String>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RecommendationsRequest {
    pub session_id: String,
    pub store_id: Option<String>,
    pub budget: i64,
    pub is_flagship: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SelectDeviceRequest {
    pub session_id: String,
    pub device_id: String,
    pub color: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ComparePlansRequest {
    pub session_id: String,
    pub plan_ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PlanRequest {
    pub session_id: String,
    pub plan_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SearchPromotionsRequest {
    pub session_id: String,
    pub query: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpgradeCostQuoteRequest {
    pub session_id: String,
    pub plan_id: String,
    pub include_device: bool,
}

impl Default for UpgradeCostQuoteRequest {
    fn default() -> Self {
        Self { session_id: String::new(), plan_id: String::new(), include_device: true }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ChatRequest {
    pub role: String,
    pub content: String,
}

// ---------------------------------------------------------------------------
// Reply bodies that are not already workflow outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct PlanDetails {
    pub plan: Plan,
}

#[derive(Debug, Serialize)]
pub struct ConfirmReply {
    pub summary: ApplicationSummary,
}

#[derive(Debug, Serialize)]
pub struct Acknowledged {
    pub message: String,
}

pub fn router(state: ApiState) -> Router {
    let steps = Router::new()
        .route("/start", post(start))
        .route("/step/query-customer", post(query_customer))
        .route("/step/list-phones", post(list_phones))
        .route("/step/select-phone", post(select_phone))
        .route("/step/select-device-type", post(select_device_type))
        .route("/step/select-device-os", post(select_device_os))
        .route("/step/query-devices", post(query_devices))
        .route("/step/get-recommendations", post(recommend_devices))
        .route("/step/select-device", post(select_device))
        .route("/step/list-plans", post(list_plans))
        .route("/step/compare-plans", post(compare_plans))
        .route("/step/get-plan-details", post(plan_details))
        .route("/step/search-promotions", post(search_promotions))
        .route("/step/calculate-upgrade-cost", post(upgrade_cost))
        .route("/step/select-plan", post(select_plan))
        .route("/step/confirm", post(confirm))
        .route("/step/submit", post(submit))
        .route("/session/{session_id}/chat", post(add_chat_message))
        .route("/session/{session_id}", get(get_session).delete(delete_session));

    Router::new().nest(BASE_PATH, steps).with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn start(State(state): State<ApiState>, staff: StaffIdentity) -> ApiResult<StartedSession> {
    let result = state.workflow.start(&staff.staff_id).await;
    if let Ok(started) = &result {
        info!(
            event_name = "api.session.started",
            staff_id = %staff.staff_id,
            session_id = %started.session_id,
            "renewal session started"
        );
    }
    reply("start", &staff, result)
}

pub async fn query_customer(
    State(state): State<ApiState>,
    staff: StaffIdentity,
    payload: Result<Json<QueryCustomerRequest>, JsonRejection>,
) -> ApiResult<CustomerFound> {
    let request = body("query_customer", &staff, payload)?;
    let result =
        state.workflow.query_customer(&staff.staff_id, &request.session_id, &request.id_number).await;
    reply("query_customer", &staff, result)
}

pub async fn list_phones(
    State(state): State<ApiState>,
    staff: StaffIdentity,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> ApiResult<PhoneListing> {
    let request = body("list_phones", &staff, payload)?;
    let result = state.workflow.list_phones(&staff.staff_id, &request.session_id).await;
    reply("list_phones", &staff, result)
}

pub async fn select_phone(
    State(state): State<ApiState>,
    staff: StaffIdentity,
    payload: Result<Json<SelectPhoneRequest>, JsonRejection>,
) -> ApiResult<EligibilityOutcome> {
    let request = body("select_phone", &staff, payload)?;
    let result = state
        .workflow
        .select_phone(&staff.staff_id, &request.session_id, &request.phone_number)
        .await;
    reply("select_phone", &staff, result)
}

pub async fn select_device_type(
    State(state): State<ApiState>,
    staff: StaffIdentity,
    payload: Result<Json<SelectDeviceTypeRequest>, JsonRejection>,
) -> ApiResult<DeviceTypeChosen> {
    let request = body("select_device_type", &staff, payload)?;
    let result = state
        .workflow
        .select_device_type(&staff.staff_id, &request.session_id, &request.device_type)
        .await;
    reply("select_device_type", &staff, result)
}

pub async fn select_device_os(
    State(state): State<ApiState>,
    staff: StaffIdentity,
    payload: Result<Json<SelectDeviceOsRequest>, JsonRejection>,
) -> ApiResult<DeviceOsChosen> {
    let request = body("select_device_os", &staff, payload)?;
    let result = state
        .workflow
        .select_device_os(&staff.staff_id, &request.session_id, &request.os_type)
        .await;
    reply("select_device_os", &staff, result)
}

pub async fn query_devices(
    State(state): State<ApiState>,
    staff: StaffIdentity,
    payload: Result<Json<QueryDevicesRequest>, JsonRejection>,
) -> ApiResult<DeviceListing> {
    let request = body("query_devices", &staff, payload)?;
    let result = state
        .workflow
        .query_devices(
            &staff.staff_id,
            &request.session_id,
            request.store_id.as_deref(),
            request.min_price,
            request.max_price,
        )
        .await;
    reply("query_devices", &staff, result)
}

pub async fn recommend_devices(
    State(state): State<ApiState>,
    staff: StaffIdentity,
    payload: Result<Json<RecommendationsRequest>, JsonRejection>,
) -> ApiResult<DeviceRecommendations> {
    let request = body("recommend_devices", &staff, payload)?;
    let result = state
        .workflow
        .recommend_devices(
            &staff.staff_id,
            &request.session_id,
            request.store_id.as_deref(),
            request.budget,
            request.is_flagship,
        )
        .await;
    reply("recommend_devices", &staff, result)
}

pub async fn select_device(
    State(state): State<ApiState>,
    staff: StaffIdentity,
    payload: Result<Json<SelectDeviceRequest>, JsonRejection>,
) -> ApiResult<DeviceChosen> {
    let request = body("select_device", &staff, payload)?;
    let result = state
        .workflow
        .select_device(
            &staff.staff_id,
            &request.session_id,
            &request.device_id,
            request.color.as_deref(),
        )
        .await;
    reply("select_device", &staff, result)
}

pub async fn list_plans(
    State(state): State<ApiState>,
    staff: StaffIdentity,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> ApiResult<PlanListing> {
    let request = body("list_plans", &staff, payload)?;
    let result = state.workflow.list_plans(&staff.staff_id, &request.session_id).await;
    reply("list_plans", &staff, result)
}

pub async fn compare_plans(
    State(state): State<ApiState>,
    staff: StaffIdentity,
    payload: Result<Json<ComparePlansRequest>, JsonRejection>,
) -> ApiResult<ComparisonOutcome> {
    let request = body("compare_plans", &staff, payload)?;
    let result = state
        .workflow
        .compare_plans(&staff.staff_id, &request.session_id, &request.plan_ids)
        .await;
    reply("compare_plans", &staff, result)
}

pub async fn plan_details(
    State(state): State<ApiState>,
    staff: StaffIdentity,
    payload: Result<Json<PlanRequest>, JsonRejection>,
) -> ApiResult<PlanDetails> {
    let request = body("plan_details", &staff, payload)?;
    let result = state
        .workflow
        .plan_details(&staff.staff_id, &request.session_id, &request.plan_id)
        .await
        .map(|plan| PlanDetails { plan });
    reply("plan_details", &staff, result)
}

pub async fn search_promotions(
    State(state): State<ApiState>,
    staff: StaffIdentity,
    payload: Result<Json<SearchPromotionsRequest>, JsonRejection>,
) -> ApiResult<PromotionSearch> {
    let request = body("search_promotions", &staff, payload)?;
    let result = state
        .workflow
        .search_promotions(&staff.staff_id, &request.session_id, &request.query, request.limit)
        .await;
    reply("search_promotions", &staff, result)
}

pub async fn upgrade_cost(
    State(state): State<ApiState>,
    staff: StaffIdentity,
    payload: Result<Json<UpgradeCostQuoteRequest>, JsonRejection>,
) -> ApiResult<UpgradeQuote> {
    let request = body("upgrade_cost", &staff, payload)?;
    let result = state
        .workflow
        .upgrade_cost(
            &staff.staff_id,
            &request.session_id,
            &request.plan_id,
            request.include_device,
        )
        .await;
    reply("upgrade_cost", &staff, result)
}

pub async fn select_plan(
    State(state): State<ApiState>,
    staff: StaffIdentity,
    payload: Result<Json<PlanRequest>, JsonRejection>,
) -> ApiResult<PlanChosen> {
    let request = body("select_plan", &staff, payload)?;
    let result =
        state.workflow.select_plan(&staff.staff_id, &request.session_id, &request.plan_id).await;
    reply("select_plan", &staff, result)
}

pub async fn confirm(
    State(state): State<ApiState>,
    staff: StaffIdentity,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> ApiResult<ConfirmReply> {
    let request = body("confirm", &staff, payload)?;
    let result = state
        .workflow
        .confirm(&staff.staff_id, &request.session_id)
        .await
        .map(|summary| ConfirmReply { summary });
    reply("confirm", &staff, result)
}

pub async fn submit(
    State(state): State<ApiState>,
    staff: StaffIdentity,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> ApiResult<Submitted> {
    let request = body("submit", &staff, payload)?;
    let result = state.workflow.submit(&staff.staff_id, &request.session_id).await;
    if let Ok(submitted) = &result {
        info!(
            event_name = "api.application.submitted",
            staff_id = %staff.staff_id,
            session_id = %request.session_id,
            order_number = %submitted.order_number,
            total_amount = submitted.total_amount,
            "renewal application submitted"
        );
    }
    reply("submit", &staff, result)
}

pub async fn add_chat_message(
    State(state): State<ApiState>,
    staff: StaffIdentity,
    Path(session_id): Path<String>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult<Acknowledged> {
    let request = body("add_chat_message", &staff, payload)?;
    let result = match parse_role(&request.role) {
        Some(role) => state
            .workflow
            .add_chat_message(&staff.staff_id, &session_id, role, &request.content)
            .await
            .map(|()| Acknowledged { message: "訊息已記錄".to_string() }),
        None => Err(ApplicationError::Validation(format!("不支援的角色: {}", request.role))),
    };
    reply("add_chat_message", &staff, result)
}

pub async fn get_session(
    State(state): State<ApiState>,
    staff: StaffIdentity,
    Path(session_id): Path<String>,
) -> ApiResult<WorkflowSession> {
    let result = state.workflow.session(&staff.staff_id, &session_id).await;
    reply("get_session", &staff, result)
}

pub async fn delete_session(
    State(state): State<ApiState>,
    staff: StaffIdentity,
    Path(session_id): Path<String>,
) -> ApiResult<Acknowledged> {
    let result = state
        .workflow
        .delete(&staff.staff_id, &session_id)
        .await
        .map(|()| Acknowledged { message: "會話已刪除".to_string() });
    reply("delete_session", &staff, result)
}

// ---------------------------------------------------------------------------
// Plumbing
// ---------------------------------------------------------------------------

fn parse_role(raw: &str) -> Option<ChatRole> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "user" => Some(ChatRole::User),
        "assistant" => Some(ChatRole::Assistant),
        "system" => Some(ChatRole::System),
        _ => None,
    }
}

fn body<T>(
    operation: &'static str,
    staff: &StaffIdentity,
    payload: Result<Json<T>, JsonRejection>,
) -> Result<T, ApiError> {
    payload.map(|Json(request)| request).map_err(|rejection| {
        reject(operation, staff, ApplicationError::Validation(rejection.body_text()))
    })
}

fn reply<T: Serialize>(
    operation: &'static str,
    staff: &StaffIdentity,
    result: Result<T, ApplicationError>,
) -> ApiResult<T> {
    result
        .map(|body| Json(Success { success: true, body }))
        .map_err(|error| reject(operation, staff, error))
}

pub fn status_for(error: &InterfaceError) -> StatusCode {
    match error {
        InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        InterfaceError::Forbidden { .. } => StatusCode::FORBIDDEN,
        InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
        InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
        InterfaceError::BadGateway { .. } => StatusCode::BAD_GATEWAY,
        InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Client errors echo the domain message; server-side classes only expose the safe text and
/// leave the detail in the log under the same correlation id.
fn reject(operation: &'static str, staff: &StaffIdentity, error: ApplicationError) -> ApiError {
    let interface = error.into_interface(Uuid::new_v4().to_string());
    let status = status_for(&interface);
    let message = if status.is_server_error() {
        error!(
            event_name = "api.request.failed",
            operation,
            staff_id = %staff.staff_id,
            correlation_id = %interface.correlation_id(),
            status = status.as_u16(),
            error = %interface,
            "workflow request failed"
        );
        interface.user_message().to_string()
    } else {
        warn!(
            event_name = "api.request.rejected",
            operation,
            staff_id = %staff.staff_id,
            correlation_id = %interface.correlation_id(),
            status = status.as_u16(),
            error = %interface,
            "workflow request rejected"
        );
        interface.message().to_string()
    };

    (
        status,
        Json(ErrorBody {
            success: false,
            error: interface.code(),
            message,
            correlation_id: interface.correlation_id().to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        extract::{Path, State},
        http::{Request, StatusCode},
        Json,
    };
    use renewdesk_core::config::{AuthConfig, StaffToken};
    use renewdesk_core::providers::{
        SimulatedCustomerProvider, SimulatedInventoryProvider, SimulatedPromotionProvider,
    };
    use renewdesk_core::workflow::{
        InMemorySessionStore, WorkflowSessionManager, WorkflowStep, DEFAULT_SESSION_TTL,
    };
    use renewdesk_core::{ApplicationError, RenewalWorkflow};
    use secrecy::SecretString;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    fn state() -> ApiState {
        let manager =
            WorkflowSessionManager::new(Arc::new(InMemorySessionStore::new()), DEFAULT_SESSION_TTL);
        let workflow = RenewalWorkflow::new(
            Arc::new(manager),
            Arc::new(SimulatedCustomerProvider::new()),
            Arc::new(SimulatedInventoryProvider),
            Arc::new(SimulatedPromotionProvider),
            "STORE001",
        );
        let auth = AuthConfig {
            staff_tokens: vec![
                StaffToken {
                    token: SecretString::from("token-s001".to_string()),
                    staff_id: "S001".to_string(),
                },
                StaffToken {
                    token: SecretString::from("token-s002".to_string()),
                    staff_id: "S002".to_string(),
                },
            ],
        };
        ApiState { workflow: Arc::new(workflow), auth: Arc::new(auth) }
    }

    fn staff(staff_id: &str) -> StaffIdentity {
        StaffIdentity::new(staff_id)
    }

    fn session(session_id: &str) -> Result<Json<SessionRequest>, JsonRejection> {
        Ok(Json(SessionRequest { session_id: session_id.to_string() }))
    }

    async fn started(state: &ApiState) -> String {
        let Json(reply) = start(State(state.clone()), staff("S001")).await.expect("start");
        reply.body.session_id
    }

    async fn call(app: axum::Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.expect("router response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body bytes");
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test]
    async fn start_then_query_customer_advances_to_list_phones() {
        let state = state();
        let session_id = started(&state).await;

        let Json(found) = query_customer(
            State(state.clone()),
            staff("S001"),
            Ok(Json(QueryCustomerRequest {
                session_id: session_id.clone(),
                id_number: "A123456789".to_string(),
            })),
        )
        .await
        .expect("customer found");

        assert!(found.success);
        assert_eq!(found.body.customer.customer_id, "C123456");
        assert_eq!(found.body.next_step, WorkflowStep::ListPhones);
    }

    #[tokio::test]
    async fn unknown_customer_is_not_found_with_domain_message() {
        let state = state();
        let session_id = started(&state).await;

        let (status, Json(error)) = query_customer(
            State(state),
            staff("S001"),
            Ok(Json(QueryCustomerRequest { session_id, id_number: "Z000000000".to_string() })),
        )
        .await
        .expect_err("unknown customer");

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!error.success);
        assert_eq!(error.error, "not_found");
        assert!(error.message.contains("查無此客戶"));
        assert!(!error.correlation_id.is_empty());
    }

    #[tokio::test]
    async fn out_of_order_step_is_bad_request() {
        let state = state();
        let session_id = started(&state).await;

        let (status, Json(error)) =
            submit(State(state), staff("S001"), session(&session_id)).await.expect_err("illegal");

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error.error, "bad_request");
        assert!(error.message.contains("init"));
        assert!(error.message.contains("completed"));
    }

    #[tokio::test]
    async fn foreign_session_is_forbidden() {
        let state = state();
        let session_id = started(&state).await;

        let (status, Json(error)) =
            get_session(State(state), staff("S002"), Path(session_id)).await.expect_err("foreign");

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(error.error, "forbidden");
    }

    #[tokio::test]
    async fn missing_session_id_is_rejected_as_bad_request() {
        let state = state();

        let (status, _) =
            list_phones(State(state), staff("S001"), session("")).await.expect_err("missing id");

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn chat_role_must_be_known() {
        let state = state();
        let session_id = started(&state).await;

        let (status, _) = add_chat_message(
            State(state.clone()),
            staff("S001"),
            Path(session_id.clone()),
            Ok(Json(ChatRequest { role: "robot".to_string(), content: "hi".to_string() })),
        )
        .await
        .expect_err("unknown role");
        assert_eq!(status, StatusCode::BAD_REQUEST);

        add_chat_message(
            State(state.clone()),
            staff("S001"),
            Path(session_id.clone()),
            Ok(Json(ChatRequest { role: "Assistant".to_string(), content: "您好".to_string() })),
        )
        .await
        .expect("chat recorded");

        let Json(reply) =
            get_session(State(state), staff("S001"), Path(session_id)).await.expect("session");
        assert_eq!(reply.body.chat_history.len(), 1);
        assert_eq!(reply.body.chat_history[0].content, "您好");
    }

    #[tokio::test]
    async fn delete_then_read_is_not_found() {
        let state = state();
        let session_id = started(&state).await;

        delete_session(State(state.clone()), staff("S001"), Path(session_id.clone()))
            .await
            .expect("deleted");
        let (status, _) =
            get_session(State(state), staff("S001"), Path(session_id)).await.expect_err("gone");

        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn interface_classes_map_to_http_statuses() {
        let cases = [
            (ApplicationError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (ApplicationError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (ApplicationError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ApplicationError::Conflict("x".into()), StatusCode::CONFLICT),
            (ApplicationError::Upstream("x".into()), StatusCode::BAD_GATEWAY),
            (ApplicationError::Persistence("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (ApplicationError::Configuration("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            assert_eq!(status_for(&error.into_interface("req")), expected);
        }
    }

    #[test]
    fn server_errors_hide_the_detail() {
        let (status, Json(body)) = reject(
            "select_phone",
            &staff("S001"),
            ApplicationError::Upstream("crm call `check_renewal_eligibility` timed out".into()),
        );

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(!body.message.contains("check_renewal_eligibility"));
    }

    #[tokio::test]
    async fn routes_require_a_known_bearer_token() {
        let app = router(state());

        let (status, body) = call(
            app.clone(),
            Request::post("/api/renewal-workflow/start").body(Body::empty()).expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let (status, _) = call(
            app,
            Request::post("/api/renewal-workflow/start")
                .header("authorization", "Bearer not-a-token")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn full_renewal_without_device_over_http() {
        let app = router(state());
        let post = |path: &str, json: Value| {
            Request::post(format!("/api/renewal-workflow{path}"))
                .header("authorization", "Bearer token-s001")
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .expect("request")
        };

        let (status, body) = call(app.clone(), post("/start", Value::Null)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["current_step"], "init");
        let id = body["session_id"].as_str().expect("session id").to_string();

        let steps = [
            ("/step/query-customer", serde_json::json!({"session_id": id, "id_number": "A123456789"})),
            ("/step/list-phones", serde_json::json!({"session_id": id})),
            ("/step/select-phone", serde_json::json!({"session_id": id, "phone_number": "0912345678"})),
            ("/step/select-device-type", serde_json::json!({"session_id": id, "device_type": "none"})),
            ("/step/list-plans", serde_json::json!({"session_id": id})),
            ("/step/select-plan", serde_json::json!({"session_id": id, "plan_id": "PLAN001"})),
            ("/step/confirm", serde_json::json!({"session_id": id})),
        ];
        for (path, json) in steps {
            let (status, body) = call(app.clone(), post(path, json)).await;
            assert_eq!(status, StatusCode::OK, "{path} failed: {body}");
        }

        let (status, body) =
            call(app.clone(), post("/step/submit", serde_json::json!({"session_id": id}))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["order_number"].as_str().is_some_and(|number| number.starts_with("ORD")));
        assert_eq!(body["current_step"], "completed");

        let (status, body) = call(
            app,
            Request::get(format!("/api/renewal-workflow/session/{id}"))
                .header("authorization", "Bearer token-s002")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn lookup_routes_answer_without_moving_the_step() {
        let app = router(state());
        let post = |path: &str, json: Value| {
            Request::post(format!("/api/renewal-workflow{path}"))
                .header("authorization", "Bearer token-s001")
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .expect("request")
        };
        let (_, body) = call(app.clone(), post("/start", Value::Null)).await;
        let id = body["session_id"].as_str().expect("session id").to_string();
        let steps = [
            ("/step/query-customer", serde_json::json!({"session_id": id, "id_number": "A123456789"})),
            ("/step/list-phones", serde_json::json!({"session_id": id})),
            ("/step/select-phone", serde_json::json!({"session_id": id, "phone_number": "0912345678"})),
            ("/step/select-device-type", serde_json::json!({"session_id": id, "device_type": "smartphone"})),
            ("/step/select-device-os", serde_json::json!({"session_id": id, "os_type": "android"})),
        ];
        for (path, json) in steps {
            let (status, body) = call(app.clone(), post(path, json)).await;
            assert_eq!(status, StatusCode::OK, "{path} failed: {body}");
        }

        let (status, body) = call(
            app.clone(),
            post("/step/get-recommendations", serde_json::json!({"session_id": id, "budget": 30000})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["os_preference"], "android");
        assert_eq!(body["budget"], 30000);
        assert!(body["recommendation_count"].as_u64().is_some_and(|count| count > 0));

        let (status, body) = call(
            app.clone(),
            post("/step/get-recommendations", serde_json::json!({"session_id": id})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, body) = call(
            app.clone(),
            post("/step/search-promotions", serde_json::json!({"session_id": id, "query": "續約"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["query"], "續約");
        assert_eq!(body["total"], body["promotions"].as_array().map_or(0, Vec::len));

        let (status, body) = call(
            app.clone(),
            post("/step/calculate-upgrade-cost", serde_json::json!({"session_id": id, "plan_id": "PLAN002"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["cost_details"]["current_plan_fee"], 999);
        assert_eq!(body["cost_details"]["device_price"], 0);

        let (status, _) = call(
            app.clone(),
            post("/step/calculate-upgrade-cost", serde_json::json!({"session_id": id, "plan_id": "PLAN404"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = call(
            app,
            Request::get(format!("/api/renewal-workflow/session/{id}"))
                .header("authorization", "Bearer token-s001")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(body["current_step"], "select_device");
    }

    #[tokio::test]
    async fn malformed_json_uses_the_error_envelope() {
        let app = router(state());

        let (status, body) = call(
            app,
            Request::post("/api/renewal-workflow/step/list-phones")
                .header("authorization", "Bearer token-s001")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .expect("request"),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "bad_request");
    }
}
