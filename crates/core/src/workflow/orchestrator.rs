//! Step handlers of the renewal flow.
//!
//! Every handler follows the same order: load and authorize the session, validate input,
//! decide whether the call is an in-place step, a re-entry that needs a rewind, or not
//! reachable at all, check preconditions, call providers, and only then write. A provider
//! failure therefore never leaves a half-applied rewind behind.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::errors::{ApplicationError, DomainError};
use crate::providers::{
    Billing, Contract, Customer, CustomerProvider, DeviceQuery, Eligibility, InventoryProvider,
    PhoneLine, Plan, PlanComparison, Promotion, PromotionProvider, RecommendationQuery,
    RecommendedDevice, StockedDevice, UpgradeCost, UpgradeCostRequest, Usage,
    RENEWAL_CONTRACT_TYPE,
};
use crate::workflow::manager::{not_found, WorkflowSessionManager};
use crate::workflow::session::{ChatRole, SessionPatch, WorkflowSession};
use crate::workflow::step::{fields_cleared_by_rewind, SelectionField, WorkflowStep};

pub const NO_DEVICE: &str = "none";
pub const DEVICE_TYPES: [&str; 4] = [NO_DEVICE, "smartphone", "tablet", "wearable"];
pub const DEVICE_OS_TYPES: [&str; 2] = ["ios", "android"];
pub const DEFAULT_DEVICE_COLOR: &str = "default";
const PLAN_SEARCH_LIMIT: usize = 10;
const RECOMMENDED_PRIORITY: u32 = 8;
const MIN_COMPARED_PLANS: usize = 2;
const MAX_COMPARED_PLANS: usize = 4;
pub const DEFAULT_PROMOTION_SEARCH_LIMIT: usize = 5;
const MAX_PROMOTION_SEARCH_LIMIT: usize = 20;

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StartedSession {
    pub session_id: String,
    pub current_step: WorkflowStep,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CustomerFound {
    pub customer: Customer,
    pub next_step: WorkflowStep,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PhoneOverview {
    #[serde(flatten)]
    pub line: PhoneLine,
    pub contract: Option<Contract>,
    pub usage: Option<Usage>,
    pub billing: Option<Billing>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PhoneListing {
    pub phones: Vec<PhoneOverview>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EligibilityOutcome {
    pub eligible: bool,
    pub eligibility: Eligibility,
    pub next_step: WorkflowStep,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceTypeChosen {
    pub device_type: String,
    pub next_step: WorkflowStep,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceOsChosen {
    pub os_type: String,
    pub next_step: WorkflowStep,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceListing {
    pub store_id: String,
    pub devices: Vec<StockedDevice>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceRecommendations {
    pub store_id: String,
    pub os_preference: String,
    pub budget: i64,
    pub recommendation_count: usize,
    pub recommendations: Vec<RecommendedDevice>,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceChosen {
    pub device_id: String,
    pub color: String,
    pub next_step: WorkflowStep,
}

/// One row of the plan list: a plan as offered under the promotion that surfaced it first.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlanOffer {
    pub plan_id: String,
    pub name: String,
    pub monthly_fee: i64,
    pub data: String,
    pub voice: String,
    pub sms: u32,
    pub contract_months: u32,
    pub promotion_id: String,
    pub promotion_title: String,
    pub relevance_score: u32,
    pub is_recommended: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlanListing {
    pub plans: Vec<PlanOffer>,
    pub search_query: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ComparisonOutcome {
    pub comparison: PlanComparison,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PromotionSearch {
    pub promotions: Vec<Promotion>,
    pub total: usize,
    pub query: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UpgradeQuote {
    pub cost_details: UpgradeCost,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedPlan {
    pub plan_id: String,
    pub plan_name: String,
    pub monthly_fee: i64,
    pub contract_months: u32,
    pub data: String,
    pub voice: String,
    pub cost_details: UpgradeCost,
    pub selected_at: DateTime<Utc>,
}

impl SelectedPlan {
    /// Amount due at the counter.
    pub fn total_amount(&self) -> i64 {
        self.cost_details.final_device_price
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlanChosen {
    pub selected_plan: SelectedPlan,
    pub next_step: WorkflowStep,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SummaryCustomer {
    pub name: String,
    pub id_number: String,
    pub phone: String,
    pub email: Option<String>,
    pub address: Option<String>,
    pub contract_type: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SummaryPhone {
    pub phone_number: String,
    pub status: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SummaryContract {
    pub plan_name: String,
    pub monthly_fee: i64,
    pub contract_start: chrono::NaiveDate,
    pub contract_end: chrono::NaiveDate,
    pub remaining_months: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SummaryDevice {
    pub brand: String,
    pub model: String,
    pub color: String,
    pub storage: String,
    pub price: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SummaryPlan {
    pub plan_name: String,
    pub monthly_fee: i64,
    pub contract_months: u32,
    pub data: String,
    pub voice: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApplicationSummary {
    pub customer: SummaryCustomer,
    pub phone: SummaryPhone,
    pub contract: SummaryContract,
    pub selected_device: Option<SummaryDevice>,
    pub selected_plan: SummaryPlan,
    pub cost_summary: UpgradeCost,
    pub total_amount: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Submitted {
    pub order_number: String,
    pub total_amount: i64,
    pub current_step: WorkflowStep,
}

// ---------------------------------------------------------------------------
// Entry gate
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Entry {
    InPlace,
    Rewind,
}

/// Decides how a handler landing on `landing` may run from `current`. `siblings` are steps
/// that share the landing step's work without rewinding (the plan-shopping pair).
fn entry_gate(
    current: WorkflowStep,
    landing: WorkflowStep,
    siblings: &[WorkflowStep],
) -> Result<Entry, DomainError> {
    if current == landing || siblings.contains(&current) {
        Ok(Entry::InPlace)
    } else if landing.is_reentry_from(current) {
        Ok(Entry::Rewind)
    } else {
        Err(DomainError::StepNotReachable { step: landing, current })
    }
}

fn selection(entries: impl IntoIterator<Item = (SelectionField, Value)>) -> Map<String, Value> {
    entries.into_iter().map(|(field, value)| (field.as_str().to_string(), value)).collect()
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ApplicationError> {
    serde_json::to_value(value)
        .map_err(|error| ApplicationError::Persistence(format!("selection encoding failed: {error}")))
}

fn read_selection<T: for<'de> Deserialize<'de>>(
    session: &WorkflowSession,
    field: SelectionField,
) -> Result<Option<T>, ApplicationError> {
    session
        .selection(field)
        .map(|value| {
            serde_json::from_value(value.clone()).map_err(|error| {
                ApplicationError::Domain(DomainError::InvariantViolation(format!(
                    "stored {} is unreadable: {error}",
                    field.as_str()
                )))
            })
        })
        .transpose()
}

fn require<'a>(
    session: &'a WorkflowSession,
    field: SelectionField,
    message: &str,
) -> Result<&'a str, ApplicationError> {
    session
        .selection_str(field)
        .ok_or_else(|| DomainError::Precondition(message.to_string()).into())
}

fn required_text<'a>(value: &'a str, message: &str) -> Result<&'a str, ApplicationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApplicationError::Validation(message.to_string()));
    }
    Ok(trimmed)
}

/// `ORD` + local date + the last six characters of the session id.
pub fn order_number(session_id: &str, now: DateTime<Utc>) -> String {
    let tail: String = {
        let chars: Vec<char> = session_id.chars().collect();
        chars[chars.len().saturating_sub(6)..].iter().collect()
    };
    format!("ORD{}{tail}", now.format("%Y%m%d"))
}

/// Search phrase used to surface renewal promotions for the chosen device.
pub fn plan_search_query(device_type: &str, device_os: Option<&str>, device: Option<&StockedDevice>) -> String {
    if device_type == NO_DEVICE {
        return "單純續約 不搭配裝置".to_string();
    }
    let os = device_os.unwrap_or_default();
    match device {
        Some(device) => format!("續約搭配裝置 {os} {} {}", device.brand, device.model),
        None => format!("續約搭配裝置 {os}"),
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

pub struct RenewalWorkflow {
    sessions: Arc<WorkflowSessionManager>,
    customers: Arc<dyn CustomerProvider>,
    inventory: Arc<dyn InventoryProvider>,
    promotions: Arc<dyn PromotionProvider>,
    default_store_id: String,
}

impl RenewalWorkflow {
    pub fn new(
        sessions: Arc<WorkflowSessionManager>,
        customers: Arc<dyn CustomerProvider>,
        inventory: Arc<dyn InventoryProvider>,
        promotions: Arc<dyn PromotionProvider>,
        default_store_id: impl Into<String>,
    ) -> Self {
        Self { sessions, customers, inventory, promotions, default_store_id: default_store_id.into() }
    }

    pub fn sessions(&self) -> &Arc<WorkflowSessionManager> {
        &self.sessions
    }

    pub async fn start(&self, staff_id: &str) -> Result<StartedSession, ApplicationError> {
        let staff_id = required_text(staff_id, "缺少員工編號")?;
        let session = self.sessions.create_session(staff_id, true).await?;
        Ok(StartedSession { session_id: session.session_id, current_step: session.current_step })
    }

    pub async fn session(
        &self,
        staff_id: &str,
        session_id: &str,
    ) -> Result<WorkflowSession, ApplicationError> {
        self.owned_session(staff_id, session_id).await
    }

    pub async fn delete(&self, staff_id: &str, session_id: &str) -> Result<(), ApplicationError> {
        self.owned_session(staff_id, session_id).await?;
        if !self.sessions.delete_session(session_id).await? {
            return Err(not_found(session_id));
        }
        Ok(())
    }

    pub async fn add_chat_message(
        &self,
        staff_id: &str,
        session_id: &str,
        role: ChatRole,
        content: &str,
    ) -> Result<(), ApplicationError> {
        let content = required_text(content, "訊息內容不可為空")?;
        self.owned_session(staff_id, session_id).await?;
        if !self.sessions.add_chat_message(session_id, role, content).await? {
            return Err(not_found(session_id));
        }
        Ok(())
    }

    pub async fn query_customer(
        &self,
        staff_id: &str,
        session_id: &str,
        id_number: &str,
    ) -> Result<CustomerFound, ApplicationError> {
        let id_number = required_text(id_number, "缺少身分證號")?;
        let session = self.owned_session(staff_id, session_id).await?;
        let entry = entry_gate(session.current_step, WorkflowStep::Init, &[])?;

        let customer = self
            .customers
            .find_customer(id_number)
            .await?
            .ok_or_else(|| ApplicationError::NotFound("查無此客戶".to_string()))?;
        if !customer.is_company_customer {
            return Err(ApplicationError::Validation("非本公司客戶".to_string()));
        }

        if entry == Entry::Rewind {
            self.rewind(session_id, WorkflowStep::Init).await?;
        }
        self.merge(
            session_id,
            selection([
                (SelectionField::IdNumber, json!(customer.id_number)),
                (SelectionField::CustomerId, json!(customer.customer_id)),
                (SelectionField::CustomerName, json!(customer.name)),
                (SelectionField::CustomerPhone, json!(customer.phone)),
            ]),
        )
        .await?;
        let session = self
            .advance(session_id, &[WorkflowStep::QueryCustomer, WorkflowStep::ListPhones])
            .await?;

        tracing::info!(
            event_name = "renewal.customer_found",
            session_id,
            customer_id = %customer.customer_id,
            "customer attached to renewal session"
        );
        Ok(CustomerFound { customer, next_step: session.current_step })
    }

    /// At `list_phones` this advances to number selection; from any later step it is a
    /// read-only view.
    pub async fn list_phones(
        &self,
        staff_id: &str,
        session_id: &str,
    ) -> Result<PhoneListing, ApplicationError> {
        let session = self.owned_session(staff_id, session_id).await?;
        let advance = match session.current_step {
            WorkflowStep::ListPhones => true,
            current if current > WorkflowStep::ListPhones => false,
            current => {
                return Err(DomainError::StepNotReachable { step: WorkflowStep::ListPhones, current }
                    .into())
            }
        };
        let customer_id = require(&session, SelectionField::CustomerId, "請先查詢客戶")?;

        let lines = self.customers.list_numbers(customer_id).await?;
        if lines.is_empty() {
            return Err(ApplicationError::NotFound("此客戶無門號".to_string()));
        }
        let mut phones = Vec::with_capacity(lines.len());
        for line in lines {
            let contract = self.customers.get_contract(&line.phone_number).await?;
            let usage = self.customers.get_usage(&line.phone_number).await?;
            let billing = self.customers.get_billing(&line.phone_number).await?;
            phones.push(PhoneOverview { line, contract, usage, billing });
        }

        if advance {
            self.advance(session_id, &[WorkflowStep::SelectPhone]).await?;
        }
        tracing::info!(
            event_name = "renewal.phones_listed",
            session_id,
            customer_id,
            phone_count = phones.len(),
            "customer numbers listed"
        );
        Ok(PhoneListing { phones })
    }

    pub async fn select_phone(
        &self,
        staff_id: &str,
        session_id: &str,
        phone_number: &str,
    ) -> Result<EligibilityOutcome, ApplicationError> {
        let phone_number = required_text(phone_number, "缺少門號")?;
        let session = self.owned_session(staff_id, session_id).await?;
        let entry = entry_gate(session.current_step, WorkflowStep::SelectPhone, &[])?;
        let customer_id = require(&session, SelectionField::CustomerId, "請先查詢客戶")?;

        let eligibility = self.customers.check_eligibility(phone_number, customer_id).await?;
        let contract = self.customers.get_contract(phone_number).await?;

        if entry == Entry::Rewind {
            self.rewind(session_id, WorkflowStep::SelectPhone).await?;
        }
        self.merge(
            session_id,
            selection([
                (SelectionField::SelectedPhoneNumber, json!(phone_number)),
                (SelectionField::EligibilityCheck, to_value(&eligibility)?),
                (SelectionField::Contract, to_value(&contract)?),
            ]),
        )
        .await?;

        let mut path = vec![WorkflowStep::CheckEligibility];
        if eligibility.eligible {
            path.push(WorkflowStep::SelectDeviceType);
        }
        let session = self.advance(session_id, &path).await?;

        tracing::info!(
            event_name = "renewal.eligibility_checked",
            session_id,
            phone_number,
            eligible = eligibility.eligible,
            "renewal eligibility evaluated"
        );
        Ok(EligibilityOutcome {
            eligible: eligibility.eligible,
            eligibility,
            next_step: session.current_step,
        })
    }

    pub async fn select_device_type(
        &self,
        staff_id: &str,
        session_id: &str,
        device_type: &str,
    ) -> Result<DeviceTypeChosen, ApplicationError> {
        let device_type = required_text(device_type, "缺少裝置類型")?.to_lowercase();
        if !DEVICE_TYPES.contains(&device_type.as_str()) {
            return Err(ApplicationError::Validation(format!(
                "無效的裝置類型 `{device_type}`，可選：{}",
                DEVICE_TYPES.join(", ")
            )));
        }
        let session = self.owned_session(staff_id, session_id).await?;
        let entry = entry_gate(session.current_step, WorkflowStep::SelectDeviceType, &[])?;
        require(&session, SelectionField::CustomerId, "請先查詢客戶")?;

        if entry == Entry::Rewind {
            self.rewind(session_id, WorkflowStep::SelectDeviceType).await?;
        }

        let (update, next) = if device_type == NO_DEVICE {
            let placeholder = json!({
                "device_id": NO_DEVICE,
                "brand": "無",
                "model": "單純續約",
                "color": "無",
            });
            (
                selection([
                    (SelectionField::DeviceType, json!(device_type)),
                    (SelectionField::Device, placeholder),
                ]),
                WorkflowStep::ListPlans,
            )
        } else {
            (selection([(SelectionField::DeviceType, json!(device_type))]), WorkflowStep::SelectDeviceOs)
        };
        self.merge(session_id, update).await?;
        let session = self.advance(session_id, &[next]).await?;

        tracing::info!(
            event_name = "renewal.device_type_chosen",
            session_id,
            device_type = %device_type,
            "device type chosen"
        );
        Ok(DeviceTypeChosen { device_type, next_step: session.current_step })
    }

    pub async fn select_device_os(
        &self,
        staff_id: &str,
        session_id: &str,
        os_type: &str,
    ) -> Result<DeviceOsChosen, ApplicationError> {
        let os_type = required_text(os_type, "缺少作業系統")?.to_lowercase();
        if !DEVICE_OS_TYPES.contains(&os_type.as_str()) {
            return Err(ApplicationError::Validation(format!(
                "無效的作業系統 `{os_type}`，可選：{}",
                DEVICE_OS_TYPES.join(", ")
            )));
        }
        let session = self.owned_session(staff_id, session_id).await?;
        let entry = entry_gate(session.current_step, WorkflowStep::SelectDeviceOs, &[])?;
        require(&session, SelectionField::CustomerId, "請先查詢客戶")?;
        let device_type = require(&session, SelectionField::DeviceType, "請先選擇裝置類型")?;
        if device_type == NO_DEVICE {
            return Err(DomainError::Precondition("單純續約不需選擇作業系統".to_string()).into());
        }

        if entry == Entry::Rewind {
            self.rewind(session_id, WorkflowStep::SelectDeviceOs).await?;
        }
        self.merge(session_id, selection([(SelectionField::DeviceOs, json!(os_type))])).await?;
        let session = self.advance(session_id, &[WorkflowStep::SelectDevice]).await?;

        Ok(DeviceOsChosen { os_type, next_step: session.current_step })
    }

    /// Read-only stock lookup for the chosen OS.
    pub async fn query_devices(
        &self,
        staff_id: &str,
        session_id: &str,
        store_id: Option<&str>,
        min_price: Option<i64>,
        max_price: Option<i64>,
    ) -> Result<DeviceListing, ApplicationError> {
        if let (Some(min), Some(max)) = (min_price, max_price) {
            if min > max {
                return Err(ApplicationError::Validation("價格下限不可高於上限".to_string()));
            }
        }
        let session = self.owned_session(staff_id, session_id).await?;
        let device_os = require(&session, SelectionField::DeviceOs, "請先選擇作業系統")?;

        let store_id = store_id
            .map(str::trim)
            .filter(|store| !store.is_empty())
            .unwrap_or(&self.default_store_id)
            .to_string();
        let devices = self
            .inventory
            .list_devices(&DeviceQuery {
                store_id: store_id.clone(),
                os_filter: Some(device_os.to_string()),
                min_price,
                max_price,
            })
            .await?;
        Ok(DeviceListing { store_id, devices })
    }

    /// Ranks devices for the chosen OS within a budget. No state change.
    pub async fn recommend_devices(
        &self,
        staff_id: &str,
        session_id: &str,
        store_id: Option<&str>,
        budget: i64,
        is_flagship: Option<bool>,
    ) -> Result<DeviceRecommendations, ApplicationError> {
        if budget <= 0 {
            return Err(ApplicationError::Validation("預算必須大於 0".to_string()));
        }
        let session = self.owned_session(staff_id, session_id).await?;
        let device_os = require(&session, SelectionField::DeviceOs, "請先選擇作業系統")?;

        let query = RecommendationQuery {
            store_id: store_id
                .map(str::trim)
                .filter(|store| !store.is_empty())
                .unwrap_or(&self.default_store_id)
                .to_string(),
            os_preference: device_os.to_string(),
            budget,
            is_flagship,
        };
        let picks = self.inventory.recommend_devices(&query).await?;

        Ok(DeviceRecommendations {
            store_id: query.store_id,
            os_preference: query.os_preference,
            budget,
            recommendation_count: picks.recommendations.len(),
            recommendations: picks.recommendations,
            reason: picks.reason,
        })
    }

    pub async fn select_device(
        &self,
        staff_id: &str,
        session_id: &str,
        device_id: &str,
        color: Option<&str>,
    ) -> Result<DeviceChosen, ApplicationError> {
        let device_id = required_text(device_id, "缺少設備編號")?;
        let color = color
            .map(str::trim)
            .filter(|color| !color.is_empty())
            .unwrap_or(DEFAULT_DEVICE_COLOR)
            .to_string();
        let session = self.owned_session(staff_id, session_id).await?;
        let entry = entry_gate(session.current_step, WorkflowStep::SelectDevice, &[])?;
        require(&session, SelectionField::CustomerId, "請先查詢客戶")?;
        let device_os = require(&session, SelectionField::DeviceOs, "請先選擇作業系統")?;

        let mut device = self
            .inventory
            .list_devices(&DeviceQuery {
                store_id: self.default_store_id.clone(),
                os_filter: Some(device_os.to_string()),
                ..DeviceQuery::default()
            })
            .await?
            .into_iter()
            .find(|device| device.device_id == device_id)
            .ok_or_else(|| ApplicationError::NotFound("設備不存在".to_string()))?;
        device.color = color.clone();

        if entry == Entry::Rewind {
            self.rewind(session_id, WorkflowStep::SelectDevice).await?;
        }
        self.merge(session_id, selection([(SelectionField::Device, to_value(&device)?)])).await?;
        let session = self.advance(session_id, &[WorkflowStep::ListPlans]).await?;

        tracing::info!(
            event_name = "renewal.device_chosen",
            session_id,
            device_id,
            color = %color,
            "device chosen"
        );
        Ok(DeviceChosen { device_id: device.device_id, color, next_step: session.current_step })
    }

    pub async fn list_plans(
        &self,
        staff_id: &str,
        session_id: &str,
    ) -> Result<PlanListing, ApplicationError> {
        let session = self.owned_session(staff_id, session_id).await?;
        let entry =
            entry_gate(session.current_step, WorkflowStep::ListPlans, &[WorkflowStep::ComparePlans])?;
        require(&session, SelectionField::SelectedPhoneNumber, "請先選擇門號")?;
        let device_type = require(&session, SelectionField::DeviceType, "請先選擇裝置類型")?;
        let device: Option<StockedDevice> = if device_type == NO_DEVICE {
            None
        } else {
            read_selection(&session, SelectionField::Device)?
        };

        let search_query = plan_search_query(
            device_type,
            session.selection_str(SelectionField::DeviceOs),
            device.as_ref(),
        );
        let promotions = self
            .promotions
            .search_promotions(&search_query, Some(RENEWAL_CONTRACT_TYPE), PLAN_SEARCH_LIMIT)
            .await?;

        let mut seen = HashSet::new();
        let mut plans = Vec::new();
        for promotion in &promotions {
            for plan_id in &promotion.plans {
                if !seen.insert(plan_id.clone()) {
                    continue;
                }
                let Some(plan) = self.promotions.plan_details(plan_id).await? else {
                    continue;
                };
                plans.push(PlanOffer {
                    plan_id: plan.plan_id,
                    name: plan.name,
                    monthly_fee: plan.monthly_fee,
                    data: plan.data,
                    voice: plan.voice,
                    sms: plan.sms,
                    contract_months: plan.contract_months,
                    promotion_id: promotion.promotion_id.clone(),
                    promotion_title: promotion.title.clone(),
                    relevance_score: promotion.relevance_score,
                    is_recommended: promotion.priority >= RECOMMENDED_PRIORITY,
                });
            }
        }
        plans.sort_by(|left, right| {
            (right.is_recommended, right.relevance_score)
                .cmp(&(left.is_recommended, left.relevance_score))
        });

        match (entry, session.current_step) {
            (Entry::Rewind, _) => self.rewind(session_id, WorkflowStep::ListPlans).await?,
            (Entry::InPlace, WorkflowStep::ComparePlans) => {
                self.advance(session_id, &[WorkflowStep::ListPlans]).await?;
            }
            (Entry::InPlace, _) => {}
        }

        tracing::info!(
            event_name = "renewal.plans_listed",
            session_id,
            search_query = %search_query,
            plan_count = plans.len(),
            "renewal plans listed"
        );
        Ok(PlanListing { plans, search_query })
    }

    pub async fn compare_plans(
        &self,
        staff_id: &str,
        session_id: &str,
        plan_ids: &[String],
    ) -> Result<ComparisonOutcome, ApplicationError> {
        if !(MIN_COMPARED_PLANS..=MAX_COMPARED_PLANS).contains(&plan_ids.len()) {
            return Err(ApplicationError::Validation(format!(
                "請選擇 {MIN_COMPARED_PLANS} 到 {MAX_COMPARED_PLANS} 個方案進行比較"
            )));
        }
        let session = self.owned_session(staff_id, session_id).await?;
        let entry =
            entry_gate(session.current_step, WorkflowStep::ListPlans, &[WorkflowStep::ComparePlans])?;

        let comparison = self.promotions.compare(plan_ids).await?;

        if entry == Entry::Rewind {
            self.rewind(session_id, WorkflowStep::ListPlans).await?;
        }
        self.merge(
            session_id,
            selection([
                (SelectionField::Comparison, to_value(&comparison)?),
                (SelectionField::ComparedPlanIds, json!(plan_ids)),
            ]),
        )
        .await?;
        if session.current_step != WorkflowStep::ComparePlans {
            self.advance(session_id, &[WorkflowStep::ComparePlans]).await?;
        }

        Ok(ComparisonOutcome { comparison })
    }

    pub async fn plan_details(
        &self,
        staff_id: &str,
        session_id: &str,
        plan_id: &str,
    ) -> Result<Plan, ApplicationError> {
        let plan_id = required_text(plan_id, "缺少方案編號")?;
        self.owned_session(staff_id, session_id).await?;
        self.promotions
            .plan_details(plan_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound("方案不存在".to_string()))
    }

    /// Free-text promotion search under the renewal contract type. No state change.
    pub async fn search_promotions(
        &self,
        staff_id: &str,
        session_id: &str,
        query: &str,
        limit: Option<usize>,
    ) -> Result<PromotionSearch, ApplicationError> {
        let query = required_text(query, "缺少搜尋關鍵字")?;
        let limit = limit.unwrap_or(DEFAULT_PROMOTION_SEARCH_LIMIT);
        if !(1..=MAX_PROMOTION_SEARCH_LIMIT).contains(&limit) {
            return Err(ApplicationError::Validation(format!(
                "搜尋筆數須介於 1 到 {MAX_PROMOTION_SEARCH_LIMIT}"
            )));
        }
        self.owned_session(staff_id, session_id).await?;

        let promotions = self
            .promotions
            .search_promotions(query, Some(RENEWAL_CONTRACT_TYPE), limit)
            .await?;
        Ok(PromotionSearch { total: promotions.len(), promotions, query: query.to_string() })
    }

    /// Prices a plan against the current contract, optionally with the chosen device.
    /// No state change.
    pub async fn upgrade_cost(
        &self,
        staff_id: &str,
        session_id: &str,
        plan_id: &str,
        include_device: bool,
    ) -> Result<UpgradeQuote, ApplicationError> {
        let plan_id = required_text(plan_id, "缺少方案編號")?;
        let session = self.owned_session(staff_id, session_id).await?;
        let (_, cost_details) = self.price_plan(&session, plan_id, include_device).await?;
        Ok(UpgradeQuote { cost_details })
    }

    pub async fn select_plan(
        &self,
        staff_id: &str,
        session_id: &str,
        plan_id: &str,
    ) -> Result<PlanChosen, ApplicationError> {
        let plan_id = required_text(plan_id, "缺少方案編號")?;
        let session = self.owned_session(staff_id, session_id).await?;
        let entry =
            entry_gate(session.current_step, WorkflowStep::ListPlans, &[WorkflowStep::ComparePlans])?;
        require(&session, SelectionField::SelectedPhoneNumber, "請先選擇門號")?;
        let device_type = require(&session, SelectionField::DeviceType, "請先選擇裝置類型")?;
        let (plan, cost_details) =
            self.price_plan(&session, plan_id, device_type != NO_DEVICE).await?;

        let selected_plan = SelectedPlan {
            plan_id: plan.plan_id,
            plan_name: plan.name,
            monthly_fee: plan.monthly_fee,
            contract_months: plan.contract_months,
            data: plan.data,
            voice: plan.voice,
            cost_details,
            selected_at: Utc::now(),
        };

        if entry == Entry::Rewind {
            self.rewind(session_id, WorkflowStep::ListPlans).await?;
        }
        self.merge(
            session_id,
            selection([(SelectionField::SelectedPlan, to_value(&selected_plan)?)]),
        )
        .await?;
        let session = self.advance(session_id, &[WorkflowStep::Confirm]).await?;

        tracing::info!(
            event_name = "renewal.plan_chosen",
            session_id,
            plan_id = %selected_plan.plan_id,
            total_amount = selected_plan.total_amount(),
            "renewal plan chosen"
        );
        Ok(PlanChosen { selected_plan, next_step: session.current_step })
    }

    /// Assembles the application summary shown before submission. No state change.
    pub async fn confirm(
        &self,
        staff_id: &str,
        session_id: &str,
    ) -> Result<ApplicationSummary, ApplicationError> {
        let session = self.owned_session(staff_id, session_id).await?;
        if session.current_step != WorkflowStep::Confirm {
            return Err(DomainError::StepNotReachable {
                step: WorkflowStep::Confirm,
                current: session.current_step,
            }
            .into());
        }
        let selected_plan = read_selection::<SelectedPlan>(&session, SelectionField::SelectedPlan)?
            .ok_or_else(|| DomainError::Precondition("請先選擇方案".to_string()))?;
        let id_number = require(&session, SelectionField::IdNumber, "請先查詢客戶")?;
        let phone_number = require(&session, SelectionField::SelectedPhoneNumber, "請先選擇門號")?;
        let contract = read_selection::<Contract>(&session, SelectionField::Contract)?
            .ok_or_else(|| DomainError::Precondition("申辦資料不完整：缺少 合約資料".to_string()))?;

        let customer = self
            .customers
            .find_customer(id_number)
            .await?
            .ok_or_else(|| ApplicationError::NotFound("查無此客戶".to_string()))?;

        let selected_device = match session.selection_str(SelectionField::DeviceType) {
            Some(NO_DEVICE) | None => None,
            Some(_) => read_selection::<StockedDevice>(&session, SelectionField::Device)?.map(
                |device| SummaryDevice {
                    brand: device.brand,
                    model: device.model,
                    color: device.color,
                    storage: device.storage,
                    price: device.price,
                },
            ),
        };

        Ok(ApplicationSummary {
            customer: SummaryCustomer {
                name: customer.name,
                id_number: customer.id_number,
                phone: customer.phone,
                email: customer.email,
                address: customer.address,
                contract_type: RENEWAL_CONTRACT_TYPE.to_string(),
            },
            phone: SummaryPhone {
                phone_number: phone_number.to_string(),
                status: contract.status.clone(),
            },
            contract: SummaryContract {
                plan_name: contract.plan_name,
                monthly_fee: contract.monthly_fee,
                contract_start: contract.contract_start_date,
                contract_end: contract.contract_end_date,
                remaining_months: contract.contract_months.saturating_sub(contract.months_used),
            },
            selected_device,
            total_amount: selected_plan.total_amount(),
            selected_plan: SummaryPlan {
                plan_name: selected_plan.plan_name,
                monthly_fee: selected_plan.monthly_fee,
                contract_months: selected_plan.contract_months,
                data: selected_plan.data,
                voice: selected_plan.voice,
            },
            cost_summary: selected_plan.cost_details,
        })
    }

    pub async fn submit(
        &self,
        staff_id: &str,
        session_id: &str,
    ) -> Result<Submitted, ApplicationError> {
        let session = self.owned_session(staff_id, session_id).await?;
        if session.current_step != WorkflowStep::Confirm {
            return Err(DomainError::IllegalTransition {
                from: session.current_step,
                to: WorkflowStep::Completed,
            }
            .into());
        }
        let selected_plan = read_selection::<SelectedPlan>(&session, SelectionField::SelectedPlan)?
            .ok_or_else(|| DomainError::Precondition("請先選擇方案".to_string()))?;

        let now = Utc::now();
        let order_number = order_number(session_id, now);
        let total_amount = selected_plan.total_amount();
        let patch = SessionPatch::metadata("order_number", order_number.clone())
            .with_metadata("completed_at", now.to_rfc3339())
            .with_metadata("total_amount", total_amount);
        if !self.sessions.update_session(session_id, patch).await? {
            return Err(not_found(session_id));
        }
        let session = self.advance(session_id, &[WorkflowStep::Completed]).await?;

        tracing::info!(
            event_name = "renewal.submitted",
            session_id,
            staff_id,
            order_number = %order_number,
            total_amount,
            "renewal application submitted"
        );
        Ok(Submitted { order_number, total_amount, current_step: session.current_step })
    }

    async fn owned_session(
        &self,
        staff_id: &str,
        session_id: &str,
    ) -> Result<WorkflowSession, ApplicationError> {
        let session_id = required_text(session_id, "缺少 session_id")?;
        let session =
            self.sessions.get_session(session_id).await?.ok_or_else(|| not_found(session_id))?;
        if !session.is_owned_by(staff_id) {
            tracing::warn!(
                event_name = "renewal.ownership_rejected",
                session_id,
                staff_id,
                "session accessed by another staff member"
            );
            return Err(ApplicationError::Forbidden(format!(
                "session {session_id} belongs to another staff member"
            )));
        }
        Ok(session)
    }

    async fn price_plan(
        &self,
        session: &WorkflowSession,
        plan_id: &str,
        include_device: bool,
    ) -> Result<(Plan, UpgradeCost), ApplicationError> {
        let current_plan_fee = read_selection::<Contract>(session, SelectionField::Contract)?
            .map_or(0, |contract| contract.monthly_fee);
        let device_price = if include_device {
            read_selection::<StockedDevice>(session, SelectionField::Device)?
                .map_or(0, |device| device.price)
        } else {
            0
        };

        let plan = self
            .promotions
            .plan_details(plan_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound("方案不存在".to_string()))?;
        let cost_details = self
            .promotions
            .calculate_upgrade_cost(&UpgradeCostRequest {
                current_plan_fee,
                new_plan_id: plan.plan_id.clone(),
                device_price,
                contract_type: RENEWAL_CONTRACT_TYPE.to_string(),
            })
            .await?
            .ok_or_else(|| ApplicationError::NotFound("方案不存在".to_string()))?;
        Ok((plan, cost_details))
    }

    async fn rewind(&self, session_id: &str, landing: WorkflowStep) -> Result<(), ApplicationError> {
        let cleared = fields_cleared_by_rewind(landing);
        if !self.sessions.force_reset_step(session_id, landing, &cleared).await? {
            return Err(not_found(session_id));
        }
        Ok(())
    }

    async fn merge(&self, session_id: &str, update: Map<String, Value>) -> Result<(), ApplicationError> {
        if !self.sessions.update_customer_selection(session_id, update).await? {
            return Err(not_found(session_id));
        }
        Ok(())
    }

    async fn advance(
        &self,
        session_id: &str,
        path: &[WorkflowStep],
    ) -> Result<WorkflowSession, ApplicationError> {
        let mut latest = None;
        for step in path {
            latest = Some(self.sessions.transition_to_step(session_id, *step).await?);
        }
        match latest {
            Some(session) => Ok(session),
            None => self.sessions.get_session(session_id).await?.ok_or_else(|| not_found(session_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;

    use super::{order_number, plan_search_query, RenewalWorkflow};
    use crate::errors::{ApplicationError, DomainError};
    use crate::providers::{
        Billing, Contract, Customer, CustomerProvider, Eligibility, PhoneLine, ProviderError,
        SimulatedCustomerProvider, SimulatedInventoryProvider, SimulatedPromotionProvider, Usage,
    };
    use crate::workflow::manager::{WorkflowSessionManager, DEFAULT_SESSION_TTL};
    use crate::workflow::session::ChatRole;
    use crate::workflow::step::{SelectionField, WorkflowStep};
    use crate::workflow::store::InMemorySessionStore;

    const STAFF: &str = "S001";

    fn workflow_with(customers: Arc<dyn CustomerProvider>) -> RenewalWorkflow {
        let manager = WorkflowSessionManager::new(
            Arc::new(InMemorySessionStore::new()),
            DEFAULT_SESSION_TTL,
        );
        RenewalWorkflow::new(
            Arc::new(manager),
            customers,
            Arc::new(SimulatedInventoryProvider),
            Arc::new(SimulatedPromotionProvider),
            "STORE001",
        )
    }

    fn workflow() -> RenewalWorkflow {
        workflow_with(Arc::new(SimulatedCustomerProvider::new()))
    }

    async fn current_step(workflow: &RenewalWorkflow, session_id: &str) -> WorkflowStep {
        workflow.session(STAFF, session_id).await.expect("session").current_step
    }

    /// Runs the happy path up to `select_device_type` and returns the session id.
    async fn eligible_session(workflow: &RenewalWorkflow) -> String {
        let started = workflow.start(STAFF).await.expect("start");
        let id = started.session_id;
        workflow.query_customer(STAFF, &id, "A123456789").await.expect("customer");
        workflow.list_phones(STAFF, &id).await.expect("phones");
        let outcome = workflow.select_phone(STAFF, &id, "0912345678").await.expect("phone");
        assert!(outcome.eligible);
        id
    }

    async fn ios_device_session(workflow: &RenewalWorkflow) -> String {
        let id = eligible_session(workflow).await;
        workflow.select_device_type(STAFF, &id, "smartphone").await.expect("type");
        workflow.select_device_os(STAFF, &id, "iOS").await.expect("os");
        workflow.select_device(STAFF, &id, "DEV001", Some("藍色")).await.expect("device");
        id
    }

    #[tokio::test]
    async fn renewal_without_device_reaches_plan_list() {
        let workflow = workflow();
        let started = workflow.start(STAFF).await.expect("start");
        assert_eq!(started.current_step, WorkflowStep::Init);
        let id = started.session_id;

        let found = workflow.query_customer(STAFF, &id, "A123456789").await.expect("customer");
        assert_eq!(found.customer.customer_id, "C123456");
        assert_eq!(found.next_step, WorkflowStep::ListPhones);

        let listing = workflow.list_phones(STAFF, &id).await.expect("phones");
        assert_eq!(listing.phones.len(), 2);
        assert!(listing.phones.iter().all(|phone| phone.contract.is_some()));
        assert_eq!(current_step(&workflow, &id).await, WorkflowStep::SelectPhone);

        let outcome = workflow.select_phone(STAFF, &id, "0912345678").await.expect("phone");
        assert!(outcome.eligible);
        assert_eq!(outcome.next_step, WorkflowStep::SelectDeviceType);

        let chosen = workflow.select_device_type(STAFF, &id, "none").await.expect("type");
        assert_eq!(chosen.next_step, WorkflowStep::ListPlans);

        let session = workflow.session(STAFF, &id).await.expect("session");
        assert_eq!(session.current_step, WorkflowStep::ListPlans);
        assert_eq!(session.selection_str(SelectionField::DeviceType), Some("none"));
        let device = session.selection(SelectionField::Device).expect("placeholder device");
        assert_eq!(device["device_id"], Value::from("none"));
        assert_eq!(device["model"], Value::from("單純續約"));
    }

    #[tokio::test]
    async fn ineligible_number_stays_at_check_eligibility() {
        let workflow = workflow();
        let id = workflow.start(STAFF).await.expect("start").session_id;
        workflow.query_customer(STAFF, &id, "A123456789").await.expect("customer");
        workflow.list_phones(STAFF, &id).await.expect("phones");

        let outcome = workflow.select_phone(STAFF, &id, "0987654321").await.expect("phone");

        assert!(!outcome.eligible);
        assert_eq!(outcome.next_step, WorkflowStep::CheckEligibility);
        assert!(outcome.eligibility.details.iter().any(|check| check.message.contains("天才到期")));

        let blocked = workflow.select_device_type(STAFF, &id, "smartphone").await;
        assert_eq!(
            blocked,
            Err(ApplicationError::Domain(DomainError::StepNotReachable {
                step: WorkflowStep::SelectDeviceType,
                current: WorkflowStep::CheckEligibility,
            }))
        );
        assert_eq!(current_step(&workflow, &id).await, WorkflowStep::CheckEligibility);
    }

    #[tokio::test]
    async fn ineligible_number_can_be_replaced_by_an_eligible_one() {
        let workflow = workflow();
        let id = workflow.start(STAFF).await.expect("start").session_id;
        workflow.query_customer(STAFF, &id, "A123456789").await.expect("customer");
        workflow.list_phones(STAFF, &id).await.expect("phones");
        workflow.select_phone(STAFF, &id, "0987654321").await.expect("ineligible");

        let outcome = workflow.select_phone(STAFF, &id, "0912345678").await.expect("retry");

        assert!(outcome.eligible);
        let session = workflow.session(STAFF, &id).await.expect("session");
        assert_eq!(session.current_step, WorkflowStep::SelectDeviceType);
        assert_eq!(session.selection_str(SelectionField::SelectedPhoneNumber), Some("0912345678"));
    }

    #[tokio::test]
    async fn unknown_and_foreign_customers_are_rejected() {
        let workflow = workflow();
        let id = workflow.start(STAFF).await.expect("start").session_id;

        assert_eq!(
            workflow.query_customer(STAFF, &id, "Z000000000").await,
            Err(ApplicationError::NotFound("查無此客戶".to_string()))
        );
        assert_eq!(
            workflow.query_customer(STAFF, &id, "C111222333").await,
            Err(ApplicationError::Validation("非本公司客戶".to_string()))
        );
        assert_eq!(current_step(&workflow, &id).await, WorkflowStep::Init);
    }

    #[tokio::test]
    async fn backtracking_to_number_selection_clears_downstream_choices() {
        let workflow = workflow();
        let id = eligible_session(&workflow).await;
        workflow.select_device_type(STAFF, &id, "none").await.expect("type");
        workflow.select_plan(STAFF, &id, "PLAN003").await.expect("plan");

        let outcome = workflow.select_phone(STAFF, &id, "0912345678").await.expect("re-select");

        assert_eq!(outcome.next_step, WorkflowStep::SelectDeviceType);
        let session = workflow.session(STAFF, &id).await.expect("session");
        assert_eq!(session.selection_str(SelectionField::CustomerId), Some("C123456"));
        assert_eq!(session.selection_str(SelectionField::SelectedPhoneNumber), Some("0912345678"));
        for field in [SelectionField::DeviceType, SelectionField::Device, SelectionField::SelectedPlan] {
            assert!(!session.has_selection(field), "{} survived the rewind", field.as_str());
        }
    }

    #[tokio::test]
    async fn backtracking_from_a_chosen_device_clears_os_and_device() {
        let workflow = workflow();
        let id = ios_device_session(&workflow).await;
        workflow.select_plan(STAFF, &id, "PLAN003").await.expect("plan");

        workflow.select_phone(STAFF, &id, "0912345678").await.expect("re-select");

        let session = workflow.session(STAFF, &id).await.expect("session");
        assert_eq!(session.current_step, WorkflowStep::SelectDeviceType);
        for field in [
            SelectionField::DeviceType,
            SelectionField::DeviceOs,
            SelectionField::Device,
            SelectionField::SelectedPlan,
        ] {
            assert!(!session.has_selection(field), "{} survived the rewind", field.as_str());
        }
    }

    #[tokio::test]
    async fn backtracking_to_customer_query_restarts_from_the_top() {
        let workflow = workflow();
        let id = eligible_session(&workflow).await;

        let found = workflow.query_customer(STAFF, &id, "B987654321").await.expect("other");

        assert_eq!(found.customer.customer_id, "C987654");
        let session = workflow.session(STAFF, &id).await.expect("session");
        assert_eq!(session.current_step, WorkflowStep::ListPhones);
        assert!(!session.has_selection(SelectionField::SelectedPhoneNumber));
        assert!(!session.has_selection(SelectionField::EligibilityCheck));
    }

    #[tokio::test]
    async fn device_os_is_normalized_to_lowercase() {
        let workflow = workflow();
        let id = eligible_session(&workflow).await;
        workflow.select_device_type(STAFF, &id, "smartphone").await.expect("type");

        let chosen = workflow.select_device_os(STAFF, &id, "iOS").await.expect("os");

        assert_eq!(chosen.os_type, "ios");
        assert_eq!(chosen.next_step, WorkflowStep::SelectDevice);
        let session = workflow.session(STAFF, &id).await.expect("session");
        assert_eq!(session.selection_str(SelectionField::DeviceOs), Some("ios"));
    }

    #[tokio::test]
    async fn invalid_device_inputs_are_validation_errors() {
        let workflow = workflow();
        let id = eligible_session(&workflow).await;

        assert!(matches!(
            workflow.select_device_type(STAFF, &id, "laptop").await,
            Err(ApplicationError::Validation(_))
        ));
        workflow.select_device_type(STAFF, &id, "tablet").await.expect("type");
        assert!(matches!(
            workflow.select_device_os(STAFF, &id, "windows").await,
            Err(ApplicationError::Validation(_))
        ));
        assert_eq!(current_step(&workflow, &id).await, WorkflowStep::SelectDeviceOs);
    }

    #[tokio::test]
    async fn choosing_os_after_skipping_the_device_is_a_precondition_error() {
        let workflow = workflow();
        let id = eligible_session(&workflow).await;
        workflow.select_device_type(STAFF, &id, "none").await.expect("type");

        let result = workflow.select_device_os(STAFF, &id, "android").await;

        assert!(matches!(result, Err(ApplicationError::Domain(DomainError::Precondition(_)))));
        assert_eq!(current_step(&workflow, &id).await, WorkflowStep::ListPlans);
    }

    #[tokio::test]
    async fn device_selection_records_stock_and_color() {
        let workflow = workflow();
        let id = ios_device_session(&workflow).await;

        let session = workflow.session(STAFF, &id).await.expect("session");
        assert_eq!(session.current_step, WorkflowStep::ListPlans);
        let device = session.selection(SelectionField::Device).expect("device");
        assert_eq!(device["device_id"], Value::from("DEV001"));
        assert_eq!(device["color"], Value::from("藍色"));
        assert_eq!(device["os"], Value::from("iOS"));
    }

    #[tokio::test]
    async fn unknown_device_is_not_found_and_color_defaults() {
        let workflow = workflow();
        let id = eligible_session(&workflow).await;
        workflow.select_device_type(STAFF, &id, "smartphone").await.expect("type");
        workflow.select_device_os(STAFF, &id, "android").await.expect("os");

        assert_eq!(
            workflow.select_device(STAFF, &id, "DEV999", None).await,
            Err(ApplicationError::NotFound("設備不存在".to_string()))
        );
        let devices = workflow.query_devices(STAFF, &id, None, None, None).await.expect("devices");
        assert_eq!(devices.store_id, "STORE001");
        assert!(devices.devices.iter().all(|device| device.os.eq_ignore_ascii_case("android")));

        let first = devices.devices[0].device_id.clone();
        let chosen = workflow.select_device(STAFF, &id, &first, None).await.expect("device");
        assert_eq!(chosen.color, "default");
        assert_eq!(chosen.next_step, WorkflowStep::ListPlans);
    }

    #[tokio::test]
    async fn plan_list_dedupes_by_plan_and_reports_query() {
        let workflow = workflow();
        let id = eligible_session(&workflow).await;
        workflow.select_device_type(STAFF, &id, "none").await.expect("type");

        let listing = workflow.list_plans(STAFF, &id).await.expect("plans");

        assert_eq!(listing.search_query, "單純續約 不搭配裝置");
        let ids: Vec<&str> = listing.plans.iter().map(|plan| plan.plan_id.as_str()).collect();
        assert_eq!(ids, vec!["PLAN001", "PLAN002", "PLAN003", "PLAN004", "PLAN005", "PLAN006", "PLAN007"]);
        assert_eq!(listing.plans[0].promotion_id, "PROMO004");
        assert_eq!(current_step(&workflow, &id).await, WorkflowStep::ListPlans);
    }

    #[tokio::test]
    async fn plan_shopping_loop_moves_between_list_and_compare() {
        let workflow = workflow();
        let id = eligible_session(&workflow).await;
        workflow.select_device_type(STAFF, &id, "none").await.expect("type");

        assert!(matches!(
            workflow.compare_plans(STAFF, &id, &["PLAN001".to_string()]).await,
            Err(ApplicationError::Validation(_))
        ));

        let ids = vec!["PLAN001".to_string(), "PLAN003".to_string()];
        let outcome = workflow.compare_plans(STAFF, &id, &ids).await.expect("compare");
        assert_eq!(outcome.comparison.plans.len(), 2);
        assert_eq!(current_step(&workflow, &id).await, WorkflowStep::ComparePlans);

        workflow.compare_plans(STAFF, &id, &ids).await.expect("compare again");
        assert_eq!(current_step(&workflow, &id).await, WorkflowStep::ComparePlans);

        workflow.list_plans(STAFF, &id).await.expect("back to list");
        assert_eq!(current_step(&workflow, &id).await, WorkflowStep::ListPlans);
    }

    #[tokio::test]
    async fn comparing_unknown_plans_is_not_found_and_keeps_the_step() {
        let workflow = workflow();
        let id = eligible_session(&workflow).await;
        workflow.select_device_type(STAFF, &id, "none").await.expect("type");

        let ids = vec!["PLAN404".to_string(), "PLAN405".to_string()];
        let result = workflow.compare_plans(STAFF, &id, &ids).await;

        assert!(matches!(result, Err(ApplicationError::NotFound(ref message)) if message == "沒有找到有效的方案"));
        assert_eq!(current_step(&workflow, &id).await, WorkflowStep::ListPlans);
    }

    #[tokio::test]
    async fn recommendations_follow_the_chosen_os_without_moving_the_step() {
        let workflow = workflow();
        let id = eligible_session(&workflow).await;
        workflow.select_device_type(STAFF, &id, "smartphone").await.expect("type");

        let early = workflow.recommend_devices(STAFF, &id, None, 40_000, None).await;
        assert!(matches!(
            early,
            Err(ApplicationError::Domain(DomainError::Precondition(ref message))) if message == "請先選擇作業系統"
        ));

        workflow.select_device_os(STAFF, &id, "iOS").await.expect("os");
        let picks = workflow.recommend_devices(STAFF, &id, None, 40_000, None).await.expect("picks");

        assert_eq!(picks.store_id, "STORE001");
        assert_eq!(picks.os_preference, "ios");
        assert_eq!(picks.recommendation_count, 3);
        assert_eq!(picks.recommendations[0].device_id, "DEV001");
        assert!(picks.reason.contains("iPhone 15 Pro"));
        assert_eq!(current_step(&workflow, &id).await, WorkflowStep::SelectDevice);

        let invalid = workflow.recommend_devices(STAFF, &id, None, 0, None).await;
        assert!(matches!(invalid, Err(ApplicationError::Validation(_))));
        let unknown_store = workflow.recommend_devices(STAFF, &id, Some("STORE999"), 40_000, None).await;
        assert!(matches!(unknown_store, Err(ApplicationError::NotFound(_))));
    }

    #[tokio::test]
    async fn promotion_search_defaults_to_five_results() {
        let workflow = workflow();
        let id = eligible_session(&workflow).await;

        let found = workflow
            .search_promotions(STAFF, &id, "單純續約 不搭配裝置", None)
            .await
            .expect("search");
        assert_eq!(found.total, 5);
        assert_eq!(found.promotions.len(), 5);
        assert_eq!(found.query, "單純續約 不搭配裝置");

        let narrowed = workflow
            .search_promotions(STAFF, &id, "單純續約 不搭配裝置", Some(2))
            .await
            .expect("search");
        assert_eq!(narrowed.total, 2);

        assert!(matches!(
            workflow.search_promotions(STAFF, &id, "  ", None).await,
            Err(ApplicationError::Validation(_))
        ));
        assert!(matches!(
            workflow.search_promotions(STAFF, &id, "續約", Some(0)).await,
            Err(ApplicationError::Validation(_))
        ));
        assert_eq!(current_step(&workflow, &id).await, WorkflowStep::SelectDeviceType);
    }

    #[tokio::test]
    async fn upgrade_quote_can_leave_the_device_out() {
        let workflow = workflow();
        let id = ios_device_session(&workflow).await;

        let with_device =
            workflow.upgrade_cost(STAFF, &id, "PLAN001", true).await.expect("quote").cost_details;
        assert_eq!(with_device.current_plan_fee, 999);
        assert_eq!(with_device.monthly_diff, 400);
        assert_eq!(with_device.device_price, 36_900);
        assert_eq!(with_device.final_device_price, 36_900 - 12_000);
        assert_eq!(with_device.total_cost, 1399 * 30 + 24_900);
        assert_eq!(with_device.contract_type, "續約");

        let plan_only =
            workflow.upgrade_cost(STAFF, &id, "PLAN001", false).await.expect("quote").cost_details;
        assert_eq!(plan_only.device_price, 0);
        assert_eq!(plan_only.total_cost, 1399 * 30);

        let missing = workflow.upgrade_cost(STAFF, &id, "PLAN404", true).await;
        assert!(matches!(missing, Err(ApplicationError::NotFound(_))));
        let session = workflow.session(STAFF, &id).await.expect("session");
        assert_eq!(session.current_step, WorkflowStep::ListPlans);
        assert!(session.selection(SelectionField::SelectedPlan).is_none());
    }

    #[tokio::test]
    async fn plan_selection_from_confirm_rewinds_and_replaces_the_plan() {
        let workflow = workflow();
        let id = ios_device_session(&workflow).await;
        workflow.select_plan(STAFF, &id, "PLAN001").await.expect("first plan");
        assert_eq!(current_step(&workflow, &id).await, WorkflowStep::Confirm);

        let chosen = workflow.select_plan(STAFF, &id, "PLAN002").await.expect("second plan");

        assert_eq!(chosen.next_step, WorkflowStep::Confirm);
        assert_eq!(chosen.selected_plan.plan_id, "PLAN002");
        assert_eq!(chosen.selected_plan.cost_details.current_plan_fee, 999);
        assert!(chosen.selected_plan.cost_details.device_price > 0);
        let session = workflow.session(STAFF, &id).await.expect("session");
        assert_eq!(session.selection_str(SelectionField::DeviceOs), Some("ios"));
        assert!(session.has_selection(SelectionField::Device));
    }

    #[tokio::test]
    async fn confirm_and_submit_complete_the_renewal() {
        let workflow = workflow();
        let id = ios_device_session(&workflow).await;
        let chosen = workflow.select_plan(STAFF, &id, "PLAN001").await.expect("plan");

        let summary = workflow.confirm(STAFF, &id).await.expect("summary");
        assert_eq!(summary.customer.name, "張三");
        assert_eq!(summary.customer.contract_type, "續約");
        assert_eq!(summary.phone.phone_number, "0912345678");
        assert_eq!(summary.contract.remaining_months, 1);
        assert_eq!(summary.selected_device.as_ref().map(|device| device.color.as_str()), Some("藍色"));
        assert_eq!(summary.total_amount, chosen.selected_plan.cost_details.final_device_price);

        let submitted = workflow.submit(STAFF, &id).await.expect("submit");
        assert!(submitted.order_number.starts_with("ORD"));
        assert!(submitted.order_number.ends_with(&id[id.len() - 6..]));
        assert_eq!(submitted.current_step, WorkflowStep::Completed);

        let session = workflow.session(STAFF, &id).await.expect("session");
        assert_eq!(session.metadata.get("order_number"), Some(&Value::from(submitted.order_number)));
        assert!(session.metadata.contains_key("completed_at"));

        assert_eq!(
            workflow.submit(STAFF, &id).await,
            Err(ApplicationError::Domain(DomainError::IllegalTransition {
                from: WorkflowStep::Completed,
                to: WorkflowStep::Completed,
            }))
        );
        assert!(matches!(
            workflow.select_plan(STAFF, &id, "PLAN002").await,
            Err(ApplicationError::Domain(DomainError::StepNotReachable { .. }))
        ));
    }

    #[tokio::test]
    async fn confirm_before_plan_selection_is_not_reachable() {
        let workflow = workflow();
        let id = eligible_session(&workflow).await;

        assert_eq!(
            workflow.confirm(STAFF, &id).await,
            Err(ApplicationError::Domain(DomainError::StepNotReachable {
                step: WorkflowStep::Confirm,
                current: WorkflowStep::SelectDeviceType,
            }))
        );
    }

    #[tokio::test]
    async fn sessions_are_private_to_their_owner() {
        let workflow = workflow();
        let id = workflow.start(STAFF).await.expect("start").session_id;

        assert!(matches!(workflow.session("S002", &id).await, Err(ApplicationError::Forbidden(_))));
        assert!(matches!(
            workflow.query_customer("S002", &id, "A123456789").await,
            Err(ApplicationError::Forbidden(_))
        ));
        assert!(matches!(
            workflow.add_chat_message("S002", &id, ChatRole::User, "hi").await,
            Err(ApplicationError::Forbidden(_))
        ));
        assert!(matches!(workflow.delete("S002", &id).await, Err(ApplicationError::Forbidden(_))));

        workflow.add_chat_message(STAFF, &id, ChatRole::User, "客戶想換手機").await.expect("chat");
        workflow.delete(STAFF, &id).await.expect("delete");
        assert!(matches!(workflow.session(STAFF, &id).await, Err(ApplicationError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_phones_after_selection_is_a_read_only_view() {
        let workflow = workflow();
        let id = eligible_session(&workflow).await;
        let before = workflow.session(STAFF, &id).await.expect("session");

        workflow.list_phones(STAFF, &id).await.expect("view");

        let after = workflow.session(STAFF, &id).await.expect("session");
        assert_eq!(before, after);
    }

    struct FailingEligibility(SimulatedCustomerProvider);

    #[async_trait]
    impl CustomerProvider for FailingEligibility {
        async fn find_customer(&self, id_number: &str) -> Result<Option<Customer>, ProviderError> {
            self.0.find_customer(id_number).await
        }

        async fn list_numbers(&self, customer_id: &str) -> Result<Vec<PhoneLine>, ProviderError> {
            self.0.list_numbers(customer_id).await
        }

        async fn get_contract(&self, phone_number: &str) -> Result<Option<Contract>, ProviderError> {
            self.0.get_contract(phone_number).await
        }

        async fn get_usage(&self, phone_number: &str) -> Result<Option<Usage>, ProviderError> {
            self.0.get_usage(phone_number).await
        }

        async fn get_billing(&self, phone_number: &str) -> Result<Option<Billing>, ProviderError> {
            self.0.get_billing(phone_number).await
        }

        async fn check_eligibility(
            &self,
            _phone_number: &str,
            _customer_id: &str,
        ) -> Result<Eligibility, ProviderError> {
            Err(ProviderError::Timeout { provider: "crm", operation: "check_eligibility".to_string() })
        }
    }

    #[tokio::test]
    async fn provider_failure_leaves_session_untouched() {
        let workflow = workflow_with(Arc::new(FailingEligibility(SimulatedCustomerProvider::new())));
        let id = workflow.start(STAFF).await.expect("start").session_id;
        workflow.query_customer(STAFF, &id, "A123456789").await.expect("customer");
        workflow.list_phones(STAFF, &id).await.expect("phones");
        let before = workflow.session(STAFF, &id).await.expect("session");

        let result = workflow.select_phone(STAFF, &id, "0912345678").await;

        assert!(matches!(result, Err(ApplicationError::Upstream(_))));
        assert_eq!(workflow.session(STAFF, &id).await.expect("session"), before);
    }

    #[test]
    fn order_number_uses_date_and_session_tail() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).single().expect("valid time");
        assert_eq!(order_number("renewal_S001_0123456789abcdef", now), "ORD20260301abcdef");
        assert_eq!(order_number("abc", now), "ORD20260301abc");
    }

    #[test]
    fn search_query_describes_the_device() {
        assert_eq!(plan_search_query("none", None, None), "單純續約 不搭配裝置");
        assert_eq!(plan_search_query("smartphone", Some("android"), None), "續約搭配裝置 android");
    }
}
