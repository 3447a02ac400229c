//! Narrow query interfaces over the customer, inventory and promotion backends.
//!
//! The workflow never knows whether a provider is the in-process simulated dataset or a
//! remote tool server; both sides speak the records defined here.

pub mod simulated;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use simulated::{SimulatedCustomerProvider, SimulatedInventoryProvider, SimulatedPromotionProvider};

/// Contract type every renewal is priced under.
pub const RENEWAL_CONTRACT_TYPE: &str = "續約";
/// Contract type that earns the number-portability device discount.
pub const PORT_IN_CONTRACT_TYPE: &str = "攜碼";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub customer_id: String,
    pub id_number: String,
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    pub is_company_customer: bool,
    #[serde(default)]
    pub credit_score: u32,
    #[serde(default)]
    pub blacklist: bool,
    #[serde(default)]
    pub registration_date: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneLine {
    pub phone_number: String,
    pub plan_name: String,
    pub contract_status: String,
    pub contract_end_date: NaiveDate,
    pub monthly_fee: i64,
    #[serde(default)]
    pub is_primary: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub phone_number: String,
    pub plan_id: String,
    pub plan_name: String,
    pub monthly_fee: i64,
    pub data_limit: String,
    pub voice_minutes: u32,
    pub contract_start_date: NaiveDate,
    pub contract_end_date: NaiveDate,
    pub contract_months: u32,
    pub months_used: u32,
    pub early_termination_fee: i64,
    pub device: String,
    pub device_subsidy: i64,
    pub status: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub phone_number: String,
    pub data_used_gb: f64,
    pub data_limit_gb: f64,
    pub voice_used_minutes: u32,
    pub voice_limit_minutes: u32,
    pub average_daily_data_mb: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Billing {
    pub phone_number: String,
    pub current_month_fee: i64,
    pub outstanding_balance: i64,
    pub payment_history_good: bool,
    pub last_payment_date: NaiveDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityCheck {
    pub item: String,
    pub status: CheckStatus,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub eligible: bool,
    pub reason: String,
    pub details: Vec<EligibilityCheck>,
    #[serde(default)]
    pub contract_end_date: Option<NaiveDate>,
    #[serde(default)]
    pub days_to_expiry: Option<i64>,
}

impl Eligibility {
    /// Verdict for a number the CRM holds no contract for.
    pub fn no_contract() -> Self {
        Self {
            eligible: false,
            reason: "找不到合約資訊".to_string(),
            details: Vec::new(),
            contract_end_date: None,
            days_to_expiry: None,
        }
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &EligibilityCheck> {
        self.details.iter().filter(|check| check.status == CheckStatus::Fail)
    }
}

/// A device model with its stock level at one store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockedDevice {
    pub device_id: String,
    pub brand: String,
    pub model: String,
    pub storage: String,
    pub color: String,
    pub os: String,
    pub price: i64,
    pub market_price: i64,
    pub total_quantity: u32,
    pub reserved: u32,
    pub available: u32,
    pub in_stock: bool,
    #[serde(default)]
    pub screen_size: Option<String>,
    #[serde(default)]
    pub camera: Option<String>,
    #[serde(default)]
    pub chip: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceQuery {
    pub store_id: String,
    #[serde(default)]
    pub os_filter: Option<String>,
    #[serde(default)]
    pub min_price: Option<i64>,
    #[serde(default)]
    pub max_price: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendationQuery {
    pub store_id: String,
    pub os_preference: String,
    pub budget: i64,
    #[serde(default)]
    pub is_flagship: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendedDevice {
    pub device_id: String,
    pub brand: String,
    pub model: String,
    pub storage: String,
    pub color: String,
    pub price: i64,
    pub market_price: i64,
    pub discount: i64,
    pub is_flagship: bool,
    pub popularity_score: u32,
    pub available: u32,
    pub recommendation_score: u32,
    #[serde(default)]
    pub screen_size: Option<String>,
    #[serde(default)]
    pub camera: Option<String>,
    #[serde(default)]
    pub chip: Option<String>,
}

/// Ranked picks with the sentence the counter reads out to the customer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendations {
    pub recommendations: Vec<RecommendedDevice>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promotion {
    pub promotion_id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub benefits: Vec<String>,
    #[serde(default)]
    pub contract_types: Vec<String>,
    pub plans: Vec<String>,
    pub priority: u32,
    #[serde(default)]
    pub relevance_score: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionRef {
    pub promotion_id: String,
    pub title: String,
    #[serde(default)]
    pub benefits: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub name: String,
    pub monthly_fee: i64,
    pub contract_months: u32,
    pub data: String,
    pub voice: String,
    #[serde(default)]
    pub sms: u32,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub suitable_for: Vec<String>,
    #[serde(default)]
    pub upgrade_benefits: Option<String>,
    #[serde(default)]
    pub applicable_promotions: Vec<PromotionRef>,
}

impl Plan {
    /// Device discount advertised in the upgrade benefit text, e.g. `享手機折扣 $12,000`.
    pub fn device_discount(&self) -> i64 {
        self.upgrade_benefits.as_deref().and_then(parse_dollar_amount).unwrap_or(0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRange {
    pub min: i64,
    pub max: i64,
    pub values: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanComparison {
    pub plans: Vec<Plan>,
    pub monthly_fee: FeeRange,
    pub data: Map<String, Value>,
    pub voice: Map<String, Value>,
    pub contract_months: Map<String, Value>,
    pub recommendation: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeCostRequest {
    pub current_plan_fee: i64,
    pub new_plan_id: String,
    pub device_price: i64,
    pub contract_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeCost {
    pub plan_id: String,
    pub current_plan_fee: i64,
    pub monthly_diff: i64,
    pub total_contract_cost: i64,
    pub device_price: i64,
    pub device_discount: i64,
    pub final_device_price: i64,
    pub total_cost: i64,
    pub contract_type: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("{provider} rejected `{operation}`: {code}: {message}")]
    Rejected { provider: &'static str, operation: String, code: String, message: String },
    #[error("{provider} call `{operation}` failed: {message}")]
    Transport { provider: &'static str, operation: String, message: String },
    #[error("{provider} call `{operation}` timed out")]
    Timeout { provider: &'static str, operation: String },
    #[error("{provider} returned an unreadable `{operation}` payload: {message}")]
    Decode { provider: &'static str, operation: String, message: String },
    #[error("unknown store `{0}`")]
    UnknownStore(String),
}

#[async_trait]
pub trait CustomerProvider: Send + Sync {
    async fn find_customer(&self, id_number: &str) -> Result<Option<Customer>, ProviderError>;
    async fn list_numbers(&self, customer_id: &str) -> Result<Vec<PhoneLine>, ProviderError>;
    async fn get_contract(&self, phone_number: &str) -> Result<Option<Contract>, ProviderError>;
    async fn get_usage(&self, phone_number: &str) -> Result<Option<Usage>, ProviderError>;
    async fn get_billing(&self, phone_number: &str) -> Result<Option<Billing>, ProviderError>;
    async fn check_eligibility(
        &self,
        phone_number: &str,
        customer_id: &str,
    ) -> Result<Eligibility, ProviderError>;
}

#[async_trait]
pub trait InventoryProvider: Send + Sync {
    async fn list_devices(&self, query: &DeviceQuery) -> Result<Vec<StockedDevice>, ProviderError>;
    async fn recommend_devices(
        &self,
        query: &RecommendationQuery,
    ) -> Result<Recommendations, ProviderError>;
}

#[async_trait]
pub trait PromotionProvider: Send + Sync {
    async fn search_promotions(
        &self,
        query: &str,
        contract_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Promotion>, ProviderError>;
    async fn plan_details(&self, plan_id: &str) -> Result<Option<Plan>, ProviderError>;
    async fn compare(&self, plan_ids: &[String]) -> Result<PlanComparison, ProviderError>;
    async fn calculate_upgrade_cost(
        &self,
        request: &UpgradeCostRequest,
    ) -> Result<Option<UpgradeCost>, ProviderError>;
}

/// Builds the side-by-side view of a set of plans.
pub fn build_comparison(plans: Vec<Plan>) -> Option<PlanComparison> {
    let min = plans.iter().map(|plan| plan.monthly_fee).min()?;
    let max = plans.iter().map(|plan| plan.monthly_fee).max()?;

    let column = |value: fn(&Plan) -> Value| -> Map<String, Value> {
        plans.iter().map(|plan| (plan.plan_id.clone(), value(plan))).collect()
    };
    let fees = column(|plan| Value::from(plan.monthly_fee));
    let data = column(|plan| Value::from(plan.data.clone()));
    let voice = column(|plan| Value::from(plan.voice.clone()));
    let contract_months = column(|plan| Value::from(plan.contract_months));
    let recommendation = recommend(&plans);

    Some(PlanComparison {
        plans,
        monthly_fee: FeeRange { min, max, values: fees },
        data,
        voice,
        contract_months,
        recommendation,
    })
}

fn recommend(plans: &[Plan]) -> String {
    match plans {
        [] => "無法提供建議".to_string(),
        [only] => format!("目前只有一個方案 {}", only.name),
        _ => {
            let mut parts = Vec::new();
            if let Some(cheapest) = plans.iter().min_by_key(|plan| plan.monthly_fee) {
                parts.push(format!(
                    "最經濟實惠：{} (月租 ${})",
                    cheapest.name, cheapest.monthly_fee
                ));
            }
            if let Some(unlimited) = plans.iter().find(|plan| plan.data.contains("無限")) {
                parts.push(format!("重度使用者：{} (上網吃到飽)", unlimited.name));
            }
            parts.join(" | ")
        }
    }
}

/// Prices the move onto `plan` for a customer currently paying `request.current_plan_fee`.
pub fn price_upgrade(plan: &Plan, request: &UpgradeCostRequest) -> UpgradeCost {
    let total_contract_cost = plan.monthly_fee * i64::from(plan.contract_months);
    let device_discount = plan.device_discount();
    let mut final_device_price = (request.device_price - device_discount).max(0);
    if request.contract_type == PORT_IN_CONTRACT_TYPE {
        let portability_discount = request.device_price * 15 / 100;
        final_device_price = (final_device_price - portability_discount).max(0);
    }

    UpgradeCost {
        plan_id: plan.plan_id.clone(),
        current_plan_fee: request.current_plan_fee,
        monthly_diff: plan.monthly_fee - request.current_plan_fee,
        total_contract_cost,
        device_price: request.device_price,
        device_discount,
        final_device_price,
        total_cost: total_contract_cost + final_device_price,
        contract_type: request.contract_type.clone(),
    }
}

fn parse_dollar_amount(text: &str) -> Option<i64> {
    let (_, rest) = text.split_once('$')?;
    let digits: String = rest
        .chars()
        .take_while(|ch| ch.is_ascii_digit() || *ch == ',')
        .filter(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}
