//! Tool-server clients for the CRM, POS and promotion backends.
//!
//! Every backend exposes the same envelope: `POST {base}/mcp/call` with `{tool, arguments}`,
//! answered by `{success, data | result, error: {code, message}}`. A `*NOT_FOUND` error code
//! reads as an absent record rather than a failure.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use renewdesk_core::providers::{
    build_comparison, Billing, CheckStatus, Contract, Customer, CustomerProvider, DeviceQuery,
    Eligibility, EligibilityCheck, InventoryProvider, PhoneLine, Plan, PlanComparison, Promotion,
    PromotionProvider, ProviderError, RecommendationQuery, Recommendations, StockedDevice,
    UpgradeCost, UpgradeCostRequest, Usage,
};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

const NOT_FOUND_CODE_SUFFIX: &str = "NOT_FOUND";
const SINGLE_LINE_RENEWAL: &str = "single";

#[derive(Debug, Deserialize)]
struct ToolEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ToolFault>,
}

#[derive(Debug, Default, Deserialize)]
struct ToolFault {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Clone, Debug)]
pub struct ToolClient {
    client: Client,
    base_url: String,
    provider: &'static str,
    timeout: Duration,
}

impl ToolClient {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        provider: &'static str,
        timeout: Duration,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url, provider, timeout }
    }

    /// Invokes one tool. `Ok(None)` when the backend reports the subject does not exist.
    pub async fn call(&self, tool: &str, arguments: Value) -> Result<Option<Value>, ProviderError> {
        let url = format!("{}/mcp/call", self.base_url);
        let payload = json!({ "tool": tool, "arguments": arguments });

        let exchange = async {
            let response = self.client.post(&url).json(&payload).send().await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        let (status, body) = match tokio::time::timeout(self.timeout, exchange).await {
            Err(_) => {
                warn!(
                    event_name = "provider.call.timeout",
                    provider = self.provider,
                    tool,
                    timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    "provider call timed out"
                );
                return Err(ProviderError::Timeout {
                    provider: self.provider,
                    operation: tool.to_string(),
                });
            }
            Ok(Err(error)) => {
                warn!(
                    event_name = "provider.call.transport_error",
                    provider = self.provider,
                    tool,
                    error = %error,
                    "provider call failed"
                );
                return Err(self.transport(tool, error.to_string()));
            }
            Ok(Ok(parts)) => parts,
        };

        let envelope: ToolEnvelope = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(error) if status.is_success() => {
                return Err(ProviderError::Decode {
                    provider: self.provider,
                    operation: tool.to_string(),
                    message: error.to_string(),
                });
            }
            Err(_) => return Err(self.transport(tool, format!("HTTP {status}"))),
        };

        if envelope.success {
            debug!(event_name = "provider.call.ok", provider = self.provider, tool, "tool call succeeded");
            return Ok(envelope.data.or(envelope.result).filter(|value| !value.is_null()));
        }

        let fault = envelope.error.unwrap_or_default();
        if fault.code.ends_with(NOT_FOUND_CODE_SUFFIX) {
            return Ok(None);
        }
        let code = if fault.code.is_empty() { format!("HTTP_{}", status.as_u16()) } else { fault.code };
        Err(ProviderError::Rejected {
            provider: self.provider,
            operation: tool.to_string(),
            code,
            message: fault.message,
        })
    }

    async fn call_as<T: DeserializeOwned>(
        &self,
        tool: &str,
        arguments: Value,
    ) -> Result<Option<T>, ProviderError> {
        self.call(tool, arguments).await?.map(|value| self.decode(tool, value)).transpose()
    }

    fn decode<T: DeserializeOwned>(&self, tool: &str, value: Value) -> Result<T, ProviderError> {
        serde_json::from_value(value).map_err(|error| ProviderError::Decode {
            provider: self.provider,
            operation: tool.to_string(),
            message: error.to_string(),
        })
    }

    /// Lists may arrive bare or wrapped in an object under `key`.
    fn decode_list<T: DeserializeOwned>(
        &self,
        tool: &str,
        value: Option<Value>,
        key: &str,
    ) -> Result<Vec<T>, ProviderError> {
        match value {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => self.decode(tool, Value::Array(items)),
            Some(Value::Object(mut wrapper)) => match wrapper.remove(key) {
                Some(items) if !items.is_null() => self.decode(tool, items),
                _ => Ok(Vec::new()),
            },
            Some(other) => Err(ProviderError::Decode {
                provider: self.provider,
                operation: tool.to_string(),
                message: format!("expected a list under `{key}`, got {other}"),
            }),
        }
    }

    fn missing(&self, tool: &str, message: &str) -> ProviderError {
        ProviderError::Rejected {
            provider: self.provider,
            operation: tool.to_string(),
            code: NOT_FOUND_CODE_SUFFIX.to_string(),
            message: message.to_string(),
        }
    }

    fn transport(&self, tool: &str, message: String) -> ProviderError {
        ProviderError::Transport { provider: self.provider, operation: tool.to_string(), message }
    }
}

// ---------------------------------------------------------------------------
// CRM
// ---------------------------------------------------------------------------

pub struct HttpCustomerProvider {
    tools: ToolClient,
}

impl HttpCustomerProvider {
    pub fn new(tools: ToolClient) -> Self {
        Self { tools }
    }

    async fn phone_details<T: DeserializeOwned>(
        &self,
        phone_number: &str,
        section: &str,
    ) -> Result<Option<T>, ProviderError> {
        const TOOL: &str = "get_phone_details";
        let Some(Value::Object(mut details)) =
            self.tools.call(TOOL, json!({ "phone_number": phone_number })).await?
        else {
            return Ok(None);
        };
        details
            .remove(section)
            .filter(|value| !value.is_null())
            .map(|value| self.tools.decode(TOOL, value))
            .transpose()
    }
}

#[derive(Debug, Deserialize)]
struct RemoteEligibility {
    #[serde(default)]
    is_eligible: bool,
    #[serde(default)]
    details: Vec<EligibilityCheck>,
    #[serde(default)]
    reasons: Vec<String>,
    #[serde(default)]
    contract_end_date: Option<NaiveDate>,
    #[serde(default)]
    days_until_expiry: Option<i64>,
}

impl From<RemoteEligibility> for Eligibility {
    fn from(remote: RemoteEligibility) -> Self {
        let details = if remote.details.is_empty() {
            remote
                .reasons
                .into_iter()
                .map(|message| EligibilityCheck {
                    item: "資格檢查".to_string(),
                    status: CheckStatus::Fail,
                    message,
                })
                .collect()
        } else {
            remote.details
        };
        Self {
            eligible: remote.is_eligible,
            reason: (if remote.is_eligible { "符合續約資格" } else { "不符合續約資格" }).to_string(),
            details,
            contract_end_date: remote.contract_end_date,
            days_to_expiry: remote.days_until_expiry,
        }
    }
}

#[async_trait]
impl CustomerProvider for HttpCustomerProvider {
    async fn find_customer(&self, id_number: &str) -> Result<Option<Customer>, ProviderError> {
        self.tools.call_as("get_customer", json!({ "id_number": id_number })).await
    }

    async fn list_numbers(&self, customer_id: &str) -> Result<Vec<PhoneLine>, ProviderError> {
        const TOOL: &str = "list_customer_phones";
        let payload = self.tools.call(TOOL, json!({ "customer_id": customer_id })).await?;
        self.tools.decode_list(TOOL, payload, "phones")
    }

    async fn get_contract(&self, phone_number: &str) -> Result<Option<Contract>, ProviderError> {
        self.phone_details(phone_number, "contract_info").await
    }

    async fn get_usage(&self, phone_number: &str) -> Result<Option<Usage>, ProviderError> {
        self.phone_details(phone_number, "usage_info").await
    }

    async fn get_billing(&self, phone_number: &str) -> Result<Option<Billing>, ProviderError> {
        self.phone_details(phone_number, "billing_info").await
    }

    async fn check_eligibility(
        &self,
        phone_number: &str,
        customer_id: &str,
    ) -> Result<Eligibility, ProviderError> {
        const TOOL: &str = "check_renewal_eligibility";
        let arguments = json!({
            "phone_number": phone_number,
            "customer_id": customer_id,
            "renewal_type": SINGLE_LINE_RENEWAL,
        });
        Ok(self
            .tools
            .call_as::<RemoteEligibility>(TOOL, arguments)
            .await?
            .map_or_else(Eligibility::no_contract, Eligibility::from))
    }
}

// ---------------------------------------------------------------------------
// POS
// ---------------------------------------------------------------------------

pub struct HttpInventoryProvider {
    tools: ToolClient,
}

impl HttpInventoryProvider {
    pub fn new(tools: ToolClient) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl InventoryProvider for HttpInventoryProvider {
    async fn list_devices(&self, query: &DeviceQuery) -> Result<Vec<StockedDevice>, ProviderError> {
        const TOOL: &str = "query_device_stock";
        let arguments = json!({
            "store_id": query.store_id,
            "os_filter": query.os_filter,
            "min_price": query.min_price,
            "max_price": query.max_price,
        });
        match self.tools.call(TOOL, arguments).await? {
            None => Err(ProviderError::UnknownStore(query.store_id.clone())),
            payload => self.tools.decode_list(TOOL, payload, "devices"),
        }
    }

    async fn recommend_devices(
        &self,
        query: &RecommendationQuery,
    ) -> Result<Recommendations, ProviderError> {
        const TOOL: &str = "get_recommended_devices";
        let mut arguments = json!({
            "store_id": query.store_id,
            "os_preference": query.os_preference,
            "budget": query.budget,
        });
        if let Some(is_flagship) = query.is_flagship {
            arguments["is_flagship"] = Value::Bool(is_flagship);
        }
        self.tools
            .call_as::<Recommendations>(TOOL, arguments)
            .await?
            .ok_or_else(|| ProviderError::UnknownStore(query.store_id.clone()))
    }
}

// ---------------------------------------------------------------------------
// Promotions
// ---------------------------------------------------------------------------

pub struct HttpPromotionProvider {
    tools: ToolClient,
}

impl HttpPromotionProvider {
    pub fn new(tools: ToolClient) -> Self {
        Self { tools }
    }
}

#[derive(Debug, Deserialize)]
struct RemoteComparison {
    #[serde(default)]
    plans: Vec<Plan>,
}

#[async_trait]
impl PromotionProvider for HttpPromotionProvider {
    async fn search_promotions(
        &self,
        query: &str,
        contract_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Promotion>, ProviderError> {
        const TOOL: &str = "search_promotions";
        let arguments = json!({ "query": query, "contract_type": contract_type, "limit": limit });
        let payload = self.tools.call(TOOL, arguments).await?;
        let mut promotions: Vec<Promotion> = self.tools.decode_list(TOOL, payload, "promotions")?;
        promotions.truncate(limit);
        Ok(promotions)
    }

    async fn plan_details(&self, plan_id: &str) -> Result<Option<Plan>, ProviderError> {
        self.tools.call_as("get_plan_details", json!({ "plan_id": plan_id })).await
    }

    /// Only the plan records are taken from the backend; the side-by-side view is rebuilt
    /// locally so both provider modes recommend the same way.
    async fn compare(&self, plan_ids: &[String]) -> Result<PlanComparison, ProviderError> {
        const TOOL: &str = "compare_plans";
        let remote = self
            .tools
            .call_as::<RemoteComparison>(TOOL, json!({ "plan_ids": plan_ids }))
            .await?;
        remote
            .and_then(|remote| build_comparison(remote.plans))
            .ok_or_else(|| self.tools.missing(TOOL, "沒有找到有效的方案"))
    }

    async fn calculate_upgrade_cost(
        &self,
        request: &UpgradeCostRequest,
    ) -> Result<Option<UpgradeCost>, ProviderError> {
        let arguments = json!({
            "current_plan_fee": request.current_plan_fee,
            "new_plan_id": request.new_plan_id,
            "device_price": request.device_price,
            "contract_type": request.contract_type,
        });
        self.tools.call_as("calculate_upgrade_cost", arguments).await
    }
}
