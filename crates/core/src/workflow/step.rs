use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Steps of a renewal, declared in happy-path order. The derived ordering is load-bearing:
/// re-entry whitelists and field ownership are both computed from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    Init,
    QueryCustomer,
    ListPhones,
    SelectPhone,
    CheckEligibility,
    SelectDeviceType,
    SelectDeviceOs,
    SelectDevice,
    ListPlans,
    ComparePlans,
    Confirm,
    Completed,
}

impl WorkflowStep {
    pub const ALL: [WorkflowStep; 12] = [
        Self::Init,
        Self::QueryCustomer,
        Self::ListPhones,
        Self::SelectPhone,
        Self::CheckEligibility,
        Self::SelectDeviceType,
        Self::SelectDeviceOs,
        Self::SelectDevice,
        Self::ListPlans,
        Self::ComparePlans,
        Self::Confirm,
        Self::Completed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::QueryCustomer => "query_customer",
            Self::ListPhones => "list_phones",
            Self::SelectPhone => "select_phone",
            Self::CheckEligibility => "check_eligibility",
            Self::SelectDeviceType => "select_device_type",
            Self::SelectDeviceOs => "select_device_os",
            Self::SelectDevice => "select_device",
            Self::ListPlans => "list_plans",
            Self::ComparePlans => "compare_plans",
            Self::Confirm => "confirm",
            Self::Completed => "completed",
        }
    }

    /// Forward edges accepted by the validated transition operation.
    pub fn forward_targets(self) -> &'static [WorkflowStep] {
        use WorkflowStep::*;

        match self {
            Init => &[QueryCustomer],
            QueryCustomer => &[ListPhones],
            ListPhones => &[SelectPhone],
            SelectPhone => &[CheckEligibility],
            CheckEligibility => &[SelectDeviceType],
            SelectDeviceType => &[SelectDeviceOs, ListPlans],
            SelectDeviceOs => &[SelectDevice],
            SelectDevice => &[ListPlans],
            ListPlans => &[ComparePlans, Confirm],
            ComparePlans => &[ListPlans, Confirm],
            Confirm => &[Completed],
            Completed => &[],
        }
    }

    pub fn can_advance_to(self, next: WorkflowStep) -> bool {
        self.forward_targets().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Completed
    }

    /// Steps from which a handler landing on `self` may be re-entered: everything ordered
    /// after it except the terminal step.
    pub fn reentry_sources(self) -> impl Iterator<Item = WorkflowStep> {
        Self::ALL.into_iter().filter(move |step| *step > self && !step.is_terminal())
    }

    pub fn is_reentry_from(self, current: WorkflowStep) -> bool {
        current > self && !current.is_terminal()
    }
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown workflow step `{0}`")]
pub struct UnknownStep(pub String);

impl FromStr for WorkflowStep {
    type Err = UnknownStep;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|step| step.as_str() == normalized)
            .ok_or_else(|| UnknownStep(value.to_string()))
    }
}

/// Keys a step handler may write into `customer_selection`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SelectionField {
    IdNumber,
    CustomerId,
    CustomerName,
    CustomerPhone,
    SelectedPhoneNumber,
    EligibilityCheck,
    Contract,
    DeviceType,
    DeviceOs,
    Device,
    Comparison,
    ComparedPlanIds,
    SelectedPlan,
}

/// Step → owned fields. Rewinding to a step nulls every field owned by it or by any later
/// step, so this table is the single source of truth for backtrack invalidation.
pub const FIELD_OWNERS: [(SelectionField, WorkflowStep); 13] = [
    (SelectionField::IdNumber, WorkflowStep::QueryCustomer),
    (SelectionField::CustomerId, WorkflowStep::QueryCustomer),
    (SelectionField::CustomerName, WorkflowStep::QueryCustomer),
    (SelectionField::CustomerPhone, WorkflowStep::QueryCustomer),
    (SelectionField::SelectedPhoneNumber, WorkflowStep::SelectPhone),
    (SelectionField::EligibilityCheck, WorkflowStep::SelectPhone),
    (SelectionField::Contract, WorkflowStep::SelectPhone),
    (SelectionField::DeviceType, WorkflowStep::SelectDeviceType),
    (SelectionField::DeviceOs, WorkflowStep::SelectDeviceOs),
    (SelectionField::Device, WorkflowStep::SelectDevice),
    (SelectionField::Comparison, WorkflowStep::ComparePlans),
    (SelectionField::ComparedPlanIds, WorkflowStep::ComparePlans),
    (SelectionField::SelectedPlan, WorkflowStep::Confirm),
];

impl SelectionField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdNumber => "id_number",
            Self::CustomerId => "customer_id",
            Self::CustomerName => "customer_name",
            Self::CustomerPhone => "customer_phone",
            Self::SelectedPhoneNumber => "selected_phone_number",
            Self::EligibilityCheck => "eligibility_check",
            Self::Contract => "contract",
            Self::DeviceType => "device_type",
            Self::DeviceOs => "device_os",
            Self::Device => "device",
            Self::Comparison => "comparison",
            Self::ComparedPlanIds => "compared_plan_ids",
            Self::SelectedPlan => "selected_plan",
        }
    }

    pub fn owner(self) -> WorkflowStep {
        FIELD_OWNERS
            .iter()
            .find(|(field, _)| *field == self)
            .map(|(_, owner)| *owner)
            .unwrap_or(WorkflowStep::Init)
    }
}

/// Fields that must not survive a rewind to `target`.
pub fn fields_cleared_by_rewind(target: WorkflowStep) -> Vec<SelectionField> {
    FIELD_OWNERS
        .iter()
        .filter(|(_, owner)| *owner >= target)
        .map(|(field, _)| *field)
        .collect()
}
