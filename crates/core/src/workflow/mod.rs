//! Renewal workflow: step model, session persistence and the step handlers.

pub mod manager;
pub mod orchestrator;
pub mod session;
pub mod step;
pub mod store;

pub use manager::{WorkflowSessionManager, DEFAULT_SESSION_TTL};
pub use orchestrator::{
    ApplicationSummary, ComparisonOutcome, CustomerFound, DeviceChosen, DeviceListing,
    DeviceOsChosen, DeviceRecommendations, DeviceTypeChosen, EligibilityOutcome, PhoneListing,
    PhoneOverview, PlanChosen, PlanListing, PlanOffer, PromotionSearch, RenewalWorkflow,
    SelectedPlan, StartedSession, Submitted, UpgradeQuote,
};
pub use session::{ChatMessage, ChatRole, SessionPatch, WorkflowSession};
pub use step::{fields_cleared_by_rewind, SelectionField, UnknownStep, WorkflowStep};
pub use store::{InMemorySessionStore, SessionStore, StoreError, VersionedDocument};
