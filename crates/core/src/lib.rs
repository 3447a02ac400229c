pub mod audit;
pub mod config;
pub mod errors;
pub mod providers;
pub mod workflow;

pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use workflow::{
    RenewalWorkflow, SessionStore, WorkflowSession, WorkflowSessionManager, WorkflowStep,
};
