//! Owner of every persisted session mutation.
//!
//! Each write is a read, an in-memory change and a `put_if_version` against the version that
//! was read. A conflicting concurrent write causes the whole cycle to be retried on fresh
//! state, so transition legality is always judged against the latest step.
//!
//! Lifecycle events go to the audit sink only; the default sink writes them to the log.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, TracingAuditSink};
use crate::errors::{ApplicationError, DomainError};
use crate::workflow::session::{
    session_key, staff_index_key, ChatMessage, ChatRole, SessionPatch, WorkflowSession,
};
use crate::workflow::step::{SelectionField, WorkflowStep};
use crate::workflow::store::{SessionStore, StoreError};

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);
const MAX_WRITE_ATTEMPTS: usize = 5;

pub struct WorkflowSessionManager {
    store: Arc<dyn SessionStore>,
    audit: Arc<dyn AuditSink>,
    ttl: Duration,
}

impl WorkflowSessionManager {
    pub fn new(store: Arc<dyn SessionStore>, ttl: Duration) -> Self {
        Self { store, audit: Arc::new(TracingAuditSink), ttl }
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn ping(&self) -> Result<(), ApplicationError> {
        self.store.ping().await.map_err(ApplicationError::from)
    }

    pub async fn create_session(
        &self,
        staff_id: &str,
        clear_existing: bool,
    ) -> Result<WorkflowSession, ApplicationError> {
        if clear_existing {
            self.clear_staff_sessions(staff_id).await?;
        }

        let mut session = WorkflowSession::new(staff_id, Utc::now());
        session.version = 1;
        let body = encode(&session)?;
        self.store.put_if_version(&session_key(&session.session_id), &body, 0, self.ttl).await?;
        self.store
            .add_to_index(&staff_index_key(staff_id), &session.session_id, self.ttl)
            .await?;

        self.emit_with(
            &session,
            "workflow.session_created",
            AuditCategory::Session,
            AuditOutcome::Success,
            &[("cleared_existing", if clear_existing { "true" } else { "false" })],
        );
        Ok(session)
    }

    /// Absent means unknown or expired; the two are indistinguishable.
    pub async fn get_session(
        &self,
        session_id: &str,
    ) -> Result<Option<WorkflowSession>, ApplicationError> {
        let Some(document) = self.store.get(&session_key(session_id)).await? else {
            return Ok(None);
        };
        let mut session: WorkflowSession = serde_json::from_value(document.body)
            .map_err(|error| ApplicationError::from(StoreError::Decode(error.to_string())))?;
        session.version = document.version;
        Ok(Some(session))
    }

    pub async fn update_session(
        &self,
        session_id: &str,
        patch: SessionPatch,
    ) -> Result<bool, ApplicationError> {
        let updated = self
            .mutate(session_id, |session| {
                for (key, value) in &patch.metadata {
                    session.metadata.insert(key.clone(), value.clone());
                }
                if let Some(history) = &patch.chat_history {
                    session.chat_history = history.clone();
                }
                Ok(())
            })
            .await?;
        Ok(updated.is_some())
    }

    /// Shallow-merges into the selection map; keys not named in `partial` are untouched.
    pub async fn update_customer_selection(
        &self,
        session_id: &str,
        partial: Map<String, Value>,
    ) -> Result<bool, ApplicationError> {
        let updated = self
            .mutate(session_id, |session| {
                for (key, value) in &partial {
                    session.customer_selection.insert(key.clone(), value.clone());
                }
                Ok(())
            })
            .await?;
        Ok(updated.is_some())
    }

    pub async fn transition_to_step(
        &self,
        session_id: &str,
        next: WorkflowStep,
    ) -> Result<WorkflowSession, ApplicationError> {
        let mut from = None;
        let result = self
            .mutate(session_id, |session| {
                let current = session.current_step;
                from = Some(current);
                if !current.can_advance_to(next) {
                    return Err(DomainError::IllegalTransition { from: current, to: next });
                }
                session.current_step = next;
                Ok(())
            })
            .await;

        match result {
            Ok(Some(session)) => {
                let from = from.unwrap_or(session.current_step);
                self.emit_with(
                    &session,
                    "workflow.transition_applied",
                    AuditCategory::Flow,
                    AuditOutcome::Success,
                    &[("from", from.as_str()), ("to", next.as_str())],
                );
                Ok(session)
            }
            Ok(None) => Err(not_found(session_id)),
            Err(error) => {
                if let ApplicationError::Domain(DomainError::IllegalTransition { from, to }) = &error
                {
                    self.audit.emit(
                        AuditEvent::new(
                            Some(session_id.to_string()),
                            None,
                            "workflow.transition_rejected",
                            AuditCategory::Flow,
                            AuditOutcome::Rejected,
                        )
                        .with_metadata("from", from.as_str())
                        .with_metadata("to", to.as_str()),
                    );
                }
                Err(error)
            }
        }
    }

    /// Rewinds `current_step` to `target` without consulting the forward table and nulls
    /// `cleared_fields`. Reserved for backward navigation.
    pub async fn force_reset_step(
        &self,
        session_id: &str,
        target: WorkflowStep,
        cleared_fields: &[SelectionField],
    ) -> Result<bool, ApplicationError> {
        let mut from = None;
        let updated = self
            .mutate(session_id, |session| {
                from = Some(session.current_step);
                session.current_step = target;
                for field in cleared_fields {
                    session.customer_selection.insert(field.as_str().to_string(), Value::Null);
                }
                Ok(())
            })
            .await?;

        let Some(session) = updated else {
            return Ok(false);
        };
        let from = from.unwrap_or(target);
        let cleared: Vec<&str> = cleared_fields.iter().map(|field| field.as_str()).collect();
        self.emit_with(
            &session,
            "workflow.step_reset",
            AuditCategory::Flow,
            AuditOutcome::Success,
            &[
                ("from", from.as_str()),
                ("to", target.as_str()),
                ("cleared", cleared.join(",").as_str()),
            ],
        );
        Ok(true)
    }

    pub async fn add_chat_message(
        &self,
        session_id: &str,
        role: ChatRole,
        content: &str,
    ) -> Result<bool, ApplicationError> {
        let updated = self
            .mutate(session_id, |session| {
                session.chat_history.push(ChatMessage {
                    role,
                    content: content.to_string(),
                    timestamp: Utc::now(),
                });
                Ok(())
            })
            .await?;
        Ok(updated.is_some())
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<bool, ApplicationError> {
        let Some(session) = self.get_session(session_id).await? else {
            return Ok(false);
        };

        let removed = self.store.delete(&session_key(session_id)).await?;
        self.store.remove_from_index(&staff_index_key(&session.staff_id), session_id).await?;
        if removed {
            self.emit(&session, "workflow.session_deleted", AuditCategory::Session, AuditOutcome::Success);
        }
        Ok(removed)
    }

    /// Deletes every session registered for the employee, then the index itself.
    pub async fn clear_staff_sessions(&self, staff_id: &str) -> Result<usize, ApplicationError> {
        let index_key = staff_index_key(staff_id);
        let session_ids = self.store.list_index(&index_key).await?;

        let mut removed = 0;
        for session_id in &session_ids {
            if self.store.delete(&session_key(session_id)).await? {
                removed += 1;
            }
        }
        self.store.delete_index(&index_key).await?;

        if !session_ids.is_empty() {
            self.audit.emit(
                AuditEvent::new(
                    None,
                    Some(staff_id.to_string()),
                    "workflow.sessions_cleared",
                    AuditCategory::Session,
                    AuditOutcome::Success,
                )
                .with_metadata("removed", removed.to_string()),
            );
        }
        Ok(removed)
    }

    pub async fn list_staff_sessions(&self, staff_id: &str) -> Result<Vec<String>, ApplicationError> {
        Ok(self.store.list_index(&staff_index_key(staff_id)).await?)
    }

    pub async fn can_transition_to(
        &self,
        session_id: &str,
        next: WorkflowStep,
    ) -> Result<bool, ApplicationError> {
        Ok(self
            .get_session(session_id)
            .await?
            .is_some_and(|session| session.current_step.can_advance_to(next)))
    }

    async fn mutate<F>(
        &self,
        session_id: &str,
        mut apply: F,
    ) -> Result<Option<WorkflowSession>, ApplicationError>
    where
        F: FnMut(&mut WorkflowSession) -> Result<(), DomainError> + Send,
    {
        let key = session_key(session_id);
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let Some(mut session) = self.get_session(session_id).await? else {
                return Ok(None);
            };
            let expected = session.version;

            apply(&mut session)?;
            session.version = expected + 1;
            session.updated_at = Utc::now();

            let body = encode(&session)?;
            match self.store.put_if_version(&key, &body, expected, self.ttl).await {
                Ok(_) => {
                    self.store
                        .add_to_index(&staff_index_key(&session.staff_id), session_id, self.ttl)
                        .await?;
                    return Ok(Some(session));
                }
                Err(StoreError::VersionConflict { .. }) => {
                    tracing::debug!(
                        event_name = "workflow.write_conflict",
                        session_id,
                        attempt,
                        "retrying session write on fresh state"
                    );
                }
                Err(other) => return Err(other.into()),
            }
        }

        Err(ApplicationError::Conflict(format!(
            "session {session_id} kept changing after {MAX_WRITE_ATTEMPTS} attempts"
        )))
    }

    fn emit(
        &self,
        session: &WorkflowSession,
        event_type: &str,
        category: AuditCategory,
        outcome: AuditOutcome,
    ) {
        self.emit_with(session, event_type, category, outcome, &[]);
    }

    fn emit_with(
        &self,
        session: &WorkflowSession,
        event_type: &str,
        category: AuditCategory,
        outcome: AuditOutcome,
        metadata: &[(&str, &str)],
    ) {
        let event = metadata.iter().fold(
            AuditEvent::new(
                Some(session.session_id.clone()),
                Some(session.staff_id.clone()),
                event_type,
                category,
                outcome,
            ),
            |event, (key, value)| event.with_metadata(*key, *value),
        );
        self.audit.emit(event);
    }
}

fn encode(session: &WorkflowSession) -> Result<Value, ApplicationError> {
    serde_json::to_value(session)
        .map_err(|error| ApplicationError::Persistence(format!("session encoding failed: {error}")))
}

pub(crate) fn not_found(session_id: &str) -> ApplicationError {
    ApplicationError::NotFound(format!("session {session_id} does not exist or has expired"))
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Map, Value};

    use super::{WorkflowSessionManager, DEFAULT_SESSION_TTL};
    use crate::audit::InMemoryAuditSink;
    use crate::errors::{ApplicationError, DomainError};
    use crate::workflow::session::{ChatRole, SessionPatch};
    use crate::workflow::step::{fields_cleared_by_rewind, SelectionField, WorkflowStep};
    use crate::workflow::store::{
        InMemorySessionStore, SessionStore, StoreError, VersionedDocument,
    };

    fn manager() -> (WorkflowSessionManager, InMemorySessionStore, InMemoryAuditSink) {
        let store = InMemorySessionStore::new();
        let audit = InMemoryAuditSink::default();
        let manager = WorkflowSessionManager::new(Arc::new(store.clone()), DEFAULT_SESSION_TTL)
            .with_audit_sink(Arc::new(audit.clone()));
        (manager, store, audit)
    }

    fn selection(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(key, value)| (key.to_string(), value.clone())).collect()
    }

    async fn advance(manager: &WorkflowSessionManager, session_id: &str, path: &[WorkflowStep]) {
        for step in path {
            manager.transition_to_step(session_id, *step).await.expect("legal edge");
        }
    }

    #[tokio::test]
    async fn starting_again_leaves_exactly_one_session() {
        let (manager, store, _) = manager();

        let first = manager.create_session("S001", true).await.expect("first");
        let second = manager.create_session("S001", true).await.expect("second");

        assert_eq!(manager.list_staff_sessions("S001").await, Ok(vec![second.session_id.clone()]));
        assert_eq!(manager.get_session(&first.session_id).await, Ok(None));
        assert_eq!(store.document_count().await, 1);
    }

    #[tokio::test]
    async fn sessions_of_other_staff_survive_a_restart() {
        let (manager, _, _) = manager();

        let other = manager.create_session("S002", true).await.expect("other staff");
        manager.create_session("S001", true).await.expect("first");
        manager.create_session("S001", true).await.expect("restart");

        assert!(manager.get_session(&other.session_id).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn new_session_starts_empty_at_init() {
        let (manager, _, audit) = manager();

        let session = manager.create_session("S001", false).await.expect("create");

        assert_eq!(session.current_step, WorkflowStep::Init);
        assert!(session.customer_selection.is_empty());
        assert!(session.chat_history.is_empty());
        assert!(session.session_id.starts_with("renewal_S001_"));
        assert_eq!(audit.event_types(), vec!["workflow.session_created".to_string()]);
    }

    #[tokio::test]
    async fn reads_without_mutation_are_identical() {
        let (manager, _, _) = manager();
        let session = manager.create_session("S001", true).await.expect("create");

        let first = manager.get_session(&session.session_id).await.expect("get");
        let second = manager.get_session(&session.session_id).await.expect("get");

        assert_eq!(first, second);
        assert_eq!(first, Some(session));
    }

    #[tokio::test]
    async fn every_illegal_edge_is_rejected_and_leaves_step_unchanged() {
        let (manager, _, _) = manager();

        for from in WorkflowStep::ALL {
            for to in WorkflowStep::ALL {
                let session = manager.create_session("S001", true).await.expect("create");
                let id = session.session_id.as_str();
                manager.force_reset_step(id, from, &[]).await.expect("position");

                let result = manager.transition_to_step(id, to).await;
                let stored = manager.get_session(id).await.expect("get").expect("present");

                if from.can_advance_to(to) {
                    assert_eq!(result.map(|session| session.current_step), Ok(to));
                    assert_eq!(stored.current_step, to);
                } else {
                    assert_eq!(
                        result,
                        Err(ApplicationError::Domain(DomainError::IllegalTransition { from, to }))
                    );
                    assert_eq!(stored.current_step, from, "{from} -> {to} must not move");
                }
            }
        }
    }

    #[tokio::test]
    async fn transition_on_missing_session_is_not_found() {
        let (manager, _, _) = manager();

        let result = manager.transition_to_step("renewal_S001_missing", WorkflowStep::QueryCustomer).await;

        assert!(matches!(result, Err(ApplicationError::NotFound(_))));
    }

    #[tokio::test]
    async fn rejected_transition_is_audited() {
        let (manager, _, audit) = manager();
        let session = manager.create_session("S001", true).await.expect("create");

        let _ = manager.transition_to_step(&session.session_id, WorkflowStep::Confirm).await;

        let rejected = audit
            .events()
            .into_iter()
            .find(|event| event.event_type == "workflow.transition_rejected")
            .expect("rejection audited");
        assert_eq!(rejected.metadata.get("from").map(String::as_str), Some("init"));
        assert_eq!(rejected.metadata.get("to").map(String::as_str), Some("confirm"));
    }

    #[tokio::test]
    async fn selection_updates_merge_shallowly() {
        let (manager, _, _) = manager();
        let session = manager.create_session("S001", true).await.expect("create");
        let id = session.session_id.as_str();

        manager
            .update_customer_selection(id, selection(&[("customer_id", json!("C123456"))]))
            .await
            .expect("first merge");
        manager
            .update_customer_selection(id, selection(&[("device_type", json!("tablet"))]))
            .await
            .expect("second merge");

        let stored = manager.get_session(id).await.expect("get").expect("present");
        assert_eq!(stored.customer_selection.get("customer_id"), Some(&json!("C123456")));
        assert_eq!(stored.customer_selection.get("device_type"), Some(&json!("tablet")));
        assert!(stored.updated_at >= session.updated_at);
        assert_eq!(stored.version, session.version + 2);
    }

    #[tokio::test]
    async fn updates_on_missing_session_report_false() {
        let (manager, _, _) = manager();

        assert_eq!(manager.update_customer_selection("nope", Map::new()).await, Ok(false));
        assert_eq!(manager.update_session("nope", SessionPatch::default()).await, Ok(false));
        assert_eq!(manager.force_reset_step("nope", WorkflowStep::Init, &[]).await, Ok(false));
        assert_eq!(manager.add_chat_message("nope", ChatRole::User, "hi").await, Ok(false));
        assert_eq!(manager.delete_session("nope").await, Ok(false));
        assert_eq!(manager.can_transition_to("nope", WorkflowStep::QueryCustomer).await, Ok(false));
    }

    #[tokio::test]
    async fn update_session_merges_metadata_only() {
        let (manager, _, _) = manager();
        let session = manager.create_session("S001", true).await.expect("create");
        let id = session.session_id.as_str();
        manager
            .update_customer_selection(id, selection(&[("customer_id", json!("C123456"))]))
            .await
            .expect("selection");

        manager
            .update_session(id, SessionPatch::metadata("order_number", "ORD20260301abcdef"))
            .await
            .expect("patch");

        let stored = manager.get_session(id).await.expect("get").expect("present");
        assert_eq!(stored.metadata.get("order_number"), Some(&json!("ORD20260301abcdef")));
        assert_eq!(stored.customer_selection.get("customer_id"), Some(&json!("C123456")));
    }

    #[tokio::test]
    async fn force_reset_bypasses_table_and_nulls_fields() {
        let (manager, _, audit) = manager();
        let session = manager.create_session("S001", true).await.expect("create");
        let id = session.session_id.as_str();
        advance(
            &manager,
            id,
            &[
                WorkflowStep::QueryCustomer,
                WorkflowStep::ListPhones,
                WorkflowStep::SelectPhone,
                WorkflowStep::CheckEligibility,
                WorkflowStep::SelectDeviceType,
                WorkflowStep::ListPlans,
            ],
        )
        .await;
        manager
            .update_customer_selection(
                id,
                selection(&[
                    ("customer_id", json!("C123456")),
                    ("selected_phone_number", json!("0912345678")),
                    ("device_type", json!("none")),
                    ("device", json!({"device_id": "none"})),
                ]),
            )
            .await
            .expect("selection");

        let cleared = fields_cleared_by_rewind(WorkflowStep::SelectPhone);
        assert_eq!(
            manager.force_reset_step(id, WorkflowStep::SelectPhone, &cleared).await,
            Ok(true)
        );

        let stored = manager.get_session(id).await.expect("get").expect("present");
        assert_eq!(stored.current_step, WorkflowStep::SelectPhone);
        assert_eq!(stored.selection_str(SelectionField::CustomerId), Some("C123456"));
        assert!(!stored.has_selection(SelectionField::SelectedPhoneNumber));
        assert!(!stored.has_selection(SelectionField::DeviceType));
        assert!(!stored.has_selection(SelectionField::Device));
        assert!(audit.event_types().contains(&"workflow.step_reset".to_string()));
    }

    #[tokio::test]
    async fn chat_history_is_appended_in_order() {
        let (manager, _, _) = manager();
        let session = manager.create_session("S001", true).await.expect("create");
        let id = session.session_id.as_str();

        manager.add_chat_message(id, ChatRole::User, "哪個方案最便宜？").await.expect("user");
        manager.add_chat_message(id, ChatRole::Assistant, "學生輕量包 399").await.expect("reply");

        let stored = manager.get_session(id).await.expect("get").expect("present");
        let roles: Vec<ChatRole> = stored.chat_history.iter().map(|message| message.role).collect();
        assert_eq!(roles, vec![ChatRole::User, ChatRole::Assistant]);
        assert_eq!(stored.chat_history[1].content, "學生輕量包 399");
    }

    #[tokio::test]
    async fn delete_removes_document_and_index_entry() {
        let (manager, _, _) = manager();
        let session = manager.create_session("S001", true).await.expect("create");

        assert_eq!(manager.delete_session(&session.session_id).await, Ok(true));
        assert_eq!(manager.get_session(&session.session_id).await, Ok(None));
        assert_eq!(manager.list_staff_sessions("S001").await, Ok(Vec::new()));
    }

    #[tokio::test]
    async fn clear_reports_number_of_removed_sessions() {
        let (manager, _, _) = manager();
        manager.create_session("S001", false).await.expect("one");
        manager.create_session("S001", false).await.expect("two");

        assert_eq!(manager.clear_staff_sessions("S001").await, Ok(2));
        assert_eq!(manager.list_staff_sessions("S001").await, Ok(Vec::new()));
        assert_eq!(manager.clear_staff_sessions("S001").await, Ok(0));
    }

    #[tokio::test]
    async fn can_transition_mirrors_the_table_without_mutating() {
        let (manager, _, _) = manager();
        let session = manager.create_session("S001", true).await.expect("create");
        let id = session.session_id.as_str();

        assert_eq!(manager.can_transition_to(id, WorkflowStep::QueryCustomer).await, Ok(true));
        assert_eq!(manager.can_transition_to(id, WorkflowStep::ListPlans).await, Ok(false));
        let stored = manager.get_session(id).await.expect("get").expect("present");
        assert_eq!(stored.version, session.version);
    }

    #[tokio::test]
    async fn concurrent_selection_writes_are_not_lost() {
        let (manager, _, _) = manager();
        let manager = Arc::new(manager);
        let session = manager.create_session("S001", true).await.expect("create");

        let mut handles = Vec::new();
        for index in 0..4 {
            let manager = Arc::clone(&manager);
            let id = session.session_id.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .update_customer_selection(
                        &id,
                        selection(&[(format!("field_{index}").as_str(), json!(index))]),
                    )
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.expect("join"), Ok(true));
        }

        let stored =
            manager.get_session(&session.session_id).await.expect("get").expect("present");
        for index in 0..4 {
            assert_eq!(stored.customer_selection.get(&format!("field_{index}")), Some(&json!(index)));
        }
        assert_eq!(stored.version, session.version + 4);
    }

    /// Lets another writer move the session on between the manager's read and its write.
    struct RacingStore {
        inner: InMemorySessionStore,
        raced: AtomicBool,
        conflicts: AtomicUsize,
    }

    impl RacingStore {
        fn new() -> Self {
            Self {
                inner: InMemorySessionStore::new(),
                raced: AtomicBool::new(false),
                conflicts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SessionStore for RacingStore {
        async fn put(&self, key: &str, body: &Value, ttl: Duration) -> Result<u64, StoreError> {
            self.inner.put(key, body, ttl).await
        }

        async fn put_if_version(
            &self,
            key: &str,
            body: &Value,
            expected_version: u64,
            ttl: Duration,
        ) -> Result<u64, StoreError> {
            if expected_version > 0 && !self.raced.swap(true, Ordering::SeqCst) {
                if let Some(document) = self.inner.get(key).await? {
                    let mut rival = document.body;
                    rival["current_step"] = json!("query_customer");
                    self.inner.put_if_version(key, &rival, expected_version, ttl).await?;
                }
            }
            let result = self.inner.put_if_version(key, body, expected_version, ttl).await;
            if matches!(result, Err(StoreError::VersionConflict { .. })) {
                self.conflicts.fetch_add(1, Ordering::SeqCst);
            }
            result
        }

        async fn get(&self, key: &str) -> Result<Option<VersionedDocument>, StoreError> {
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.delete(key).await
        }

        async fn add_to_index(
            &self,
            owner_key: &str,
            member: &str,
            ttl: Duration,
        ) -> Result<(), StoreError> {
            self.inner.add_to_index(owner_key, member, ttl).await
        }

        async fn remove_from_index(&self, owner_key: &str, member: &str) -> Result<(), StoreError> {
            self.inner.remove_from_index(owner_key, member).await
        }

        async fn list_index(&self, owner_key: &str) -> Result<Vec<String>, StoreError> {
            self.inner.list_index(owner_key).await
        }

        async fn delete_index(&self, owner_key: &str) -> Result<(), StoreError> {
            self.inner.delete_index(owner_key).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }

        async fn purge_expired(&self) -> Result<u64, StoreError> {
            self.inner.purge_expired().await
        }
    }

    #[tokio::test]
    async fn transition_is_judged_against_latest_stored_step() {
        let store = Arc::new(RacingStore::new());
        let manager = WorkflowSessionManager::new(store.clone(), DEFAULT_SESSION_TTL);
        let session = manager.create_session("S001", true).await.expect("create");

        // init -> list_phones is illegal; it only succeeds once the rival's
        // query_customer step has been re-read.
        let moved = manager.transition_to_step(&session.session_id, WorkflowStep::ListPhones).await;

        assert_eq!(moved.map(|session| session.current_step), Ok(WorkflowStep::ListPhones));
        assert_eq!(store.conflicts.load(Ordering::SeqCst), 1);
        let stored =
            manager.get_session(&session.session_id).await.expect("get").expect("present");
        assert_eq!(stored.version, 3);
    }

    #[tokio::test]
    async fn racing_write_can_make_a_transition_illegal() {
        let store = Arc::new(RacingStore::new());
        let manager = WorkflowSessionManager::new(store.clone(), DEFAULT_SESSION_TTL);
        let session = manager.create_session("S001", true).await.expect("create");

        let result =
            manager.transition_to_step(&session.session_id, WorkflowStep::QueryCustomer).await;

        assert_eq!(
            result,
            Err(ApplicationError::Domain(DomainError::IllegalTransition {
                from: WorkflowStep::QueryCustomer,
                to: WorkflowStep::QueryCustomer,
            }))
        );
    }

    #[tokio::test]
    async fn every_write_slides_the_expiry_window() {
        let store = InMemorySessionStore::new();
        let manager = WorkflowSessionManager::new(Arc::new(store), Duration::from_millis(300));
        let session = manager.create_session("S001", true).await.expect("create");
        let id = session.session_id.as_str();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let touched = manager
            .update_customer_selection(id, selection(&[("customer_id", json!("C123456"))]))
            .await;
        assert_eq!(touched, Ok(true));

        // Past the deadline set at creation, inside the one set by the write.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stored = manager.get_session(id).await.expect("get").expect("still live");
        assert_eq!(stored.selection_str(SelectionField::CustomerId), Some("C123456"));
        assert_eq!(manager.list_staff_sessions("S001").await, Ok(vec![id.to_string()]));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(manager.get_session(id).await, Ok(None));
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("log buffer").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn lifecycle_events_are_logged_once() {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let manager =
            WorkflowSessionManager::new(Arc::new(InMemorySessionStore::new()), DEFAULT_SESSION_TTL);
        let session = manager.create_session("S001", true).await.expect("create");
        manager
            .transition_to_step(&session.session_id, WorkflowStep::QueryCustomer)
            .await
            .expect("advance");
        manager.delete_session(&session.session_id).await.expect("delete");

        let output = String::from_utf8(log.0.lock().expect("log buffer").clone()).expect("utf8");
        for event in
            ["workflow.session_created", "workflow.transition_applied", "workflow.session_deleted"]
        {
            assert_eq!(output.matches(event).count(), 1, "{event} in:\n{output}");
        }
    }

    #[tokio::test]
    async fn expired_session_reads_as_absent() {
        let store = InMemorySessionStore::new();
        let manager = WorkflowSessionManager::new(Arc::new(store), Duration::from_millis(20));
        let session = manager.create_session("S001", true).await.expect("create");

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(manager.get_session(&session.session_id).await, Ok(None));
        assert!(matches!(
            manager.transition_to_step(&session.session_id, WorkflowStep::QueryCustomer).await,
            Err(ApplicationError::NotFound(_))
        ));
    }
}
