//! Collaborator boundary — traits for the external systems the engine
//! talks to, plus in-memory implementations for tests and local runs.
//!
//! The engine treats dispatch as a black box: it owns the idempotency key
//! and the retry classification of failures, nothing else.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::types::{DispatchAction, DispatchOutcome};

/// Outbound side-effect boundary (messaging, CRM, webhooks).
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(&self, action: DispatchAction) -> EngineResult<DispatchOutcome>;
}

/// Read-only subject attribute lookup, used by branch predicates.
#[async_trait]
pub trait SubjectLookup: Send + Sync {
    async fn attributes(&self, subject_id: &str) -> EngineResult<serde_json::Value>;
}

/// Existence checks against the authoring collaborator's catalog of
/// message templates and forms. Validation-time only.
pub trait CatalogLookup: Send + Sync {
    fn template_exists(&self, template_id: &str) -> bool;
    fn form_exists(&self, form_id: &str) -> bool;
}

/// In-memory dispatcher that records calls and applies each idempotency key
/// at most once, mirroring what a well-behaved provider does with the key.
#[derive(Default)]
pub struct RecordingDispatcher {
    calls: Mutex<Vec<DispatchAction>>,
    effects: DashMap<String, DispatchOutcome>,
    fail_transient: AtomicBool,
    fail_permanent: AtomicBool,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// While enabled, every dispatch fails with a transient error.
    pub fn set_fail_transient(&self, on: bool) {
        self.fail_transient.store(on, Ordering::SeqCst);
    }

    /// While enabled, every dispatch fails with a permanent error.
    pub fn set_fail_permanent(&self, on: bool) {
        self.fail_permanent.store(on, Ordering::SeqCst);
    }

    /// Every call made, including failed and replayed ones.
    pub fn calls(&self) -> Vec<DispatchAction> {
        self.calls.lock().expect("dispatcher mutex poisoned").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("dispatcher mutex poisoned").len()
    }

    /// Number of distinct effective side effects (one per idempotency key).
    pub fn effect_count(&self) -> usize {
        self.effects.len()
    }

    pub fn has_effect(&self, idempotency_key: &str) -> bool {
        self.effects.contains_key(idempotency_key)
    }
}

#[async_trait]
impl ActionDispatcher for RecordingDispatcher {
    async fn dispatch(&self, action: DispatchAction) -> EngineResult<DispatchOutcome> {
        self.calls
            .lock()
            .expect("dispatcher mutex poisoned")
            .push(action.clone());

        if self.fail_transient.load(Ordering::SeqCst) {
            return Err(EngineError::TransientDispatch(
                "injected transient failure".into(),
            ));
        }
        if self.fail_permanent.load(Ordering::SeqCst) {
            return Err(EngineError::PermanentDispatch(
                "injected permanent failure".into(),
            ));
        }

        // Re-delivery of a known key returns the original outcome without a
        // second effect.
        if let Some(existing) = self.effects.get(&action.idempotency_key) {
            return Ok(existing.clone());
        }

        let outcome = DispatchOutcome {
            external_ref: Some(format!("ext-{}", Uuid::new_v4())),
        };
        self.effects
            .insert(action.idempotency_key.clone(), outcome.clone());
        Ok(outcome)
    }
}

/// In-memory subject attribute source.
#[derive(Default)]
pub struct StaticSubjects {
    attrs: DashMap<String, serde_json::Value>,
}

impl StaticSubjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subject_id: impl Into<String>, attributes: serde_json::Value) {
        self.attrs.insert(subject_id.into(), attributes);
    }
}

#[async_trait]
impl SubjectLookup for StaticSubjects {
    async fn attributes(&self, subject_id: &str) -> EngineResult<serde_json::Value> {
        self.attrs
            .get(subject_id)
            .map(|v| v.clone())
            .ok_or_else(|| EngineError::NotFound(format!("subject {}", subject_id)))
    }
}

/// Fixed catalog of template and form ids.
#[derive(Default)]
pub struct StaticCatalog {
    templates: HashSet<String>,
    forms: HashSet<String>,
    allow_all: bool,
}

impl StaticCatalog {
    pub fn new(
        templates: impl IntoIterator<Item = String>,
        forms: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            templates: templates.into_iter().collect(),
            forms: forms.into_iter().collect(),
            allow_all: false,
        }
    }

    /// Catalog that accepts any identifier. For tests and demo mode.
    pub fn permissive() -> Self {
        Self {
            allow_all: true,
            ..Self::default()
        }
    }
}

impl CatalogLookup for StaticCatalog {
    fn template_exists(&self, template_id: &str) -> bool {
        self.allow_all || self.templates.contains(template_id)
    }

    fn form_exists(&self, form_id: &str) -> bool {
        self.allow_all || self.forms.contains(form_id)
    }
}
