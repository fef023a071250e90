//! Event-driven cache invalidation.
//!
//! The keys to drop are derived from the event type and the aggregate identity
//! through a per-event-type [`InvalidationPolicy`]. Removal is best-effort: a
//! failing backend is logged and reported, never escalated.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use readsync_core::AggregateId;
use readsync_events::EventRecord;

use super::{Cache, CacheError};

/// How one cache key is derived from an aggregate identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyTemplate {
    /// A fixed key, e.g. a "list all" query.
    Static(String),
    /// `<prefix>_<aggregate_id>`, e.g. a "get by id" query.
    ById(String),
    /// Free-form key; every `{aggregate_id}` is replaced with the aggregate id.
    ///
    /// The rendered key is literal: backends remove exact keys, so `*` or `?` are
    /// not globs. Each paginated or filtered variant needs its own template.
    Pattern(String),
}

impl KeyTemplate {
    pub fn render(&self, aggregate_id: &AggregateId) -> String {
        match self {
            Self::Static(key) => key.clone(),
            Self::ById(prefix) => format!("{prefix}_{aggregate_id}"),
            Self::Pattern(pattern) => pattern.replace("{aggregate_id}", aggregate_id.as_str()),
        }
    }
}

/// Maps event types to the cache keys they invalidate.
#[derive(Debug, Clone, Default)]
pub struct InvalidationPolicy {
    rules: HashMap<String, Vec<KeyTemplate>>,
}

impl InvalidationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate `templates` whenever `event_type` is processed (additive).
    pub fn on(mut self, event_type: impl Into<String>, templates: impl IntoIterator<Item = KeyTemplate>) -> Self {
        self.rules
            .entry(event_type.into())
            .or_default()
            .extend(templates);
        self
    }

    /// Same templates for several event types.
    pub fn on_all(mut self, event_types: &[&str], templates: &[KeyTemplate]) -> Self {
        for event_type in event_types {
            self = self.on(*event_type, templates.iter().cloned());
        }
        self
    }

    /// Merge another policy's rules into this one.
    pub fn merge(mut self, other: InvalidationPolicy) -> Self {
        for (event_type, templates) in other.rules {
            self.rules.entry(event_type).or_default().extend(templates);
        }
        self
    }

    pub fn templates(&self, event_type: &str) -> &[KeyTemplate] {
        self.rules.get(event_type).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Concrete keys for one event type and aggregate, deduplicated, in rule order.
    pub fn keys(&self, event_type: &str, aggregate_id: &AggregateId) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for key in self.templates(event_type).iter().map(|t| t.render(aggregate_id)) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    pub fn keys_for(&self, record: &EventRecord) -> Vec<String> {
        self.keys(record.event_type(), record.aggregate_id())
    }
}

/// What an invalidation call attempted and whether the backend accepted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationReport {
    pub keys: Vec<String>,
    pub error: Option<CacheError>,
}

impl InvalidationReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone)]
pub struct CacheInvalidator {
    cache: Arc<dyn Cache>,
    policy: InvalidationPolicy,
}

impl CacheInvalidator {
    pub fn new(cache: Arc<dyn Cache>, policy: InvalidationPolicy) -> Self {
        Self { cache, policy }
    }

    pub fn policy(&self) -> &InvalidationPolicy {
        &self.policy
    }

    /// Best-effort removal of `keys`.
    pub async fn invalidate(&self, keys: Vec<String>) -> InvalidationReport {
        if keys.is_empty() {
            return InvalidationReport { keys, error: None };
        }

        match self.cache.remove(&keys).await {
            Ok(()) => {
                debug!(?keys, "cache keys invalidated");
                InvalidationReport { keys, error: None }
            }
            Err(err) => {
                warn!(?keys, error = %err, "cache invalidation failed; entries expire on TTL");
                InvalidationReport {
                    keys,
                    error: Some(err),
                }
            }
        }
    }

    /// Invalidate every key the policy derives from `record`.
    pub async fn invalidate_for(&self, record: &EventRecord) -> InvalidationReport {
        self.invalidate(self.policy.keys_for(record)).await
    }
}

impl core::fmt::Debug for CacheInvalidator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CacheInvalidator")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
