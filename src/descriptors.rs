//! Value identifiers for logical services, methods, events and the
//! continuation/caller descriptors that link routine attempts together.
//!
//! None of these types point at code: they are names. The `model` module maps
//! them to handlers, and the storage layer uses them as keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical name of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId {
    pub name: String,
}

impl ServiceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl From<&str> for ServiceId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ServiceId {
    fn from(name: String) -> Self {
        Self { name }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Logical name of a method on a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId {
    pub name: String,
}

impl MethodId {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Bind this method to one attempt, producing the key used for persisted state.
    pub fn persisted(&self, intent_id: impl Into<String>) -> PersistedMethodId {
        PersistedMethodId {
            name: self.name.clone(),
            intent_id: intent_id.into(),
            etag: None,
        }
    }
}

impl From<&str> for MethodId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for MethodId {
    fn from(name: String) -> Self {
        Self { name }
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A method bound to a single attempt (`intent_id`), plus the optimistic
/// concurrency token of the state snapshot it was read with.
///
/// `etag == None` means "no state has been stored for this attempt yet".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PersistedMethodId {
    pub name: String,
    pub intent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl PersistedMethodId {
    pub fn method_id(&self) -> MethodId {
        MethodId::new(self.name.clone())
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    /// Same attempt, ignoring the concurrency token.
    pub fn same_attempt(&self, other: &PersistedMethodId) -> bool {
        self.name == other.name && self.intent_id == other.intent_id
    }
}

impl fmt::Display for PersistedMethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.intent_id)
    }
}

/// Logical name of an event published by a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    pub name: String,
}

impl EventId {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl From<&str> for EventId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// What happens after a routine produces its result: the routine to resume and,
/// when the resumed routine awaits several things, which task completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationDescriptor {
    pub service: ServiceId,
    pub method: PersistedMethodId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_at_ms: Option<u64>,
}

/// The logical caller of a routine attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerDescriptor {
    pub service: ServiceId,
    pub method: MethodId,
    pub intent_id: String,
}

impl fmt::Display for CallerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}#{}", self.service, self.method, self.intent_id)
    }
}

/// Derive the id of the `seq`-th outgoing intent of routine `parent`.
///
/// Derived ids strictly extend their parent id, so a continuation chain rooted at
/// an external call can never loop back onto an ancestor.
pub fn derive_intent_id(parent: &str, seq: u32) -> String {
    format!("{parent}/{seq}")
}

/// Whether `candidate` was derived (directly or transitively) from `ancestor`.
pub fn is_descendant_of(candidate: &str, ancestor: &str) -> bool {
    candidate.len() > ancestor.len()
        && candidate.starts_with(ancestor)
        && candidate.as_bytes()[ancestor.len()] == b'/'
}

/// Fresh id for an externally triggered call.
pub fn new_root_intent_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_ids_extend_their_parent() {
        let root = new_root_intent_id();
        let child = derive_intent_id(&root, 0);
        let grandchild = derive_intent_id(&child, 3);
        assert!(is_descendant_of(&child, &root));
        assert!(is_descendant_of(&grandchild, &root));
        assert!(!is_descendant_of(&root, &child));
        assert!(!is_descendant_of(&format!("{root}x"), &root));
    }

    #[test]
    fn persisted_method_ignores_etag_for_attempt_identity() {
        let a = MethodId::new("Bar").persisted("i-1");
        let b = a.clone().with_etag(Some("e1".into()));
        assert!(a.same_attempt(&b));
        assert_ne!(a, b);
        assert_eq!(b.to_string(), "Bar#i-1");
    }
}
