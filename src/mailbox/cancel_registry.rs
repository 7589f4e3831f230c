use crate::cancel::CancelToken;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Extra work run when a registered operation is canceled by key.
pub type CancelAction = Box<dyn FnOnce() + Send>;

struct Registration {
    token: CancelToken,
    on_cancel: Option<CancelAction>,
}

/// Cancellation handles for in-flight operations, keyed by mailbox slot.
#[derive(Default)]
pub struct CancelRegistry {
    entries: Mutex<HashMap<String, Registration>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `key` and returns the token the operation should watch.
    ///
    /// With a parent the token is a child of it; otherwise a fresh token is
    /// created. Re-registering a key replaces the earlier entry.
    pub fn add(
        &self,
        key: impl Into<String>,
        parent: Option<&CancelToken>,
        on_cancel: Option<CancelAction>,
    ) -> CancelToken {
        let key = key.into();
        let token = parent.map(CancelToken::child).unwrap_or_default();
        let previous = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key.clone(),
                Registration {
                    token: token.clone(),
                    on_cancel,
                },
            );
        if previous.is_some() {
            tracing::warn!(key = %key, "cancel registry: replaced existing registration");
        }
        token
    }

    /// Cancels the operation under `key` and runs its action.
    ///
    /// Unknown keys are a no-op; the operation may already have finished.
    pub fn cancel(&self, key: &str) -> bool {
        let registration = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        let Some(registration) = registration else {
            tracing::debug!(key, "cancel registry: nothing registered");
            return false;
        };
        registration.token.cancel();
        if let Some(action) = registration.on_cancel {
            action();
        }
        true
    }

    /// Forgets `key` once its operation completes normally.
    pub fn remove(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn cancel_fires_token_and_action_once() {
        let registry = CancelRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let token = registry.add(
            "slot-a",
            None,
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        assert!(registry.cancel("slot-a"));
        assert!(token.is_canceled());
        assert!(!registry.cancel("slot-a"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn registered_token_follows_its_parent() {
        let registry = CancelRegistry::new();
        let parent = CancelToken::new();
        let token = registry.add("slot-a", Some(&parent), None);
        parent.cancel();
        assert!(token.is_canceled());
    }

    #[test]
    fn cancel_by_key_leaves_parent_alone() {
        let registry = CancelRegistry::new();
        let parent = CancelToken::new();
        let token = registry.add("slot-a", Some(&parent), None);
        registry.cancel("slot-a");
        assert!(token.is_canceled());
        assert!(!parent.is_canceled());
    }

    #[test]
    fn remove_prevents_later_cancel() {
        let registry = CancelRegistry::new();
        let token = registry.add("slot-a", None, None);
        assert!(registry.remove("slot-a"));
        assert!(!registry.cancel("slot-a"));
        assert!(!token.is_canceled());
    }
}
