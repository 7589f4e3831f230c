//! Cooperative cancellation shared by every blocking operation.
//!
//! A [`CancelToken`] is cheap to clone; all clones observe the same state.
//! [`CancelToken::child`] derives a token that is canceled together with its
//! parent but can also be canceled on its own.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation canceled")]
pub struct Canceled;

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    done: Receiver<()>,
}

struct State {
    // Dropped on cancel; disconnects every clone of `done`.
    trigger: Option<Sender<()>>,
    children: Vec<Weak<Inner>>,
}

impl Inner {
    fn new() -> Arc<Self> {
        let (trigger, done) = channel::bounded(0);
        Arc::new(Self {
            state: Mutex::new(State {
                trigger: Some(trigger),
                children: Vec::new(),
            }),
            done,
        })
    }

    fn cancel(&self) {
        let children = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.trigger.take().is_none() {
                return;
            }
            std::mem::take(&mut state.children)
        };
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }

    fn is_canceled(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .trigger
            .is_none()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Inner::new(),
        }
    }

    /// Derives a token canceled whenever `self` is.
    pub fn child(&self) -> Self {
        let child = Inner::new();
        let parent_canceled = {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if state.trigger.is_some() {
                state.children.retain(|weak| weak.strong_count() > 0);
                state.children.push(Arc::downgrade(&child));
                false
            } else {
                true
            }
        };
        if parent_canceled {
            child.cancel();
        }
        Self { inner: child }
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.is_canceled()
    }

    pub fn check(&self) -> Result<(), Canceled> {
        if self.is_canceled() {
            Err(Canceled)
        } else {
            Ok(())
        }
    }

    /// Channel that never yields a value and disconnects once canceled.
    ///
    /// Meant for `crossbeam::select!` arms next to other blocking operations.
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done
    }

    pub fn wait(&self) {
        let _ = self.inner.done.recv();
    }

    /// Returns true if the token was canceled before `timeout` elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.inner.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn cancel_is_visible_to_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_canceled());
        token.cancel();
        assert!(clone.is_canceled());
        assert_eq!(clone.check(), Err(Canceled));
    }

    #[test]
    fn parent_cancel_reaches_children_but_not_the_reverse() {
        let parent = CancelToken::new();
        let first = parent.child();
        let second = parent.child();

        first.cancel();
        assert!(first.is_canceled());
        assert!(!parent.is_canceled());
        assert!(!second.is_canceled());

        parent.cancel();
        assert!(second.is_canceled());
    }

    #[test]
    fn child_of_canceled_parent_starts_canceled() {
        let parent = CancelToken::new();
        parent.cancel();
        assert!(parent.child().is_canceled());
    }

    #[test]
    fn wait_unblocks_when_canceled_from_another_thread() {
        let token = CancelToken::new();
        let remote = token.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });
        token.wait();
        handle.join().expect("join canceller");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn wait_timeout_reports_expiry() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(10)));
        token.cancel();
        assert!(token.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn done_channel_participates_in_select() {
        let token = CancelToken::new();
        let (_tx, rx) = channel::bounded::<u8>(0);
        token.cancel();
        let fired = channel::select! {
            recv(rx) -> _ => false,
            recv(token.done()) -> _ => true,
        };
        assert!(fired);
    }
}
