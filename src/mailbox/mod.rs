//! Correlation of outgoing records with their eventual results.
//!
//! [`Mailbox`] hands out single-use reply slots; [`CancelRegistry`] maps the
//! same keys to cancellation tokens so a client can abort one in-flight
//! operation by slot.

pub mod cancel_registry;
pub mod slots;

pub use cancel_registry::{CancelAction, CancelRegistry};
pub use slots::{Mailbox, MailboxHandle};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailboxError {
    #[error("wait for mailbox slot {slot} was canceled")]
    Canceled { slot: String },
    #[error("timed out waiting for mailbox slot {slot}")]
    TimedOut { slot: String },
    #[error("mailbox slot {slot} was abandoned before a result arrived")]
    Abandoned { slot: String },
}
