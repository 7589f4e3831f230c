use super::RemoteError;
use crate::cancel::CancelToken;
use crossbeam::channel::{self, Receiver, Sender};

/// Bounds the number of in-flight remote operations across all streams.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    release: Sender<()>,
    permits: Receiver<()>,
    capacity: usize,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (release, permits) = channel::bounded(capacity);
        for _ in 0..capacity {
            let _ = release.try_send(());
        }
        Self {
            release,
            permits,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.len()
    }

    /// Waits for a free slot, giving up when `cancel` fires.
    pub fn acquire(&self, cancel: &CancelToken) -> Result<Permit, RemoteError> {
        cancel.check()?;
        channel::select! {
            recv(self.permits) -> permit => match permit {
                Ok(()) => Ok(Permit { release: self.release.clone() }),
                Err(_) => Err(RemoteError::Canceled),
            },
            recv(cancel.done()) -> _ => Err(RemoteError::Canceled),
        }
    }
}

/// Slot held for the duration of one remote operation.
pub struct Permit {
    release: Sender<()>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let _ = self.release.try_send(());
    }
}
