use super::{Stream, StreamError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Live streams by id.
#[derive(Default)]
pub struct StreamMux {
    streams: Mutex<HashMap<String, Arc<Stream>>>,
}

impl StreamMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stream(&self, stream: Arc<Stream>) -> Result<(), StreamError> {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        if streams.contains_key(stream.id()) {
            return Err(StreamError::Duplicate {
                stream_id: stream.id().to_string(),
            });
        }
        streams.insert(stream.id().to_string(), stream);
        Ok(())
    }

    pub fn get_stream(&self, stream_id: &str) -> Result<Arc<Stream>, StreamError> {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream_id)
            .cloned()
            .ok_or_else(|| StreamError::NotFound {
                stream_id: stream_id.to_string(),
            })
    }

    pub fn remove_stream(&self, stream_id: &str) -> Result<Arc<Stream>, StreamError> {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(stream_id)
            .ok_or_else(|| StreamError::NotFound {
                stream_id: stream_id.to_string(),
            })
    }

    pub fn stream_ids(&self) -> Vec<String> {
        let mut ids = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every stream and finishes them concurrently.
    pub fn finish_and_close_all(&self, exit_code: i32, grace: Duration) {
        let streams = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, stream)| stream)
            .collect::<Vec<_>>();
        if streams.is_empty() {
            return;
        }
        tracing::info!(streams = streams.len(), exit_code, "mux: finishing all streams");
        thread::scope(|scope| {
            for stream in &streams {
                scope.spawn(move || stream.finish_and_close(exit_code, grace));
            }
        });
    }
}
