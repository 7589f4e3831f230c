//! Client side of the session protocol, used by run processes and tests.

use crate::mailbox::{Mailbox, MailboxError, MailboxHandle};
use crate::record::{
    Record, RecordKind, Request, RunSettings, ServerRequest, ServerRequestKind, ServerResponse,
    ServerResponseKind,
};
use crate::server::{read_port_file, ServerError};
use crate::shared::ids::random_token;
use crate::wire::{decode_message, write_message, FrameReader, WireError};
use crossbeam::channel::{self, Sender};
use std::collections::HashMap;
use std::io::BufWriter;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const PORT_FILE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no port announced in {path} after {waited:?}")]
    PortFileTimeout { path: String, waited: Duration },
    #[error(transparent)]
    PortFile(#[from] ServerError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    #[error("timed out waiting for attach to stream {stream_id}")]
    AttachTimeout { stream_id: String },
}

type PendingAttach = Arc<Mutex<HashMap<String, Sender<RunSettings>>>>;

pub struct ServiceClient {
    socket: TcpStream,
    writer: Mutex<BufWriter<TcpStream>>,
    mailbox: Mailbox,
    pending_attach: PendingAttach,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceClient {
    pub fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let connect_error = |source| ClientError::Connect {
            addr: addr.to_string(),
            source,
        };
        let socket = TcpStream::connect(addr).map_err(connect_error)?;
        let write_socket = socket.try_clone().map_err(connect_error)?;
        let read_socket = socket.try_clone().map_err(connect_error)?;

        let mailbox = Mailbox::new();
        let pending_attach = PendingAttach::default();
        let reader = {
            let mailbox = mailbox.clone();
            let pending_attach = Arc::clone(&pending_attach);
            thread::Builder::new()
                .name("client-read".to_string())
                .spawn(move || read_loop(read_socket, &mailbox, &pending_attach))
                .map_err(connect_error)?
        };

        Ok(Self {
            socket,
            writer: Mutex::new(BufWriter::new(write_socket)),
            mailbox,
            pending_attach,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Waits for the service's port file, then connects on localhost.
    pub fn connect_port_file(path: &Path, timeout: Duration) -> Result<Self, ClientError> {
        let started = Instant::now();
        loop {
            if let Some(port) = read_port_file(path)? {
                return Self::connect(SocketAddr::from(([127, 0, 0, 1], port)));
            }
            if started.elapsed() >= timeout {
                return Err(ClientError::PortFileTimeout {
                    path: path.display().to_string(),
                    waited: timeout,
                });
            }
            thread::sleep(PORT_FILE_POLL);
        }
    }

    pub fn inform_init(&self, stream_id: &str, settings: RunSettings) -> Result<(), ClientError> {
        self.send(ServerRequest::new(ServerRequestKind::InformInit {
            stream_id: stream_id.to_string(),
            settings,
        }))
    }

    pub fn inform_start(&self, stream_id: &str, settings: RunSettings) -> Result<(), ClientError> {
        self.send(ServerRequest::new(ServerRequestKind::InformStart {
            stream_id: stream_id.to_string(),
            settings,
        }))
    }

    /// Registers this connection on an existing stream and returns its
    /// settings.
    pub fn attach(&self, stream_id: &str, timeout: Duration) -> Result<RunSettings, ClientError> {
        let request_id = random_token(16);
        let (tx, rx) = channel::bounded(1);
        self.pending_attach
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id.clone(), tx);
        let sent = self.send(ServerRequest {
            request_id: request_id.clone(),
            kind: ServerRequestKind::InformAttach {
                stream_id: stream_id.to_string(),
            },
        });
        let outcome = sent.and_then(|()| {
            rx.recv_timeout(timeout)
                .map_err(|_| ClientError::AttachTimeout {
                    stream_id: stream_id.to_string(),
                })
        });
        self.pending_attach
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request_id);
        outcome
    }

    /// Fire-and-forget record.
    pub fn publish(&self, record: Record) -> Result<(), ClientError> {
        self.send(ServerRequest::new(ServerRequestKind::RecordPublish(record)))
    }

    /// Sends `record` and returns the handle its result will arrive on.
    pub fn deliver(&self, mut record: Record) -> Result<MailboxHandle, ClientError> {
        let handle = self.mailbox.deliver(&mut record);
        self.send(ServerRequest::new(ServerRequestKind::RecordCommunicate(record)))?;
        Ok(handle)
    }

    /// Asks the service to abort the operation started by `slot`.
    pub fn cancel(&self, stream_id: &str, slot: &str) -> Result<(), ClientError> {
        self.publish(Record::new(
            stream_id,
            RecordKind::Request(Request::Cancel {
                cancel_slot: slot.to_string(),
            }),
        ))
    }

    pub fn inform_finish(&self, stream_id: &str) -> Result<(), ClientError> {
        self.send(ServerRequest::new(ServerRequestKind::InformFinish {
            stream_id: stream_id.to_string(),
        }))
    }

    pub fn inform_teardown(&self, exit_code: i32) -> Result<(), ClientError> {
        self.send(ServerRequest::new(ServerRequestKind::InformTeardown { exit_code }))
    }

    /// Closes the connection; pending handles see an abandoned slot.
    pub fn close(&self) {
        let _ = self.socket.shutdown(Shutdown::Both);
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            let _ = reader.join();
        }
    }

    fn send(&self, request: ServerRequest) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        write_message(&mut *writer, &request)?;
        Ok(())
    }
}

impl Drop for ServiceClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop(socket: TcpStream, mailbox: &Mailbox, pending_attach: &PendingAttach) {
    let mut frames = FrameReader::new(socket);
    loop {
        let payload = match frames.next_frame() {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(error = %err, "client: read ended");
                break;
            }
        };
        let response = match decode_message::<ServerResponse>(&payload) {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(error = %err, "client: undecodable response");
                break;
            }
        };
        match response.kind {
            ServerResponseKind::ResultCommunicate(result) => {
                if !mailbox.respond(&result) {
                    tracing::warn!(slot = %result.control.mailbox_slot, "client: result for unknown slot");
                }
            }
            ServerResponseKind::InformAttachResponse { settings, .. } => {
                let waiter = pending_attach
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&response.request_id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(settings);
                }
            }
        }
    }
    let abandoned = mailbox.abandon_all();
    if abandoned > 0 {
        tracing::debug!(abandoned, "client: connection closed with pending results");
    }
}
