use super::ServerShared;
use crate::cancel::CancelToken;
use crate::dispatch::{Responder, ResponderEntry};
use crate::record::{
    AckResult, ErrorCode, ErrorInfo, Record, RecordResult, ResultKind, RunSettings,
    ServerRequest, ServerRequestKind, ServerResponse, ServerResponseKind,
};
use crate::shared::ids::new_connection_id;
use crate::stream::Stream;
use crate::wire::{decode_message, write_message, FrameReader};
use crossbeam::channel::{self, Receiver, Sender};
use std::collections::BTreeSet;
use std::io::BufWriter;
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

/// Hands responses to the connection's write thread without blocking.
struct ConnectionResponder {
    connection_id: String,
    outbound: Sender<ServerResponse>,
}

impl Responder for ConnectionResponder {
    fn respond(&self, response: ServerResponse) {
        if self.outbound.send(response).is_err() {
            tracing::debug!(connection_id = %self.connection_id, "connection: closed, response dropped");
        }
    }
}

pub(super) struct Connection {
    id: String,
    shared: Arc<ServerShared>,
    outbound: Sender<ServerResponse>,
    outbound_rx: Receiver<ServerResponse>,
    responder: Arc<ConnectionResponder>,
    /// Streams this connection is registered on as a responder.
    streams: Mutex<BTreeSet<String>>,
}

impl Connection {
    pub(super) fn new(shared: Arc<ServerShared>) -> Self {
        let id = new_connection_id();
        let (outbound, outbound_rx) = channel::unbounded();
        let responder = Arc::new(ConnectionResponder {
            connection_id: id.clone(),
            outbound: outbound.clone(),
        });
        Self {
            id,
            shared,
            outbound,
            outbound_rx,
            responder,
            streams: Mutex::new(BTreeSet::new()),
        }
    }

    pub(super) fn id(&self) -> &str {
        &self.id
    }

    /// Read loop; owns the connection until the client goes away or the
    /// byte stream can no longer be trusted.
    pub(super) fn run(self, socket: TcpStream) {
        tracing::info!(connection_id = %self.id, "connection: opened");
        let closed = CancelToken::new();
        let writer = match socket.try_clone() {
            Ok(write_socket) => {
                let connection_id = self.id.clone();
                let outbound = self.outbound_rx.clone();
                let closed = closed.clone();
                thread::Builder::new()
                    .name("server-conn-write".to_string())
                    .spawn(move || write_loop(&connection_id, write_socket, &outbound, &closed))
                    .map_err(|err| {
                        tracing::error!(connection_id = %self.id, error = %err, "connection: failed to spawn writer");
                    })
                    .ok()
            }
            Err(err) => {
                tracing::error!(connection_id = %self.id, error = %err, "connection: failed to clone socket");
                None
            }
        };

        if writer.is_some() {
            self.read_loop(&socket);
        }

        self.unregister();
        closed.cancel();
        if let Some(writer) = writer {
            if writer.join().is_err() {
                tracing::error!(connection_id = %self.id, "connection: writer thread panicked");
            }
        }
        let _ = socket.shutdown(Shutdown::Both);
        tracing::info!(connection_id = %self.id, "connection: closed");
    }

    fn read_loop(&self, socket: &TcpStream) {
        let mut frames = FrameReader::with_max_payload(socket, self.shared.settings.max_frame_bytes);
        loop {
            let payload = match frames.next_frame() {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    tracing::debug!(connection_id = %self.id, "connection: client closed");
                    return;
                }
                Err(err) if err.desynchronizes_stream() => {
                    tracing::error!(connection_id = %self.id, error = %err, "connection: framing error, closing");
                    return;
                }
                Err(err) => {
                    tracing::debug!(connection_id = %self.id, error = %err, "connection: read ended");
                    return;
                }
            };
            match decode_message::<ServerRequest>(&payload) {
                Ok(request) => self.handle_request(request),
                Err(err) => {
                    tracing::error!(connection_id = %self.id, error = %err, "connection: undecodable request, closing");
                    return;
                }
            }
        }
    }

    fn handle_request(&self, request: ServerRequest) {
        let ServerRequest { request_id, kind } = request;
        match kind {
            ServerRequestKind::InformInit { stream_id, settings } => {
                self.inform_init(stream_id, settings);
            }
            ServerRequestKind::InformStart { stream_id, settings } => {
                if let Some(stream) = self.find_stream(&stream_id) {
                    stream.update_settings(settings);
                    self.attach(&stream);
                }
            }
            ServerRequestKind::InformAttach { stream_id } => {
                if let Some(stream) = self.find_stream(&stream_id) {
                    self.attach(&stream);
                    self.send(ServerResponse {
                        request_id,
                        kind: ServerResponseKind::InformAttachResponse {
                            stream_id,
                            settings: stream.settings(),
                        },
                    });
                }
            }
            ServerRequestKind::RecordPublish(record) => self.route_record(record, false),
            ServerRequestKind::RecordCommunicate(record) => self.route_record(record, true),
            ServerRequestKind::InformFinish { stream_id } => {
                self.forget(&stream_id);
                match self.shared.mux.remove_stream(&stream_id) {
                    Ok(stream) => stream.close(),
                    Err(err) => tracing::warn!(connection_id = %self.id, error = %err, "connection: finish for unknown stream"),
                }
            }
            ServerRequestKind::InformTeardown { exit_code } => {
                tracing::info!(connection_id = %self.id, exit_code, "connection: teardown requested");
                self.shared
                    .mux
                    .finish_and_close_all(exit_code, self.shared.settings.shutdown_timeout());
                self.shared.teardown.cancel();
            }
        }
    }

    fn inform_init(&self, stream_id: String, settings: RunSettings) {
        let stream = Arc::new(Stream::new(
            stream_id.clone(),
            settings,
            self.shared.services.clone(),
        ));
        if let Err(err) = self.shared.mux.add_stream(Arc::clone(&stream)) {
            tracing::warn!(connection_id = %self.id, error = %err, "connection: init ignored");
            return;
        }
        self.attach(&stream);
        if let Err(err) = stream.start() {
            tracing::error!(connection_id = %self.id, stream_id = %stream_id, error = %err, "connection: stream failed to start");
            self.forget(&stream_id);
            if let Ok(stream) = self.shared.mux.remove_stream(&stream_id) {
                stream.close();
            }
        }
    }

    fn route_record(&self, mut record: Record, communicate: bool) {
        // Results for socket clients always go back over the socket.
        record.control.local = false;
        record.control.connection_id = self.id.clone();
        if communicate {
            record.control.req_resp = true;
        }
        let Some(stream) = self.find_stream(&record.stream_id) else {
            if record.requests_result() {
                let error = ErrorInfo::new(
                    ErrorCode::InvalidRequest,
                    format!("stream {} not found", record.stream_id),
                );
                self.send(ServerResponse::result(RecordResult::for_record(
                    &record,
                    ResultKind::Ack(AckResult { error: Some(error) }),
                )));
            }
            return;
        };
        if let Err(err) = stream.handle_record(record) {
            tracing::warn!(connection_id = %self.id, error = %err, "connection: record not accepted");
        }
    }

    fn find_stream(&self, stream_id: &str) -> Option<Arc<Stream>> {
        match self.shared.mux.get_stream(stream_id) {
            Ok(stream) => Some(stream),
            Err(err) => {
                tracing::warn!(connection_id = %self.id, error = %err, "connection: unknown stream");
                None
            }
        }
    }

    fn attach(&self, stream: &Stream) {
        let newly_added = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stream.id().to_string());
        if newly_added {
            let responder: Arc<dyn Responder> = self.responder.clone();
            stream.add_responders([ResponderEntry::new(self.id.clone(), responder)]);
        }
    }

    fn forget(&self, stream_id: &str) {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(stream_id);
    }

    fn unregister(&self) {
        let streams = std::mem::take(
            &mut *self.streams.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for stream_id in streams {
            if let Ok(stream) = self.shared.mux.get_stream(&stream_id) {
                stream.remove_responder(&self.id);
            }
        }
    }

    fn send(&self, response: ServerResponse) {
        if self.outbound.send(response).is_err() {
            tracing::debug!(connection_id = %self.id, "connection: writer gone, response dropped");
        }
    }
}

fn write_loop(
    connection_id: &str,
    socket: TcpStream,
    outbound: &Receiver<ServerResponse>,
    closed: &CancelToken,
) {
    let mut writer = BufWriter::new(socket);
    loop {
        let response = channel::select! {
            recv(outbound) -> response => match response {
                Ok(response) => response,
                Err(_) => return,
            },
            recv(closed.done()) -> _ => {
                // Flush what was already queued before the read side ended.
                for response in outbound.try_iter() {
                    if write_message(&mut writer, &response).is_err() {
                        break;
                    }
                }
                return;
            }
        };
        if let Err(err) = write_message(&mut writer, &response) {
            tracing::warn!(connection_id, error = %err, "connection: write failed");
            let _ = writer.get_ref().shutdown(Shutdown::Both);
            return;
        }
    }
}
