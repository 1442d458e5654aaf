//! Request/response correlation
//!
//! The correlator stamps outgoing requests with ids, remembers a completion
//! for each, and hands the matching response to that completion exactly
//! once. Completions are owned by the correlator: a response that arrives
//! after teardown finds nothing to call and is dropped.
//!
//! Ids are `u32`, start at 1 and wrap. Zero and any id that is still
//! outstanding are skipped, so an id is never handed out twice while in
//! flight.

use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ProtocolError;
use crate::protocol::message::{Message, MessageKind, MessageType};

/// Request identifier
pub type RequestId = u32;

/// Invoked with the response to a queued request
pub type Completion = Box<dyn FnOnce(Message) + Send>;

/// Where stamped messages are handed for transmission.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, message: Message) -> Result<(), ProtocolError>;
}

impl MessageSink for Sender<Message> {
    fn deliver(&self, message: Message) -> Result<(), ProtocolError> {
        self.send(message).map_err(|_| ProtocolError::ConnectionClosed)
    }
}

struct PendingRequest {
    request_type: MessageType,
    queued_at: Instant,
    completion: Completion,
}

struct CorrelatorState {
    next_id: RequestId,
    pending: HashMap<RequestId, PendingRequest>,
    closed: bool,
}

impl CorrelatorState {
    fn allocate_id(&mut self) -> RequestId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != 0 && !self.pending.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Per-connection registry of in-flight requests
pub struct MessageCorrelator {
    name: String,
    state: Mutex<CorrelatorState>,
    sink: Arc<dyn MessageSink>,
}

impl MessageCorrelator {
    pub fn new(name: impl Into<String>, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(CorrelatorState {
                next_id: 1,
                pending: HashMap::new(),
                closed: false,
            }),
            sink,
        }
    }

    /// Assign an id to `message`, remember `completion`, and send it.
    pub fn queue_request(
        &self,
        mut message: Message,
        completion: impl FnOnce(Message) + Send + 'static,
    ) -> Result<RequestId, ProtocolError> {
        if message.kind() != MessageKind::Request {
            return Err(ProtocolError::NotARequest(message.msg_type));
        }

        let id = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ProtocolError::ConnectionClosed);
            }
            let id = state.allocate_id();
            state.pending.insert(
                id,
                PendingRequest {
                    request_type: message.msg_type,
                    queued_at: Instant::now(),
                    completion: Box::new(completion),
                },
            );
            id
        };
        message.id = Some(id);

        // Sent outside the lock: the sink may answer synchronously
        if let Err(e) = self.sink.deliver(message) {
            self.state.lock().pending.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Send an indication under a fresh id. No answer is expected.
    pub fn queue_indication(&self, mut message: Message) -> Result<RequestId, ProtocolError> {
        if message.kind() != MessageKind::Indication {
            return Err(ProtocolError::Malformed(format!(
                "{:?} is not an indication",
                message.msg_type
            )));
        }

        let id = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ProtocolError::ConnectionClosed);
            }
            state.allocate_id()
        };
        message.id = Some(id);
        self.sink.deliver(message)?;
        Ok(id)
    }

    /// Send a response; it must already carry the id it answers.
    pub fn queue_response(&self, message: Message) -> Result<(), ProtocolError> {
        if message.kind() != MessageKind::Response {
            return Err(ProtocolError::NotAResponse(message.msg_type));
        }
        if message.id.is_none() {
            return Err(ProtocolError::MissingId(message.msg_type));
        }
        if self.state.lock().closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.sink.deliver(message)
    }

    /// Route a response to its waiting completion.
    ///
    /// Returns false when no request is waiting for it; the response is
    /// logged and dropped.
    pub fn on_response(&self, message: Message) -> bool {
        if message.kind() != MessageKind::Response {
            tracing::warn!("{}: {:?} routed as a response, dropping", self.name, message.msg_type);
            return false;
        }
        let Some(id) = message.id else {
            tracing::warn!("{}: {:?} without id, dropping", self.name, message.msg_type);
            return false;
        };

        let pending = self.state.lock().pending.remove(&id);
        match pending {
            Some(pending) => {
                if pending.request_type.response_type() != Some(message.msg_type) {
                    tracing::warn!(
                        "{}: request {} ({:?}) answered with {:?}",
                        self.name,
                        id,
                        pending.request_type,
                        message.msg_type
                    );
                }
                tracing::trace!(
                    "{}: request {} completed after {:?}",
                    self.name,
                    id,
                    pending.queued_at.elapsed()
                );
                (pending.completion)(message);
                true
            }
            None => {
                tracing::warn!(
                    "{}: no pending request for {:?} id {}, dropping",
                    self.name,
                    message.msg_type,
                    id
                );
                false
            }
        }
    }

    /// Queue a request and wait for its response.
    pub fn request_blocking(&self, message: Message, timeout: Duration) -> Result<Message, ProtocolError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let id = self.queue_request(message, move |response| {
            let _ = tx.send(response);
        })?;

        match rx.recv_timeout(timeout) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => {
                self.forget(id);
                Err(ProtocolError::Timeout(id))
            }
            Err(RecvTimeoutError::Disconnected) => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Drop the pending entry for `id` without completing it.
    pub fn forget(&self, id: RequestId) -> bool {
        self.state.lock().pending.remove(&id).is_some()
    }

    /// Tear down: discard every pending request without completing it and
    /// refuse further traffic. Returns how many were discarded.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.pending)
        };

        if !discarded.is_empty() {
            tracing::debug!("{}: discarded {} pending requests", self.name, discarded.len());
        }
        discarded.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    fn set_next_id(&self, id: RequestId) {
        self.state.lock().next_id = id;
    }
}
