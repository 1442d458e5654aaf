//! Control session: one client connection
//!
//! Each accepted connection gets a reader thread that decodes frames and
//! hands them to the dispatcher, and a writer thread that drains a bounded
//! queue of encoded frames onto the socket. Responses, forwarded query
//! results and status indications are queued without blocking from any
//! thread; a client that stops reading fills its queue and is disconnected.
//! A session owns two correlators: one for traffic with the client and one
//! for queries it forwards to the media backend.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::backend::{MediaBackend, QueryReply, QueryResult, RequestToken, StatusEvent, StatusListener};
use crate::config::NetworkConfig;
use crate::endpoint::{Identified, Identity};
use crate::error::{BackendError, Error, ProtocolError};
use crate::protocol::{Message, MessageCodec, MessageCorrelator, MessageSink, MessageType};
use crate::server::{dispatch, ServerContext};

/// How often an idle writer thread checks whether its session is closing
const WRITER_POLL: Duration = Duration::from_millis(100);

/// Serialized, blocking writer half of a connection. Used by the client,
/// which only ever talks to one server.
pub struct ConnectionWriter {
    stream: Mutex<TcpStream>,
    codec: MessageCodec,
}

impl ConnectionWriter {
    pub fn new(stream: TcpStream, codec: MessageCodec) -> Self {
        Self {
            stream: Mutex::new(stream),
            codec,
        }
    }
}

impl MessageSink for ConnectionWriter {
    fn deliver(&self, message: Message) -> Result<(), ProtocolError> {
        let mut stream = self.stream.lock();
        match self.codec.write_message(&mut *stream, &message) {
            Ok(()) => Ok(()),
            Err(Error::Protocol(e)) => Err(e),
            Err(e) => {
                tracing::debug!("Write of {:?} failed: {}", message.msg_type, e);
                Err(ProtocolError::ConnectionClosed)
            }
        }
    }
}

/// Non-blocking writer half of a session: frames are encoded by the caller
/// and queued for the session's writer thread.
struct SessionOutbox {
    name: String,
    frames: Sender<Bytes>,
    codec: MessageCodec,
    control: TcpStream,
    overflowed: AtomicBool,
}

impl MessageSink for SessionOutbox {
    fn deliver(&self, message: Message) -> Result<(), ProtocolError> {
        let frame = self.codec.encode(&message)?;
        match self.frames.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                if !self.overflowed.swap(true, Ordering::SeqCst) {
                    tracing::warn!("{}: client is not reading, disconnecting", self.name);
                    let _ = self.control.shutdown(Shutdown::Both);
                }
                Err(ProtocolError::ConnectionClosed)
            }
            Err(TrySendError::Disconnected(_)) => Err(ProtocolError::ConnectionClosed),
        }
    }
}

/// Writer thread: drain queued frames until the session closes or a write
/// fails. A failed or timed-out write takes the connection down with it.
fn write_frames(name: String, mut stream: TcpStream, frames: Receiver<Bytes>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        let frame = match frames.recv_timeout(WRITER_POLL) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if let Err(e) = stream.write_all(&frame).and_then(|()| stream.flush()) {
            tracing::debug!("{}: write failed: {}", name, e);
            let _ = stream.shutdown(Shutdown::Both);
            break;
        }
    }
}

/// Hands forwarded query requests to the backend, keyed by correlator id.
struct BackendBridge {
    backend: Arc<dyn MediaBackend>,
    session: Weak<Session>,
}

impl MessageSink for BackendBridge {
    fn deliver(&self, message: Message) -> Result<(), ProtocolError> {
        let query = dispatch::media_query(&message)?;
        let response_type = message
            .msg_type
            .response_type()
            .ok_or(ProtocolError::NotARequest(message.msg_type))?;
        let token = message.id.ok_or(ProtocolError::MissingId(message.msg_type))?;

        self.backend.query(
            query,
            token,
            Arc::new(QueryCompletion {
                session: self.session.clone(),
                response_type,
            }),
        );
        Ok(())
    }
}

/// Turns a backend result back into a response for the backend correlator.
struct QueryCompletion {
    session: Weak<Session>,
    response_type: MessageType,
}

impl QueryReply for QueryCompletion {
    fn reply(&self, token: RequestToken, result: Result<QueryResult, BackendError>) {
        // Session gone: nothing is waiting for this answer
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let response = dispatch::query_response(self.response_type, token, result);
        session.backend_correlator.on_response(response);
    }
}

/// Session snapshot for listings
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub serial: u64,
    pub id: String,
    pub peer: String,
    pub greeted: bool,
    pub idle_ms: u64,
    pub pending_queries: usize,
    pub connected_at: DateTime<Utc>,
}

/// One connected control client
pub struct Session {
    serial: u64,
    identity: Identity,
    peer: SocketAddr,
    control: TcpStream,
    peer_correlator: MessageCorrelator,
    backend_correlator: MessageCorrelator,
    greeted: AtomicBool,
    closing: AtomicBool,
    writer_running: Arc<AtomicBool>,
    writer: Mutex<Option<JoinHandle<()>>>,
    last_seen: Mutex<Instant>,
    connected_at: DateTime<Utc>,
}

impl Session {
    /// Set up a session for an accepted connection and start its writer
    /// thread. The reader loop is [`run`].
    pub fn new(
        serial: u64,
        stream: &TcpStream,
        backend: Arc<dyn MediaBackend>,
        network: &NetworkConfig,
    ) -> std::io::Result<Arc<Self>> {
        let peer = stream.peer_addr()?;
        let control = stream.try_clone()?;
        let id = format!("session-{serial}");

        stream.set_write_timeout(Some(network.write_timeout()))?;
        let (frames, queued) = bounded(network.outbound_queue_len.max(1));
        let outbox = Arc::new(SessionOutbox {
            name: id.clone(),
            frames,
            codec: MessageCodec::new(network.max_frame_size),
            control: stream.try_clone()?,
            overflowed: AtomicBool::new(false),
        });

        let writer_running = Arc::new(AtomicBool::new(true));
        let writer_stream = stream.try_clone()?;
        let running = writer_running.clone();
        let writer_name = id.clone();
        let writer = thread::Builder::new()
            .name(format!("session-writer-{peer}"))
            .spawn(move || write_frames(writer_name, writer_stream, queued, running))?;

        Ok(Arc::new_cyclic(|weak| Self {
            serial,
            identity: Identity::new(id.clone()),
            peer,
            control,
            peer_correlator: MessageCorrelator::new(id.clone(), outbox),
            backend_correlator: MessageCorrelator::new(
                format!("{id}-backend"),
                Arc::new(BackendBridge {
                    backend,
                    session: weak.clone(),
                }),
            ),
            greeted: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            writer_running,
            writer: Mutex::new(Some(writer)),
            last_seen: Mutex::new(Instant::now()),
            connected_at: Utc::now(),
        }))
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_greeted(&self) -> bool {
        self.greeted.load(Ordering::SeqCst)
    }

    pub(crate) fn set_greeted(&self) {
        self.greeted.store(true, Ordering::SeqCst);
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn peer_correlator(&self) -> &MessageCorrelator {
        &self.peer_correlator
    }

    pub fn backend_correlator(&self) -> &MessageCorrelator {
        &self.backend_correlator
    }

    /// Send a response; failures mean the connection is going away.
    pub fn send_response(&self, response: Message) {
        if let Err(e) = self.peer_correlator.queue_response(response) {
            tracing::debug!("{}: response not sent: {}", self.id(), e);
        }
    }

    pub fn send_indication(&self, indication: Message) {
        if let Err(e) = self.peer_correlator.queue_indication(indication) {
            tracing::debug!("{}: indication not sent: {}", self.id(), e);
        }
    }

    /// Close the socket; the reader thread then winds the session down.
    pub fn shutdown(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            let _ = self.control.shutdown(Shutdown::Both);
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Stop and join the writer thread. Frames still queued are dropped.
    fn stop_writer(&self) {
        self.writer_running.store(false, Ordering::SeqCst);
        let handle = self.writer.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("{}: writer thread panicked", self.id());
            }
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            serial: self.serial,
            id: self.id(),
            peer: self.peer.to_string(),
            greeted: self.is_greeted(),
            idle_ms: self.idle_for().as_millis() as u64,
            pending_queries: self.backend_correlator.pending_count(),
            connected_at: self.connected_at,
        }
    }
}

impl Identified for Session {
    fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl StatusListener for Session {
    fn on_status(&self, event: &StatusEvent) {
        self.send_indication(dispatch::status_indication(event));
    }
}

/// Reader loop for one connection; returns once the connection is gone.
pub fn run(ctx: Arc<ServerContext>, session: Arc<Session>, mut stream: TcpStream) {
    tracing::info!("Control session {} connected from {}", session.id(), session.peer());

    let codec = MessageCodec::new(ctx.config.network.max_frame_size);
    let mut buf = BytesMut::new();

    loop {
        match codec.read_message(&mut stream, &mut buf) {
            Ok(Some(message)) => {
                session.touch();
                dispatch::handle(&ctx, &session, message);
            }
            Ok(None) => {
                tracing::info!("Control session {} closed by peer", session.id());
                break;
            }
            Err(e) => {
                if session.is_closing() {
                    tracing::info!("Control session {} closed", session.id());
                } else {
                    tracing::warn!("Control session {} failed: {}", session.id(), e);
                }
                break;
            }
        }
    }

    teardown(&ctx, &session);
}

/// Release everything a session owns.
pub fn teardown(ctx: &ServerContext, session: &Arc<Session>) {
    session.shutdown();
    session.stop_writer();
    ctx.subscribers.unsubscribe(session.serial());
    ctx.sessions.unregister(session);

    let discarded = session.peer_correlator.close() + session.backend_correlator.close();
    if discarded > 0 {
        tracing::debug!("{}: dropped {} unanswered requests", session.id(), discarded);
    }

    let serial = session.serial();
    for endpoint in ctx.endpoints.drain_where(|e| e.owner() == Some(serial)) {
        tracing::info!("Removing endpoint {} of closed session {}", endpoint.id(), session.id());
        endpoint.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    #[test]
    fn test_full_outbox_disconnects_instead_of_blocking() {
        let (server, mut client) = connected_pair();
        let (frames, queued) = bounded(2);
        let outbox = SessionOutbox {
            name: "slow".into(),
            frames,
            codec: MessageCodec::default(),
            control: server.try_clone().unwrap(),
            overflowed: AtomicBool::new(false),
        };

        let ping = || Message::new(MessageType::PingRsp).with_id(1);
        outbox.deliver(ping()).unwrap();
        outbox.deliver(ping()).unwrap();

        let started = Instant::now();
        assert!(matches!(outbox.deliver(ping()), Err(ProtocolError::ConnectionClosed)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(queued.len(), 2);

        // The overflow shut the socket: the client sees end of stream
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut byte = [0u8; 1];
        assert_eq!(client.read(&mut byte).unwrap(), 0);
    }

    #[test]
    fn test_writer_drains_queue_in_order() {
        let (server, mut client) = connected_pair();
        let (frames, queued) = bounded(8);
        let running = Arc::new(AtomicBool::new(true));
        let writer = {
            let running = running.clone();
            thread::spawn(move || write_frames("writer".into(), server, queued, running))
        };

        let codec = MessageCodec::default();
        for id in 1..=3 {
            frames
                .send(codec.encode(&Message::new(MessageType::PingRsp).with_id(id)).unwrap())
                .unwrap();
        }

        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = BytesMut::new();
        for id in 1..=3 {
            let message = codec.read_message(&mut client, &mut buf).unwrap().unwrap();
            assert_eq!(message.id, Some(id));
        }

        running.store(false, Ordering::SeqCst);
        writer.join().unwrap();
    }
}
