//! Control server
//!
//! [`ServerContext`] is built once at startup and handed to everything that
//! needs shared services: the timer scheduler, the registries, the endpoint
//! hub and the media backend. [`Server`] accepts control connections and
//! runs one session thread per client.

pub mod dispatch;
pub mod session;
pub mod subscribers;

use chrono::{DateTime, Utc};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::backend::{MediaBackend, ToneBackend};
use crate::config::AppConfig;
use crate::endpoint::{AudioEndpoint, EndpointHub, EndpointRegistry, Identified};
use crate::error::{Error, NetworkError, Result};
use crate::timer::{Timer, TimerScheduler};

pub use session::{Session, SessionInfo};
pub use subscribers::StatusSubscribers;

/// Shared services, passed explicitly to every component
pub struct ServerContext {
    pub config: AppConfig,
    pub scheduler: Arc<TimerScheduler>,
    pub endpoints: Arc<EndpointRegistry<AudioEndpoint>>,
    pub sessions: EndpointRegistry<Session>,
    pub hub: Arc<EndpointHub>,
    pub backend: Arc<dyn MediaBackend>,
    pub subscribers: Arc<StatusSubscribers>,
    pub started_at: DateTime<Utc>,
    next_serial: AtomicU64,
}

impl ServerContext {
    /// Build the context around the built-in tone backend.
    pub fn new(config: AppConfig) -> Result<Arc<Self>> {
        Self::with_backend(config, |config, hub, scheduler| {
            let backend = ToneBackend::new(config.audio.clone(), hub, scheduler)?;
            Ok(Arc::new(backend) as Arc<dyn MediaBackend>)
        })
    }

    /// Build the context with a backend produced by `make_backend`, which
    /// receives the audio sink and scheduler it should use.
    pub fn with_backend(
        config: AppConfig,
        make_backend: impl FnOnce(&AppConfig, Arc<EndpointHub>, Arc<TimerScheduler>) -> Result<Arc<dyn MediaBackend>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let scheduler = Arc::new(TimerScheduler::start()?);
        let endpoints = Arc::new(EndpointRegistry::new());
        let hub = Arc::new(EndpointHub::new(endpoints.clone()));
        let backend = make_backend(&config, hub.clone(), scheduler.clone())?;
        let subscribers = Arc::new(StatusSubscribers::new());
        backend.set_event_sink(subscribers.clone());

        Ok(Arc::new(Self {
            config,
            scheduler,
            endpoints,
            sessions: EndpointRegistry::new(),
            hub,
            backend,
            subscribers,
            started_at: Utc::now(),
            next_serial: AtomicU64::new(1),
        }))
    }

    pub fn next_session_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    /// Close every session, stop every endpoint and the backend.
    pub fn shutdown(&self) {
        for session in self.sessions.snapshot() {
            session.shutdown();
        }
        for endpoint in self.endpoints.drain_where(|_| true) {
            endpoint.stop();
        }
        self.backend.shutdown();
        self.scheduler.shutdown();
    }

    /// Close sessions that have been silent for longer than the timeout.
    fn reap_idle_sessions(&self) {
        let timeout = Duration::from_millis(self.config.network.keepalive_timeout_ms as u64);
        for session in self.sessions.snapshot() {
            if !session.is_closing() && session.idle_for() > timeout {
                tracing::warn!(
                    "Control session {} idle for {:?}, closing",
                    session.id(),
                    session.idle_for()
                );
                session.shutdown();
            }
        }
    }
}

/// Control-connection listener
pub struct Server {
    ctx: Arc<ServerContext>,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    keepalive: Timer,
}

impl Server {
    /// Bind to the configured control address.
    pub fn bind(ctx: Arc<ServerContext>) -> Result<Self> {
        let network = &ctx.config.network;
        let addr: SocketAddr = format!("{}:{}", network.bind_address, network.control_port)
            .parse()
            .map_err(|e| Error::Config(format!("bind address: {e}")))?;
        Self::bind_to(ctx, addr)
    }

    pub fn bind_to(ctx: Arc<ServerContext>, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|e| NetworkError::BindFailed(format!("{addr}: {e}")))?;
        let local_addr = listener.local_addr()?;

        let weak: Weak<ServerContext> = Arc::downgrade(&ctx);
        let keepalive = Timer::new("keepalive", move || {
            if let Some(ctx) = weak.upgrade() {
                ctx.reap_idle_sessions();
            }
        });

        Ok(Self {
            ctx,
            listener: Some(listener),
            local_addr,
            running: Arc::new(AtomicBool::new(false)),
            accept_thread: None,
            keepalive,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Start accepting connections on a background thread.
    pub fn start(&mut self) -> Result<()> {
        let Some(listener) = self.listener.take() else {
            return Ok(());
        };
        listener.set_nonblocking(true)?;
        self.running.store(true, Ordering::SeqCst);

        let ctx = self.ctx.clone();
        let running = self.running.clone();
        let handle = thread::Builder::new()
            .name("control-listener".to_string())
            .spawn(move || accept_loop(ctx, listener, running))?;
        self.accept_thread = Some(handle);

        self.ctx
            .scheduler
            .add(&self.keepalive, true, self.ctx.config.network.keepalive_interval_ms);

        tracing::info!("Control server listening on {}", self.local_addr);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop accepting and close every session.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.ctx.scheduler.cancel(&self.keepalive);

        if let Some(handle) = self.accept_thread.take() {
            if handle.join().is_err() {
                tracing::error!("Control listener panicked");
            }
            for session in self.ctx.sessions.snapshot() {
                session.shutdown();
            }
            tracing::info!("Control server stopped");
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

const ACCEPT_POLL: Duration = Duration::from_millis(20);

fn accept_loop(ctx: Arc<ServerContext>, listener: TcpListener, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = spawn_session(&ctx, stream) {
                    tracing::warn!("Rejected control connection from {}: {}", peer, e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn spawn_session(ctx: &Arc<ServerContext>, stream: TcpStream) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;

    let session = Session::new(ctx.next_session_serial(), &stream, ctx.backend.clone(), &ctx.config.network)?;
    ctx.sessions.register(session.clone());

    let thread_ctx = ctx.clone();
    let thread_session = session.clone();
    let spawned = thread::Builder::new()
        .name(format!("session-{}", session.peer()))
        .spawn(move || session::run(thread_ctx, thread_session, stream));

    if let Err(e) = spawned {
        session::teardown(ctx, &session);
        return Err(e);
    }
    Ok(())
}
