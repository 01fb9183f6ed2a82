//! SSH client session.
//!
//! A [`Session`] owns one transport connection: it performs the version
//! exchange and the initial key exchange, then runs a dispatch loop task
//! that is the only reader of the stream. Callers share the write half
//! through the writer lock and block on oneshot/watch/Notify primitives
//! that only the dispatch loop completes.
//!
//! # Example
//!
//! ```rust,no_run
//! use kestrel_proto::ssh::auth::authenticate_password;
//! use kestrel_proto::ssh::config::SessionConfig;
//! use kestrel_proto::ssh::session::Session;
//!
//! # async fn example() -> kestrel_proto::ssh::Result<()> {
//! let session = Session::connect_tcp("example.com:22", SessionConfig::default()).await?;
//! authenticate_password(&session, "user", "password").await?;
//!
//! let output = session.execute("uname -a").await?;
//! println!("{}", String::from_utf8_lossy(&output.stdout));
//!
//! session.disconnect().await?;
//! # Ok(())
//! # }
//! ```

mod dispatch;
pub mod keepalive;

pub use keepalive::{keepalive_message, KeepaliveTask};

use crate::ssh::channel::{Channel, ChannelEvent};
use crate::ssh::config::SessionConfig;
use crate::ssh::connection::{ChannelRequestType, ChannelType, EXTENDED_DATA_STDERR};
use crate::ssh::error::{Error, Result};
use crate::ssh::kex::{KexContext, KexInit, KeyExchange, NegotiatedAlgorithms};
use crate::ssh::logging;
use crate::ssh::message::{Disconnect, DisconnectReason, GlobalRequest, Message};
use crate::ssh::mux::{Incoming, Mux};
use crate::ssh::packet::PacketOpener;
use crate::ssh::transport::{BoxedWriter, RekeyTracker, SessionState, Transport};
use crate::ssh::version::{self, Version};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::timeout;
use tracing::{debug, info};

/// Read half of the byte stream, type-erased.
pub(crate) type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// Upper bound for writing DISCONNECT during teardown.
const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reply to a global request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalReply {
    /// SSH_MSG_REQUEST_SUCCESS with its request-specific data
    Success(Vec<u8>),
    /// SSH_MSG_REQUEST_FAILURE
    Failure,
    /// The request was sent without want_reply
    NoReply,
}

/// Collected result of [`Session::execute`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Bytes received on the data stream
    pub stdout: Vec<u8>,
    /// Bytes received as extended data type 1
    pub stderr: Vec<u8>,
    /// Value of the exit-status request, if the server sent one
    pub exit_status: Option<u32>,
    /// Signal name from the exit-signal request, if the server sent one
    pub exit_signal: Option<String>,
}

/// How the dispatch loop ended.
#[derive(Debug)]
pub(crate) enum Exit {
    /// Local disconnect or session handle dropped
    Local,
    /// Peer sent DISCONNECT
    Peer(Error),
    /// Unrecoverable error on either side
    Fatal(Error),
}

/// Results of the key exchanges so far.
#[derive(Debug, Default)]
struct KexRecord {
    session_id: Option<Vec<u8>>,
    algorithms: Option<NegotiatedAlgorithms>,
    host_key: Option<Vec<u8>>,
    completed: u32,
}

/// Callers waiting for transport-level replies.
#[derive(Default)]
struct Pending {
    service: Option<oneshot::Sender<Result<String>>>,
    global: VecDeque<oneshot::Sender<GlobalReply>>,
}

/// State shared by the session handle, its channels and the dispatch loop.
pub(crate) struct SessionInner {
    pub(crate) config: SessionConfig,
    client_version: Version,
    server_version: Version,
    pub(crate) transport: tokio::sync::Mutex<Transport>,
    pub(crate) mux: Mux,
    state: watch::Sender<SessionState>,
    /// `true` while a key exchange runs
    kex_gate: watch::Sender<bool>,
    record: Mutex<KexRecord>,
    authenticated: AtomicBool,
    inbound_seq: AtomicU32,
    inbound_bytes: AtomicU64,
    pending: Mutex<Pending>,
    services: Mutex<Vec<String>>,
    global_ops: tokio::sync::Mutex<()>,
    auth_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    auth_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<Channel>>>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Channel>>,
    shutdown: Notify,
    cause: Mutex<Option<Error>>,
    keepalive: Mutex<Option<KeepaliveTask>>,
}

impl SessionInner {
    fn new(
        config: SessionConfig,
        client_version: Version,
        server_version: Version,
        writer: BoxedWriter,
    ) -> Self {
        let (auth_tx, auth_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let rekey = RekeyTracker::new(config.rekey_bytes, config.rekey_interval);

        Self {
            mux: Mux::new(&config),
            transport: tokio::sync::Mutex::new(Transport::new(writer, rekey)),
            config,
            client_version,
            server_version,
            state: watch::Sender::new(SessionState::Disconnected),
            kex_gate: watch::Sender::new(false),
            record: Mutex::new(KexRecord::default()),
            authenticated: AtomicBool::new(false),
            inbound_seq: AtomicU32::new(0),
            inbound_bytes: AtomicU64::new(0),
            pending: Mutex::new(Pending::default()),
            services: Mutex::new(Vec::new()),
            global_ops: tokio::sync::Mutex::new(()),
            auth_tx: Mutex::new(Some(auth_tx)),
            auth_rx: tokio::sync::Mutex::new(auth_rx),
            incoming_tx: Mutex::new(Some(incoming_tx)),
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            shutdown: Notify::new(),
            cause: Mutex::new(None),
            keepalive: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.state().is_closing()
    }

    fn transition(&self, next: SessionState) -> Result<()> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            let before = *state;
            match state.transition(next) {
                Ok(()) => before != next,
                Err(e) => {
                    result = Err(e);
                    false
                }
            }
        });
        result
    }

    /// Error handed to callers blocked on a session that went away.
    pub(crate) fn lost_error(&self) -> Error {
        match lock(&self.cause).as_ref() {
            Some(Error::ConnectionLost(msg)) => Error::ConnectionLost(msg.clone()),
            Some(e) => Error::ConnectionLost(format!("session terminated: {}", e)),
            None => Error::ConnectionLost("session closed".into()),
        }
    }

    fn check_alive(&self) -> Result<()> {
        if self.is_closing() {
            return Err(self.lost_error());
        }
        Ok(())
    }

    fn first_kex_done(&self) -> bool {
        lock(&self.record).session_id.is_some()
    }

    fn set_cause(&self, err: Error) {
        let mut cause = lock(&self.cause);
        if cause.is_none() {
            *cause = Some(err);
        }
    }

    fn cause(&self) -> Option<Error> {
        lock(&self.cause).clone()
    }

    /// Records a fatal error found outside the dispatch loop and wakes it.
    pub(crate) fn fail(&self, err: Error) {
        self.set_cause(err);
        self.shutdown.notify_one();
    }

    async fn wait_kex_idle(&self) -> Result<()> {
        let mut gate = self.kex_gate.subscribe();
        gate.wait_for(|busy| !*busy)
            .await
            .map_err(|_| self.lost_error())?;
        self.check_alive()
    }

    /// Sends an application message, waiting out any key exchange.
    ///
    /// Only the wait is bounded. A timeout means nothing was written; once
    /// the writer is held with no exchange running the write completes.
    ///
    /// # Errors
    ///
    /// - [`Error::OperationTimedOut`] if the key exchange does not finish
    ///   within the operation timeout
    /// - [`Error::ConnectionLost`] if the session is or goes down
    pub(crate) async fn send(&self, msg: Message) -> Result<()> {
        let wait = self.config.operation_timeout;
        let ready = timeout(wait, async {
            loop {
                self.wait_kex_idle().await?;
                let transport = self.transport.lock().await;
                self.check_alive()?;
                if !transport.kex_in_progress() {
                    return Ok::<_, Error>(transport);
                }
            }
        })
        .await;
        let mut transport = ready.map_err(|_| {
            Error::OperationTimedOut(format!("sending {} (key exchange pending)", msg.name()))
        })??;

        if let Err(e) = transport.write_message(&msg).await {
            self.fail(e.clone());
            return Err(e);
        }
        if let Err(e) = self.maybe_rekey_locked(&mut transport).await {
            self.fail(e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Writes a message produced by the dispatch loop itself, deferring
    /// connection-layer messages while a key exchange runs.
    pub(crate) async fn reply(&self, msg: Message) -> Result<()> {
        let mut transport = self.transport.lock().await;
        transport.write_or_defer(msg).await
    }

    /// Starts a key exchange by sending our KEXINIT. No-op if one runs.
    async fn begin_kex_locked(&self, transport: &mut Transport) -> Result<()> {
        if transport.kex_in_progress() {
            return Ok(());
        }
        let kex = KeyExchange::new(KexInit::from_preferences(&self.config.preferences));
        transport.write_message(&kex.kexinit_message()).await?;
        transport.kex = Some(kex);
        transport.kex_started = Some(Instant::now());
        self.kex_gate.send_replace(true);
        self.transition(SessionState::KeyExchanging)?;
        logging::log_kex_start("client", self.first_kex_done());
        Ok(())
    }

    /// Starts a rekey if a limit was reached.
    async fn maybe_rekey_locked(&self, transport: &mut Transport) -> Result<()> {
        let inbound = self.inbound_bytes.swap(0, Ordering::Relaxed);
        transport.rekey.add_bytes(inbound);
        if self.state() == SessionState::Established
            && !transport.kex_in_progress()
            && transport.rekey.needs_rekey(Instant::now())
        {
            debug!(
                bytes = transport.rekey.bytes_transferred(),
                "Rekey limit reached"
            );
            self.begin_kex_locked(transport).await?;
        }
        Ok(())
    }

    fn with_kex_context<T>(&self, f: impl FnOnce(&KexContext<'_>) -> T) -> T {
        let (session_id, host_key) = {
            let record = lock(&self.record);
            (record.session_id.clone(), record.host_key.clone())
        };
        let ctx = KexContext {
            config: &self.config,
            client_id: self.client_version.identification(),
            server_id: self.server_version.identification(),
            session_id: session_id.as_deref(),
            previous_host_key: host_key.as_deref(),
        };
        f(&ctx)
    }

    /// Installs the results of a finished exchange and reopens the gate.
    async fn finish_kex_locked(&self, transport: &mut Transport) -> Result<()> {
        let outcome = transport
            .kex
            .take()
            .and_then(KeyExchange::into_outcome)
            .ok_or_else(|| Error::protocol("key exchange finished without outcome"))?;
        let duration_ms = transport
            .kex_started
            .take()
            .map_or(0, |started| started.elapsed().as_millis() as u64);

        let session_id = {
            let mut record = lock(&self.record);
            let session_id = record
                .session_id
                .get_or_insert_with(|| outcome.session_id.clone())
                .clone();
            record.algorithms = Some(outcome.algorithms.clone());
            record.host_key = Some(outcome.host_key.clone());
            record.completed += 1;
            session_id
        };

        self.inbound_bytes.store(0, Ordering::Relaxed);
        transport.rekey.reset(Instant::now());
        transport.flush_deferred().await?;
        self.kex_gate.send_replace(false);
        self.transition(SessionState::Established)?;
        logging::log_kex_complete(&session_id, &outcome.algorithms.kex, duration_ms);
        Ok(())
    }

    fn note_inbound(&self, wire_len: usize, next_seq: u32) {
        self.inbound_bytes
            .fetch_add(wire_len as u64, Ordering::Relaxed);
        self.inbound_seq.store(next_seq, Ordering::Relaxed);
    }

    fn complete_service(&self, name: String) -> Result<()> {
        let waiter = lock(&self.pending)
            .service
            .take()
            .ok_or_else(|| Error::protocol("SSH_MSG_SERVICE_ACCEPT without request"))?;
        let _ = waiter.send(Ok(name));
        Ok(())
    }

    fn complete_global(&self, reply: GlobalReply) -> Result<()> {
        let waiter = lock(&self.pending)
            .global
            .pop_front()
            .ok_or_else(|| Error::protocol("global request reply without request"))?;
        let _ = waiter.send(reply);
        Ok(())
    }

    fn deliver_auth(&self, msg: Message) {
        if matches!(msg, Message::UserauthSuccess) {
            self.authenticated.store(true, Ordering::Release);
            info!("User authentication succeeded");
        }
        if let Some(tx) = lock(&self.auth_tx).as_ref() {
            let _ = tx.send(msg);
        }
    }

    fn queue_incoming(self: &Arc<Self>, incoming: Incoming) {
        let channel = Channel::new(
            Arc::clone(self),
            incoming.local_id,
            incoming.remote_id,
            incoming.channel_type,
            incoming.events,
            incoming.shared,
        );
        if let Some(tx) = lock(&self.incoming_tx).as_ref() {
            let _ = tx.send(channel);
        }
    }

    fn stop_keepalive(&self) {
        if let Some(mut task) = lock(&self.keepalive).take() {
            task.stop();
        }
    }

    /// Sends DISCONNECT and shuts the writer down, then wakes the loop.
    async fn local_disconnect(&self, reason: DisconnectReason, description: &str) {
        if self.is_closing() {
            return;
        }
        if let Ok(mut transport) = timeout(TEARDOWN_GRACE, self.transport.lock()).await {
            let msg = Message::Disconnect(Disconnect::new(reason, description));
            let _ = timeout(TEARDOWN_GRACE, transport.write_message(&msg)).await;
            transport.shutdown().await;
        }
        self.shutdown.notify_one();
    }

    async fn wait_closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state
            .wait_for(|s| *s == SessionState::Disconnected)
            .await;
    }

    /// Runs the disconnect sequence. Called once, by the dispatch loop.
    pub(crate) async fn teardown(&self, exit: Exit) {
        let disconnect = match &exit {
            Exit::Local => Some((
                DisconnectReason::ByApplication,
                "disconnected by application".to_string(),
            )),
            Exit::Peer(_) => None,
            Exit::Fatal(e) => {
                logging::log_fatal(&e.to_string());
                Some((e.disconnect_reason(), e.to_string()))
            }
        };
        match exit {
            Exit::Peer(e) | Exit::Fatal(e) => self.set_cause(e),
            Exit::Local => {}
        }

        let _ = self.transition(SessionState::Disconnecting);
        self.stop_keepalive();

        if let Ok(mut transport) = timeout(TEARDOWN_GRACE, self.transport.lock()).await {
            if let Some((reason, description)) = disconnect {
                if !transport.is_shut_down() {
                    let msg = Message::Disconnect(Disconnect::new(reason, description));
                    let _ = timeout(TEARDOWN_GRACE, transport.write_message(&msg)).await;
                }
            }
            transport.kex = None;
            transport.shutdown().await;
        }

        // Release everything that may be blocked on this session
        self.kex_gate.send_replace(false);
        let lost = self.lost_error();
        self.mux.terminate(lost.clone());
        {
            let mut pending = lock(&self.pending);
            if let Some(waiter) = pending.service.take() {
                let _ = waiter.send(Err(lost.clone()));
            }
            pending.global.clear();
        }
        lock(&self.auth_tx).take();
        lock(&self.incoming_tx).take();
        if let Ok(mut incoming) = self.incoming_rx.try_lock() {
            incoming.close();
            while incoming.try_recv().is_ok() {}
        }

        let _ = self.transition(SessionState::Disconnected);
    }
}

/// An SSH client session.
///
/// Dropping the session disconnects it.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Establishes a session over `stream`: version exchange, then the
    /// initial key exchange.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] for an invalid configuration
    /// - [`Error::OperationTimedOut`] if the handshake exceeds its timeout
    /// - [`Error::AlgorithmNegotiation`], [`Error::HostKeyVerification`],
    ///   [`Error::ProtocolViolation`] or [`Error::ConnectionLost`] as
    ///   reported by the handshake
    pub async fn connect<S>(stream: S, config: SessionConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;
        let handshake = config.handshake_timeout;

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(Box::new(read_half) as BoxedReader);
        let mut writer: BoxedWriter = Box::new(write_half);

        let client_version = Version::new(&config.software_version, None);
        let server_version = timeout(
            handshake,
            version::exchange(&mut reader, &mut writer, &client_version),
        )
        .await
        .map_err(|_| Error::OperationTimedOut("version exchange".into()))??;
        info!(server = %server_version, "Connected to SSH server");

        let inner = Arc::new(SessionInner::new(
            config,
            client_version,
            server_version,
            writer,
        ));
        inner.transition(SessionState::VersionExchanged)?;
        {
            let mut transport = inner.transport.lock().await;
            inner.begin_kex_locked(&mut transport).await?;
        }

        let opener = PacketOpener::new(inner.config.max_packet_size);
        tokio::spawn(dispatch::run(Arc::clone(&inner), reader, opener));

        let mut state = inner.state.subscribe();
        let reached = timeout(handshake, async {
            state
                .wait_for(|s| matches!(s, SessionState::Established | SessionState::Disconnected))
                .await
                .map(|s| *s)
        })
        .await;

        match reached {
            Ok(Ok(SessionState::Established)) => {}
            Ok(_) => {
                return Err(inner.cause().unwrap_or_else(|| inner.lost_error()));
            }
            Err(_) => {
                let err = Error::OperationTimedOut("initial key exchange".into());
                inner.fail(err.clone());
                let _ = timeout(TEARDOWN_GRACE * 2, inner.wait_closed()).await;
                return Err(err);
            }
        }

        let session = Session { inner };
        session.start_keepalive();
        Ok(session)
    }

    /// Opens a TCP connection (bounded by the connect timeout) and runs
    /// [`Session::connect`] over it.
    pub async fn connect_tcp<A: ToSocketAddrs>(addr: A, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::OperationTimedOut("TCP connect".into()))??;
        stream.set_nodelay(true)?;
        Self::connect(stream, config).await
    }

    fn start_keepalive(&self) {
        let Some(interval) = self.inner.config.keepalive_interval else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let mut task = KeepaliveTask::new(interval);
        task.start(move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.send(keepalive_message(0)).await,
                    None => Err(Error::ConnectionLost("session dropped".into())),
                }
            }
        });
        *lock(&self.inner.keepalive) = Some(task);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Whether user authentication succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::Acquire)
    }

    /// Session identifier (exchange hash of the first key exchange).
    pub fn session_id(&self) -> Option<Vec<u8>> {
        lock(&self.inner.record).session_id.clone()
    }

    /// Algorithms negotiated by the latest key exchange.
    pub fn algorithms(&self) -> Option<NegotiatedAlgorithms> {
        lock(&self.inner.record).algorithms.clone()
    }

    /// Server host key blob accepted by the key exchange.
    pub fn host_key(&self) -> Option<Vec<u8>> {
        lock(&self.inner.record).host_key.clone()
    }

    /// Number of completed key exchanges.
    pub fn key_exchanges(&self) -> u32 {
        lock(&self.inner.record).completed
    }

    /// Our identification line.
    pub fn client_version(&self) -> &Version {
        &self.inner.client_version
    }

    /// The server's identification line.
    pub fn server_version(&self) -> &Version {
        &self.inner.server_version
    }

    /// Next `(outbound, inbound)` packet sequence numbers.
    pub async fn sequence_numbers(&self) -> (u32, u32) {
        let outbound = self.inner.transport.lock().await.sealer.sequence_number();
        (outbound, self.inner.inbound_seq.load(Ordering::Relaxed))
    }

    /// Sends SERVICE_REQUEST and waits for SERVICE_ACCEPT.
    pub async fn request_service(&self, name: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.inner.pending);
            if pending.service.is_some() {
                return Err(Error::Config("a service request is already pending".into()));
            }
            pending.service = Some(tx);
        }
        self.inner
            .send(Message::ServiceRequest(name.to_string()))
            .await?;

        let accepted = match timeout(self.inner.config.operation_timeout, rx).await {
            Err(_) => {
                lock(&self.inner.pending).service.take();
                return Err(Error::OperationTimedOut(format!("service request '{}'", name)));
            }
            Ok(Err(_)) => return Err(self.inner.lost_error()),
            Ok(Ok(result)) => result?,
        };
        if accepted != name {
            let err = Error::protocol(format!(
                "requested service '{}' but server accepted '{}'",
                name, accepted
            ));
            self.inner.fail(err.clone());
            return Err(err);
        }
        debug!(service = name, "Service accepted");
        lock(&self.inner.services).push(accepted);
        Ok(())
    }

    /// Whether the server accepted a SERVICE_REQUEST for `name`.
    pub fn has_service(&self, name: &str) -> bool {
        lock(&self.inner.services).iter().any(|s| s == name)
    }

    /// Sends an authentication-layer message (USERAUTH_REQUEST or a
    /// method-specific message).
    pub async fn send_request(&self, msg: Message) -> Result<()> {
        match msg {
            Message::UserauthRequest(_) | Message::UserauthMethod(_) => self.inner.send(msg).await,
            other => Err(Error::Config(format!(
                "{} is not an authentication request",
                other.name()
            ))),
        }
    }

    /// Waits for the next authentication-layer message from the server.
    pub async fn next_auth_message(&self) -> Result<Message> {
        let mut rx = self.inner.auth_rx.lock().await;
        match timeout(self.inner.config.operation_timeout, rx.recv()).await {
            Err(_) => Err(Error::OperationTimedOut(
                "waiting for authentication reply".into(),
            )),
            Ok(None) => Err(self.inner.lost_error()),
            Ok(Some(msg)) => Ok(msg),
        }
    }

    /// Sends a global request such as `tcpip-forward`.
    ///
    /// Replies are matched to requests in order.
    pub async fn global_request(
        &self,
        name: &str,
        data: Vec<u8>,
        want_reply: bool,
    ) -> Result<GlobalReply> {
        let msg = Message::GlobalRequest(GlobalRequest {
            name: name.to_string(),
            want_reply,
            data,
        });
        if !want_reply {
            self.inner.send(msg).await?;
            return Ok(GlobalReply::NoReply);
        }

        let rx = {
            let _ops = self.inner.global_ops.lock().await;
            self.inner.check_alive()?;
            let (tx, rx) = oneshot::channel();
            lock(&self.inner.pending).global.push_back(tx);
            self.inner.send(msg).await?;
            rx
        };
        match timeout(self.inner.config.operation_timeout, rx).await {
            Err(_) => Err(Error::OperationTimedOut(format!("global request '{}'", name))),
            Ok(Err(_)) => Err(self.inner.lost_error()),
            Ok(Ok(reply)) => Ok(reply),
        }
    }

    /// Runs a key exchange now and waits for it to finish.
    pub async fn rekey(&self) -> Result<()> {
        if !self.inner.first_kex_done() {
            return Err(Error::Config("session is not established".into()));
        }
        {
            let mut transport = self.inner.transport.lock().await;
            self.inner.check_alive()?;
            if let Err(e) = self.inner.begin_kex_locked(&mut transport).await {
                self.inner.fail(e.clone());
                return Err(e);
            }
        }
        timeout(self.inner.config.handshake_timeout, self.inner.wait_kex_idle())
            .await
            .map_err(|_| Error::OperationTimedOut("rekey".into()))?
    }

    /// Sends SSH_MSG_IGNORE with `data`.
    pub async fn send_ignore(&self, data: Vec<u8>) -> Result<()> {
        self.inner.send(Message::Ignore(data)).await
    }

    /// Opens a channel and waits for the server's answer.
    ///
    /// # Errors
    ///
    /// - [`Error::ChannelOpenRefused`] with the server's reason
    /// - [`Error::OperationTimedOut`] if no answer arrives in time
    pub async fn open_channel(&self, channel_type: ChannelType) -> Result<Channel> {
        if !self.inner.first_kex_done() {
            return Err(Error::Config("session is not established".into()));
        }
        self.inner.check_alive()?;

        let registration = self.inner.mux.register(channel_type.clone())?;
        let local_id = registration.local_id;
        if let Err(e) = self.inner.send(registration.message).await {
            self.inner.mux.cancel_open(local_id);
            return Err(e);
        }

        let opened = match timeout(self.inner.config.operation_timeout, registration.opened).await {
            Err(_) => {
                self.inner.mux.abandon_open(local_id);
                return Err(Error::OperationTimedOut(format!(
                    "opening channel {}",
                    local_id
                )))
            }
            Ok(Err(_)) => return Err(self.inner.lost_error()),
            Ok(Ok(result)) => result?,
        };
        debug!(
            local_id,
            remote_id = opened.remote_id,
            remote_window = opened.remote_window,
            remote_max_packet = opened.remote_max_packet,
            "Channel open confirmed"
        );

        Ok(Channel::new(
            Arc::clone(&self.inner),
            local_id,
            opened.remote_id,
            channel_type,
            registration.events,
            registration.shared,
        ))
    }

    /// Opens a `session` channel.
    pub async fn open_session(&self) -> Result<Channel> {
        self.open_channel(ChannelType::Session).await
    }

    /// Opens a `direct-tcpip` channel to `host:port`.
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_address: &str,
        originator_port: u32,
    ) -> Result<Channel> {
        self.open_channel(ChannelType::DirectTcpip {
            host: host.to_string(),
            port,
            originator_address: originator_address.to_string(),
            originator_port,
        })
        .await
    }

    /// Waits for the next server-initiated channel (forwarded-tcpip, x11).
    ///
    /// Returns `None` once the session is closed. Channels only arrive when
    /// the configuration accepts incoming channels.
    pub async fn incoming_channel(&self) -> Option<Channel> {
        self.inner.incoming_rx.lock().await.recv().await
    }

    /// Runs `command` on a new session channel and collects its output.
    ///
    /// # Errors
    ///
    /// [`Error::ChannelClosed`] if the server refuses the exec request.
    pub async fn execute(&self, command: &str) -> Result<ExecOutput> {
        let mut channel = self.open_session().await?;
        if !channel.exec(command).await? {
            let local_id = channel.local_id();
            channel.close().await?;
            return Err(Error::ChannelClosed(local_id));
        }
        channel.eof().await?;

        let mut output = ExecOutput::default();
        while let Some(event) = channel.recv().await {
            match event {
                ChannelEvent::Data(data) => output.stdout.extend_from_slice(&data),
                ChannelEvent::ExtendedData { code, data } if code == EXTENDED_DATA_STDERR => {
                    output.stderr.extend_from_slice(&data)
                }
                ChannelEvent::Request { request, .. } => match request {
                    ChannelRequestType::ExitStatus { exit_status } => {
                        output.exit_status = Some(exit_status)
                    }
                    ChannelRequestType::ExitSignal { signal_name, .. } => {
                        output.exit_signal = Some(signal_name)
                    }
                    _ => {}
                },
                ChannelEvent::Closed => break,
                ChannelEvent::Error(e) => return Err(e),
                ChannelEvent::ExtendedData { .. } | ChannelEvent::Eof => {}
            }
        }
        Ok(output)
    }

    /// Sends DISCONNECT (by application) and waits for teardown.
    pub async fn disconnect(&self) -> Result<()> {
        self.disconnect_with(DisconnectReason::ByApplication, "disconnected by user")
            .await
    }

    /// Sends DISCONNECT with `reason` and waits for teardown.
    pub async fn disconnect_with(&self, reason: DisconnectReason, description: &str) -> Result<()> {
        self.inner.local_disconnect(reason, description).await;
        self.inner.wait_closed().await;
        Ok(())
    }

    /// Waits until the session has been torn down. Returns the error that
    /// ended it, or `None` for a local disconnect.
    pub async fn closed(&self) -> Option<Error> {
        self.inner.wait_closed().await;
        self.inner.cause()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("server_version", &self.inner.server_version.identification())
            .field("authenticated", &self.is_authenticated())
            .field("channels", &self.inner.mux.len())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.inner.is_closing() {
            self.inner.shutdown.notify_one();
        }
    }
}
