//! Stream Tube Client
//!
//! The top-level engine that accepts incoming stream tubes and tracks their
//! lifecycle.
//!
//! # Architecture
//!
//! ```text
//!   dispatcher ──► TubeOfferHandler ──┐
//!                                     │  Command::Offer
//!   session actors ───────────────────┤  Command::Session
//!   flush() ──────────────────────────┤  Command::Flush
//!                                     ▼
//!                           ┌───────────────────┐
//!                           │   Engine task     │  sole writer
//!                           └─────────┬─────────┘
//!                                     │
//!               RwLock<HashMap<TubeId, TubeSession>>  ◄── tubes(), connections()
//!                                     │
//!                                     ▼
//!                       mpsc::UnboundedSender<TubeClientEvent>
//! ```
//!
//! Every change to the session map happens on the engine task, one command
//! at a time. Accept completion and invalidation for the same tube are two
//! independent sources: whichever reaches the engine first removes the
//! session and emits `TubeClosed`; the other finds nothing and is dropped.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{AcceptModeConfig, TubeClientConfig};
use crate::error::TubeClientError;
use crate::events::TubeClientEvent;
use crate::handler::{ClientRegistrar, OfferOutcome, TubeOfferHandler};
use crate::policy::{wildcard_for, AcceptanceMode, TcpSourceAddressGenerator};
use crate::session::{SessionMessage, SessionState, SessionUpdate, TubeSession};
use crate::tube::{
    AcceptedEndpoint, AccountRef, ChannelRequestHints, ConnectionId, StreamTube, Tube, TubeId,
};

/// Construction options for a [`StreamTubeClient`]
#[derive(Clone, Debug, Default)]
pub struct TubeClientOptions {
    /// Services accepted from single contacts
    pub p2p_services: Vec<String>,
    /// Services accepted in rooms
    pub room_services: Vec<String>,
    /// Client name to register under (generated when `None`)
    pub client_name: Option<String>,
    /// Track individual connections through accepted tubes
    pub monitor_connections: bool,
    /// Ask the dispatcher to skip user approval
    pub bypass_approval: bool,
}

impl TubeClientOptions {
    /// Options for the given peer-to-peer services
    pub fn p2p<I, S>(services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            p2p_services: services.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Add room services
    #[must_use]
    pub fn with_room_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.room_services = services.into_iter().map(Into::into).collect();
        self
    }

    /// Register under a fixed client name
    #[must_use]
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Enable or disable connection monitoring
    #[must_use]
    pub fn with_monitor_connections(mut self, monitor: bool) -> Self {
        self.monitor_connections = monitor;
        self
    }

    /// Enable or disable approval bypass
    #[must_use]
    pub fn with_bypass_approval(mut self, bypass: bool) -> Self {
        self.bypass_approval = bypass;
        self
    }
}

/// A tube offer on its way to the engine
pub(crate) struct OfferRequest {
    pub(crate) account: AccountRef,
    pub(crate) tube: Arc<dyn StreamTube>,
    pub(crate) user_action_time: DateTime<Utc>,
    pub(crate) hints: ChannelRequestHints,
    pub(crate) reply: oneshot::Sender<OfferOutcome>,
}

/// Work items for the engine task
pub(crate) enum Command {
    /// The dispatcher delivered a tube
    Offer(OfferRequest),
    /// A session actor reported something
    Session(SessionMessage),
    /// Reply once every earlier command has been processed
    Flush(oneshot::Sender<()>),
}

/// State shared between the client handle and its engine task
struct Shared {
    mode: RwLock<AcceptanceMode>,
    sessions: RwLock<HashMap<TubeId, TubeSession>>,
    monitor_connections: bool,
    /// Taken when the client is dropped; the engine delivers nothing after
    events: Mutex<Option<mpsc::UnboundedSender<TubeClientEvent>>>,
}

/// Accepts incoming stream tubes and reports their lifecycle
///
/// Must be created inside a tokio runtime: the engine runs as a spawned task.
/// Dropping the client unregisters it and stops every in-flight accept; no
/// event is delivered afterwards.
pub struct StreamTubeClient {
    registrar: Arc<dyn ClientRegistrar>,
    handler: Arc<TubeOfferHandler>,
    client_name: String,
    registered: Arc<AtomicBool>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    engine: JoinHandle<()>,
}

impl StreamTubeClient {
    /// Create a client for the given services
    ///
    /// The client does not register until an acceptance mode is set with
    /// [`set_to_accept_as_tcp`](Self::set_to_accept_as_tcp) or
    /// [`set_to_accept_as_unix`](Self::set_to_accept_as_unix).
    ///
    /// # Errors
    ///
    /// Returns [`TubeClientError::NoServices`] if neither peer-to-peer nor
    /// room services are given.
    pub fn create(
        registrar: Arc<dyn ClientRegistrar>,
        options: TubeClientOptions,
        events: mpsc::UnboundedSender<TubeClientEvent>,
    ) -> Result<Self, TubeClientError> {
        if options.p2p_services.is_empty() && options.room_services.is_empty() {
            tracing::warn!("Tried to create a stream tube client with no services");
            return Err(TubeClientError::NoServices);
        }

        let client_name = options
            .client_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| generate_client_name(&registrar.bus_unique_name()));

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let registered = Arc::new(AtomicBool::new(false));
        let handler = Arc::new(TubeOfferHandler::new(
            &options.p2p_services,
            &options.room_services,
            options.monitor_connections,
            options.bypass_approval,
            Arc::clone(&registered),
            commands.clone(),
        ));

        let shared = Arc::new(Shared {
            mode: RwLock::new(AcceptanceMode::Unconfigured),
            sessions: RwLock::new(HashMap::new()),
            monitor_connections: options.monitor_connections,
            events: Mutex::new(Some(events)),
        });

        let engine = Engine {
            shared: Arc::clone(&shared),
            commands: commands.clone(),
        };
        let engine = tokio::spawn(engine.run(commands_rx));

        tracing::debug!(client = %client_name, "Stream tube client created");

        Ok(Self {
            registrar,
            handler,
            client_name,
            registered,
            shared,
            commands,
            engine,
        })
    }

    /// Create a client from loaded configuration and apply its acceptance mode
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration fails validation.
    pub fn from_config(
        registrar: Arc<dyn ClientRegistrar>,
        config: &TubeClientConfig,
        events: mpsc::UnboundedSender<TubeClientEvent>,
    ) -> Result<Self, TubeClientError> {
        config.validate()?;
        let client = Self::create(registrar, config.options(), events)?;
        match config.accept_mode {
            Some(AcceptModeConfig::Tcp) => client.set_to_accept_as_tcp(None),
            Some(AcceptModeConfig::Unix) => {
                client.set_to_accept_as_unix(config.require_credentials);
            }
            None => {}
        }
        Ok(client)
    }

    /// The registrar this client publishes its handler through
    #[must_use]
    pub fn registrar(&self) -> &Arc<dyn ClientRegistrar> {
        &self.registrar
    }

    /// The handler published on the bus
    #[must_use]
    pub fn handler(&self) -> &Arc<TubeOfferHandler> {
        &self.handler
    }

    /// Name the client registers under
    #[must_use]
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Whether the handler has been published
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Whether connection events are emitted
    #[must_use]
    pub fn monitors_connections(&self) -> bool {
        self.shared.monitor_connections
    }

    /// The current acceptance mode
    #[must_use]
    pub fn acceptance_mode(&self) -> AcceptanceMode {
        self.shared.mode.read().clone()
    }

    /// Whether tubes are accepted as TCP sockets
    #[must_use]
    pub fn accepts_as_tcp(&self) -> bool {
        self.shared.mode.read().is_tcp()
    }

    /// Whether tubes are accepted as Unix sockets
    #[must_use]
    pub fn accepts_as_unix(&self) -> bool {
        self.shared.mode.read().is_unix()
    }

    /// The TCP source address generator, if accepting as TCP
    ///
    /// Outside TCP mode this logs a warning and returns `None`.
    #[must_use]
    pub fn tcp_generator(&self) -> Option<Arc<dyn TcpSourceAddressGenerator>> {
        match &*self.shared.mode.read() {
            AcceptanceMode::Tcp { generator } => generator.clone(),
            mode => {
                tracing::warn!(
                    mode = mode.name(),
                    "tcp_generator() used, but not accepting as TCP"
                );
                None
            }
        }
    }

    /// Accept tubes as TCP sockets from now on
    ///
    /// With a generator, each tube gets the source address it returns (Port
    /// AC); without one, Localhost AC is used. Registers the client if needed.
    pub fn set_to_accept_as_tcp(&self, generator: Option<Arc<dyn TcpSourceAddressGenerator>>) {
        *self.shared.mode.write() = AcceptanceMode::Tcp { generator };
        self.ensure_registered();
    }

    /// Accept tubes as Unix sockets from now on
    ///
    /// `require_credentials` asks for Credentials AC where the tube supports
    /// it. Registers the client if needed.
    pub fn set_to_accept_as_unix(&self, require_credentials: bool) {
        *self.shared.mode.write() = AcceptanceMode::Unix {
            require_credentials,
        };
        self.ensure_registered();
    }

    fn ensure_registered(&self) {
        if self.is_registered() {
            return;
        }

        tracing::info!(client = %self.client_name, "Registering stream tube client");

        if self
            .registrar
            .register_client(Arc::clone(&self.handler), &self.client_name)
        {
            self.registered.store(true, Ordering::SeqCst);
        } else {
            tracing::warn!(
                client = %self.client_name,
                "Stream tube client registration failed"
            );
        }
    }

    /// Deliver a tube offer, as the dispatcher does through the handler
    ///
    /// # Panics
    ///
    /// Panics if the client is not registered or the tube is outgoing.
    ///
    /// # Errors
    ///
    /// Returns [`TubeClientError::EngineStopped`] if the engine is gone.
    pub async fn on_tube_offered(
        &self,
        account: AccountRef,
        tube: Arc<dyn StreamTube>,
        user_action_time: DateTime<Utc>,
        hints: ChannelRequestHints,
    ) -> Result<OfferOutcome, TubeClientError> {
        self.handler
            .handle_tube(account, tube, user_action_time, hints)
            .await
    }

    /// Wait until every command queued so far has been processed
    ///
    /// # Errors
    ///
    /// Returns [`TubeClientError::EngineStopped`] if the engine is gone.
    pub async fn flush(&self) -> Result<(), TubeClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Flush(tx))
            .map_err(|_| TubeClientError::EngineStopped)?;
        rx.await.map_err(|_| TubeClientError::EngineStopped)
    }

    /// All tubes currently tracked, whatever their acceptance state
    #[must_use]
    pub fn tubes(&self) -> Vec<Tube> {
        self.shared
            .sessions
            .read()
            .values()
            .map(|session| session.tube().clone())
            .collect()
    }

    /// Open connections per tube
    ///
    /// Tubes that already report themselves invalid are skipped even if their
    /// invalidation has not been processed yet, as are tubes without open
    /// connections. Requires connection monitoring; otherwise logs a warning
    /// and returns an empty map.
    #[must_use]
    pub fn connections(&self) -> HashMap<Tube, BTreeSet<ConnectionId>> {
        if !self.monitors_connections() {
            tracing::warn!("connections() used, but connection monitoring is disabled");
            return HashMap::new();
        }

        self.shared
            .sessions
            .read()
            .values()
            .filter(|session| session.tube().channel().is_valid())
            .filter(|session| !session.open_connections().is_empty())
            .map(|session| (session.tube().clone(), session.open_connections().clone()))
            .collect()
    }

    /// Acceptance state of a tracked tube
    #[must_use]
    pub fn session_state(&self, tube_id: &TubeId) -> Option<SessionState> {
        self.shared
            .sessions
            .read()
            .get(tube_id)
            .map(TubeSession::state)
    }
}

impl Drop for StreamTubeClient {
    fn drop(&mut self) {
        // Must happen before the abort, which only lands at the engine's next await
        self.shared.events.lock().take();
        if self.is_registered() {
            self.registrar.unregister_client(&self.client_name);
        }
        self.engine.abort();
        self.shared.sessions.write().clear();
    }
}

impl fmt::Debug for StreamTubeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTubeClient")
            .field("client_name", &self.client_name)
            .field("registered", &self.is_registered())
            .field("mode", &*self.shared.mode.read())
            .field("tube_count", &self.shared.sessions.read().len())
            .finish_non_exhaustive()
    }
}

/// Default client name: `TubeClient_<bus name>_<unique suffix>`
fn generate_client_name(bus_unique_name: &str) -> String {
    let bus = bus_unique_name.replace([':', '.'], "_");
    format!("TubeClient_{bus}_{}", uuid::Uuid::new_v4().simple())
}

/// The single consumer of [`Command`]s
struct Engine {
    shared: Arc<Shared>,
    /// Handed to new sessions so their actors can report back
    commands: mpsc::UnboundedSender<Command>,
}

impl Engine {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Offer(offer) => self.handle_offer(offer),
                Command::Session(message) => self.handle_session_message(message),
                Command::Flush(reply) => {
                    let _ = reply.send(());
                }
            }
        }
    }

    fn emit(&self, event: TubeClientEvent) {
        match self.shared.events.lock().as_ref() {
            Some(events) => deliver(events, event),
            None => tracing::debug!("Stream tube client dropped, discarding event"),
        }
    }

    fn handle_offer(&self, offer: OfferRequest) {
        let OfferRequest {
            account,
            tube,
            user_action_time,
            hints,
            reply,
        } = offer;

        // No reply once the client is dropped: the caller sees EngineStopped
        if let Some(outcome) = self.create_session(account, tube, user_action_time, &hints) {
            let _ = reply.send(outcome);
        }
    }

    fn create_session(
        &self,
        account: AccountRef,
        tube: Arc<dyn StreamTube>,
        user_action_time: DateTime<Utc>,
        hints: &ChannelRequestHints,
    ) -> Option<OfferOutcome> {
        if self.shared.sessions.read().contains_key(tube.id()) {
            tracing::debug!(tube = %tube.id(), "Ignoring reinvocation for tracked tube");
            return Some(OfferOutcome::Duplicate);
        }

        let Some(incoming) = Arc::clone(&tube).into_incoming() else {
            tracing::warn!(
                tube = %tube.id(),
                "The channel factory must construct incoming stream tubes for unrequested tubes"
            );
            tube.request_close();
            return Some(OfferOutcome::Rejected);
        };

        let mode = self.shared.mode.read().clone();
        let Some(requested) = mode.requested_access(&account, incoming.as_ref()) else {
            unreachable!("stream tube client registered without an acceptance mode");
        };

        tracing::info!(
            tube = %incoming.id(),
            account = %account,
            service = incoming.service(),
            mode = mode.name(),
            user_action_time = %user_action_time,
            has_hints = !hints.is_empty(),
            "Tube offered"
        );

        // Held until the session is in the map, so a concurrent drop either
        // sees the session and clears it or makes this offer a no-op
        let events = self.shared.events.lock();
        let Some(events) = events.as_ref() else {
            tracing::debug!(tube = %incoming.id(), "Stream tube client dropped, ignoring offer");
            return None;
        };

        let tube = Tube::new(account, incoming);
        let session = TubeSession::start(
            tube.clone(),
            requested,
            self.shared.monitor_connections,
            self.commands.clone(),
        );
        self.shared.sessions.write().insert(tube.id().clone(), session);

        deliver(events, TubeClientEvent::TubeOffered { tube });
        Some(OfferOutcome::Created)
    }

    fn handle_session_message(&self, message: SessionMessage) {
        let SessionMessage {
            tube_id,
            serial,
            update,
        } = message;

        let mut sessions = self.shared.sessions.write();
        let Some(session) = sessions.get_mut(&tube_id) else {
            tracing::debug!(tube = %tube_id, "Ignoring update for untracked tube");
            return;
        };
        if session.serial() != serial {
            tracing::debug!(
                tube = %tube_id,
                stale = serial.as_u64(),
                current = session.serial().as_u64(),
                "Ignoring update from a previous session"
            );
            return;
        }

        match update {
            SessionUpdate::AcceptFinished(Ok(endpoint)) => {
                if !session.transition(SessionState::Accepted) {
                    return;
                }
                tracing::info!(tube = %tube_id, "Tube accepted");
                let event = accepted_event(session, endpoint);
                drop(sessions);
                self.emit(event);
            }
            SessionUpdate::AcceptFinished(Err(err)) => {
                session.transition(SessionState::Failed);
                tracing::warn!(
                    tube = %tube_id,
                    error = %err.name,
                    message = %err.message,
                    "Couldn't accept tube"
                );
                self.close_session(sessions, &tube_id, true, err.name, err.message);
            }
            SessionUpdate::Invalidated { error, message } => {
                session.transition(SessionState::Closed);
                tracing::debug!(
                    tube = %tube_id,
                    error = %error,
                    message = %message,
                    "Tube invalidated"
                );
                self.close_session(sessions, &tube_id, false, error, message);
            }
            SessionUpdate::NewConnection(connection_id) => {
                debug_assert!(self.shared.monitor_connections);
                if !session.record_connection(connection_id) {
                    return;
                }
                let tube = session.tube().clone();
                drop(sessions);
                self.emit(TubeClientEvent::NewConnection {
                    tube,
                    connection_id,
                });
            }
            SessionUpdate::ConnectionClosed {
                connection_id,
                error,
                message,
            } => {
                debug_assert!(self.shared.monitor_connections);
                if !session.forget_connection(connection_id) {
                    return;
                }
                let tube = session.tube().clone();
                drop(sessions);
                self.emit(TubeClientEvent::ConnectionClosed {
                    tube,
                    connection_id,
                    error,
                    message,
                });
            }
        }
    }

    /// Remove a session and report it closed
    ///
    /// The session is removed before the event is sent, so a caller reacting
    /// to `TubeClosed` no longer sees the tube in `tubes()`. With
    /// `request_close`, a still-valid channel is asked to close once the map
    /// lock is released.
    fn close_session(
        &self,
        mut sessions: parking_lot::RwLockWriteGuard<'_, HashMap<TubeId, TubeSession>>,
        tube_id: &TubeId,
        request_close: bool,
        error: String,
        message: String,
    ) {
        let Some(session) = sessions.remove(tube_id) else {
            return;
        };
        drop(sessions);

        let channel = session.tube().channel();
        if request_close && channel.is_valid() {
            channel.request_close();
        }

        self.emit(TubeClientEvent::TubeClosed {
            tube: session.tube().clone(),
            error,
            message,
        });
    }
}

fn deliver(events: &mpsc::UnboundedSender<TubeClientEvent>, event: TubeClientEvent) {
    if events.send(event).is_err() {
        tracing::debug!("Event receiver dropped, discarding tube client event");
    }
}

fn accepted_event(session: &TubeSession, endpoint: AcceptedEndpoint) -> TubeClientEvent {
    let tube = session.tube().clone();
    match endpoint {
        AcceptedEndpoint::Tcp { listen_address } => TubeClientEvent::TubeAcceptedAsTcp {
            listen_address,
            source_address: session
                .source_address()
                .unwrap_or_else(|| wildcard_for(&listen_address)),
            tube,
        },
        AcceptedEndpoint::Unix {
            path,
            requires_credentials,
            credential_byte,
        } => TubeClientEvent::TubeAcceptedAsUnix {
            listen_path: path,
            requires_credentials,
            credential_byte,
            tube,
        },
    }
}
