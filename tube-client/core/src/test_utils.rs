//! Tube Client Test Utilities
//!
//! Mock collaborators for exercising the client without a bus or real
//! sockets.
//!
//! # Usage
//!
//! ```ignore
//! use tube_client_core::test_utils::{MockRegistrar, MockStreamTube};
//!
//! let registrar = MockRegistrar::new();
//! let tube = MockStreamTube::incoming("/org/example/Tube1");
//!
//! // Script the accept result before or after the tube is offered
//! tube.complete_accept(Ok(AcceptedEndpoint::Tcp { listen_address }));
//! registrar.dispatch(AccountRef::new("/acc/1"), tube.clone()).await?;
//!
//! // Emit tube signals
//! tube.open_connection(1);
//! tube.invalidate("Cancelled", "peer hung up");
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::error::{AcceptError, TubeClientError};
use crate::events::TubeClientEvent;
use crate::handler::{ClientRegistrar, OfferOutcome, TubeOfferHandler};
use crate::policy::{AccessParams, TcpSourceAddressGenerator};
use crate::tube::{
    AcceptedEndpoint, AccountRef, ChannelRequestHints, ConnectionId, IncomingStreamTube,
    StreamTube, TubeCapabilities, TubeId, TubeSignal,
};

/// How long [`next_event`] waits before failing the test
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

type AcceptResult = Result<AcceptedEndpoint, AcceptError>;
type CloseHook = Box<dyn Fn() + Send + Sync>;

// ============================================================================
// Mock Stream Tube
// ============================================================================

/// Scriptable tube channel
///
/// Accept calls block until a result is supplied with
/// [`complete_accept`](Self::complete_accept). Results queued before the
/// accept starts are consumed in order.
pub struct MockStreamTube {
    id: TubeId,
    service: String,
    requested: bool,
    incoming: bool,
    capabilities: TubeCapabilities,
    valid: AtomicBool,
    accept_tx: mpsc::UnboundedSender<AcceptResult>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<AcceptResult>>,
    accept_requests: Mutex<Vec<AccessParams>>,
    close_requests: AtomicUsize,
    close_hook: Mutex<Option<CloseHook>>,
    signals: broadcast::Sender<TubeSignal>,
}

/// Builder for [`MockStreamTube`]
#[derive(Debug, Clone)]
pub struct MockStreamTubeBuilder {
    id: TubeId,
    service: String,
    requested: bool,
    incoming: bool,
    capabilities: TubeCapabilities,
}

impl MockStreamTubeBuilder {
    /// Service name (default `x-test`)
    #[must_use]
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Supported access-control schemes (default: Localhost only)
    #[must_use]
    pub fn capabilities(mut self, capabilities: TubeCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Mark the tube as locally requested (outgoing)
    #[must_use]
    pub fn requested(mut self) -> Self {
        self.requested = true;
        self
    }

    /// Make the channel refuse to be viewed as an incoming stream tube
    #[must_use]
    pub fn not_incoming(mut self) -> Self {
        self.incoming = false;
        self
    }

    /// Build the mock
    #[must_use]
    pub fn build(self) -> Arc<MockStreamTube> {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (signals, _) = broadcast::channel(64);
        Arc::new(MockStreamTube {
            id: self.id,
            service: self.service,
            requested: self.requested,
            incoming: self.incoming,
            capabilities: self.capabilities,
            valid: AtomicBool::new(true),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            accept_requests: Mutex::new(Vec::new()),
            close_requests: AtomicUsize::new(0),
            close_hook: Mutex::new(None),
            signals,
        })
    }
}

impl MockStreamTube {
    /// Start building a mock tube at `path`
    pub fn builder(path: impl Into<String>) -> MockStreamTubeBuilder {
        MockStreamTubeBuilder {
            id: TubeId::new(path),
            service: "x-test".to_string(),
            requested: false,
            incoming: true,
            capabilities: TubeCapabilities::localhost_only(),
        }
    }

    /// A valid, peer-initiated tube with Localhost AC only
    #[must_use]
    pub fn incoming(path: impl Into<String>) -> Arc<Self> {
        Self::builder(path).build()
    }

    /// Supply the result of the next accept call
    pub fn complete_accept(&self, result: AcceptResult) {
        let _ = self.accept_tx.send(result);
    }

    /// Access control requested by each accept call so far
    #[must_use]
    pub fn accept_requests(&self) -> Vec<AccessParams> {
        self.accept_requests.lock().clone()
    }

    /// Number of times close was requested
    #[must_use]
    pub fn close_requests(&self) -> usize {
        self.close_requests.load(Ordering::SeqCst)
    }

    /// Run `hook` on the requesting thread each time close is requested
    pub fn on_close_request(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.close_hook.lock() = Some(Box::new(hook));
    }

    /// Report a new connection through the tube
    pub fn open_connection(&self, id: u32) {
        self.emit(TubeSignal::NewConnection {
            connection_id: ConnectionId::new(id),
        });
    }

    /// Report a closed connection
    pub fn close_connection(&self, id: u32, error: &str, message: &str) {
        self.emit(TubeSignal::ConnectionClosed {
            connection_id: ConnectionId::new(id),
            error: error.to_string(),
            message: message.to_string(),
        });
    }

    /// Mark the tube invalid and emit the invalidation signal
    pub fn invalidate(&self, error: &str, message: &str) {
        self.mark_invalid();
        self.emit(TubeSignal::Invalidated {
            error: error.to_string(),
            message: message.to_string(),
        });
    }

    /// Mark the tube invalid without signalling it yet
    pub fn mark_invalid(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    fn emit(&self, signal: TubeSignal) {
        // No subscribers yet is fine: the signal is simply lost, as on the bus
        let _ = self.signals.send(signal);
    }

    async fn next_accept_result(&self, params: AccessParams) -> AcceptResult {
        self.accept_requests.lock().push(params);
        let mut results = self.accept_rx.lock().await;
        match results.recv().await {
            Some(result) => result,
            None => Err(AcceptError::new("Cancelled", "mock tube dropped")),
        }
    }
}

impl StreamTube for MockStreamTube {
    fn id(&self) -> &TubeId {
        &self.id
    }

    fn service(&self) -> &str {
        &self.service
    }

    fn is_requested(&self) -> bool {
        self.requested
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn request_close(&self) {
        self.close_requests.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.close_hook.lock().as_ref() {
            hook();
        }
    }

    fn into_incoming(self: Arc<Self>) -> Option<Arc<dyn IncomingStreamTube>> {
        if self.incoming {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl IncomingStreamTube for MockStreamTube {
    fn capabilities(&self) -> TubeCapabilities {
        self.capabilities
    }

    async fn accept_as_tcp(&self, source_address: SocketAddr) -> AcceptResult {
        self.next_accept_result(AccessParams::Tcp { source_address })
            .await
    }

    async fn accept_as_unix(&self, require_credentials: bool) -> AcceptResult {
        self.next_accept_result(AccessParams::Unix {
            require_credentials,
        })
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<TubeSignal> {
        self.signals.subscribe()
    }
}

impl std::fmt::Debug for MockStreamTube {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockStreamTube")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("valid", &self.is_valid())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Mock Registrar
// ============================================================================

/// Registrar that records registrations and can deliver offers
pub struct MockRegistrar {
    accept_registrations: AtomicBool,
    registrations: Mutex<Vec<String>>,
    unregistrations: Mutex<Vec<String>>,
    handler: Mutex<Option<Arc<TubeOfferHandler>>>,
}

impl MockRegistrar {
    /// Create a registrar that accepts registrations
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            accept_registrations: AtomicBool::new(true),
            registrations: Mutex::new(Vec::new()),
            unregistrations: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
        })
    }

    /// Make future registrations succeed or fail
    pub fn set_accept_registrations(&self, accept: bool) {
        self.accept_registrations.store(accept, Ordering::SeqCst);
    }

    /// Client names registered so far
    #[must_use]
    pub fn registrations(&self) -> Vec<String> {
        self.registrations.lock().clone()
    }

    /// Client names unregistered so far
    #[must_use]
    pub fn unregistrations(&self) -> Vec<String> {
        self.unregistrations.lock().clone()
    }

    /// The most recently registered handler
    #[must_use]
    pub fn handler(&self) -> Option<Arc<TubeOfferHandler>> {
        self.handler.lock().clone()
    }

    /// Deliver a tube to the registered handler, as the dispatcher would
    ///
    /// # Panics
    ///
    /// Panics if no handler has been registered.
    ///
    /// # Errors
    ///
    /// Propagates the handler's error.
    pub async fn dispatch(
        &self,
        account: AccountRef,
        tube: Arc<dyn StreamTube>,
    ) -> Result<OfferOutcome, TubeClientError> {
        let Some(handler) = self.handler() else {
            panic!("dispatch to {} with no registered handler", tube.id());
        };
        handler
            .handle_tube(account, tube, Utc::now(), ChannelRequestHints::new())
            .await
    }
}

impl ClientRegistrar for MockRegistrar {
    fn bus_unique_name(&self) -> String {
        ":1.42".to_string()
    }

    fn register_client(&self, handler: Arc<TubeOfferHandler>, client_name: &str) -> bool {
        if !self.accept_registrations.load(Ordering::SeqCst) {
            return false;
        }
        self.registrations.lock().push(client_name.to_string());
        *self.handler.lock() = Some(handler);
        true
    }

    fn unregister_client(&self, client_name: &str) {
        self.unregistrations.lock().push(client_name.to_string());
        self.handler.lock().take();
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Generator returning the same source address for every tube
#[derive(Debug, Clone, Copy)]
pub struct FixedSourceGenerator(pub SocketAddr);

impl TcpSourceAddressGenerator for FixedSourceGenerator {
    fn next_source_address(
        &self,
        _account: &AccountRef,
        _tube: &dyn IncomingStreamTube,
    ) -> SocketAddr {
        self.0
    }
}

/// Wait for the next client event
///
/// # Panics
///
/// Panics if no event arrives within [`EVENT_TIMEOUT`] or the channel closes.
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<TubeClientEvent>) -> TubeClientEvent {
    match tokio::time::timeout(EVENT_TIMEOUT, events.recv()).await {
        Ok(Some(event)) => event,
        Ok(None) => panic!("event channel closed"),
        Err(_) => panic!("no client event within {EVENT_TIMEOUT:?}"),
    }
}

/// Install a test tracing subscriber honouring `RUST_LOG`
///
/// Safe to call from every test; only the first call installs it.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
