//! Tube Sessions
//!
//! One [`TubeSession`] exists per offered tube while the client tracks it. The
//! session owns the tube's accept attempt and relays the tube's own signals
//! back to the client engine.
//!
//! # State Machine
//!
//! ```text
//!              accept ok            invalidated
//!  Accepting ───────────► Accepted ─────────────► Closed
//!      │  │
//!      │  └─ accept failed ─► Failed
//!      └──── invalidated ───► Closed
//! ```
//!
//! `Failed` and `Closed` are terminal. The engine is the only writer of the
//! state; the session actor task only reports what happened.
//!
//! # Actor
//!
//! Each session spawns one task which calls the tube's accept and listens to
//! the tube's [`TubeSignal`]s. Everything it learns is sent to the engine as a
//! [`SessionMessage`] tagged with the tube ID and the session's
//! [`SessionSerial`], so messages from a previous session for the same tube
//! can be told apart and dropped. Connection signals seen while the accept
//! is still in flight are held back until the accept result has been sent.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::client::Command;
use crate::error::AcceptError;
use crate::policy::{AccessParams, AccessPolicy};
use crate::tube::{AcceptedEndpoint, ConnectionId, IncomingStreamTube, Tube, TubeId, TubeSignal};

/// Acceptance state of a tube session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Accept call in flight
    Accepting,
    /// Tube accepted, local endpoint available
    Accepted,
    /// Accept failed
    Failed,
    /// Tube invalidated
    Closed,
}

impl SessionState {
    /// Whether no further transition is possible
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    /// Whether `self -> next` is an allowed transition
    #[must_use]
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::Accepting, Self::Accepted | Self::Failed | Self::Closed)
                | (Self::Accepted, Self::Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Accepting => "accepting",
            Self::Accepted => "accepted",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Generation number distinguishing successive sessions for the same tube
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionSerial(u64);

impl SessionSerial {
    /// Allocate the next serial
    #[must_use]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// What a session actor observed
#[derive(Debug)]
pub(crate) enum SessionUpdate {
    /// The accept call finished
    AcceptFinished(Result<AcceptedEndpoint, AcceptError>),
    /// The tube reported a new connection
    NewConnection(ConnectionId),
    /// The tube reported a closed connection
    ConnectionClosed {
        connection_id: ConnectionId,
        error: String,
        message: String,
    },
    /// The tube was invalidated
    Invalidated { error: String, message: String },
}

/// A [`SessionUpdate`] addressed to one session
#[derive(Debug)]
pub(crate) struct SessionMessage {
    pub(crate) tube_id: TubeId,
    pub(crate) serial: SessionSerial,
    pub(crate) update: SessionUpdate,
}

/// State held for one offered tube
pub struct TubeSession {
    tube: Tube,
    serial: SessionSerial,
    access: AccessParams,
    state: SessionState,
    open_connections: BTreeSet<ConnectionId>,
    created_at: Instant,
    actor: JoinHandle<()>,
}

impl TubeSession {
    /// Resolve access control for the tube and start accepting it
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn start(
        tube: Tube,
        requested: AccessParams,
        monitor_connections: bool,
        engine: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let resolved = AccessPolicy::resolve(requested, tube.channel().capabilities());
        if resolved.fell_back {
            tracing::debug!(
                tube = %tube.id(),
                requested = ?requested,
                effective = ?resolved.params,
                "Falling back to Localhost access control"
            );
        }

        let serial = SessionSerial::next();
        // Subscribe before the accept starts so no signal can slip past
        let signals = tube.channel().subscribe();
        let actor = tokio::spawn(run_actor(ActorContext {
            channel: Arc::clone(tube.channel()),
            tube_id: tube.id().clone(),
            serial,
            access: resolved.params,
            monitor_connections,
            engine,
            signals: BroadcastStream::new(signals),
        }));

        Self {
            tube,
            serial,
            access: resolved.params,
            state: SessionState::Accepting,
            open_connections: BTreeSet::new(),
            created_at: Instant::now(),
            actor,
        }
    }

    /// The (account, tube) pair
    #[must_use]
    pub fn tube(&self) -> &Tube {
        &self.tube
    }

    /// This session's serial
    #[must_use]
    pub fn serial(&self) -> SessionSerial {
        self.serial
    }

    /// Current acceptance state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Effective access control passed to the accept call
    #[must_use]
    pub fn access(&self) -> AccessParams {
        self.access
    }

    /// Source address used for TCP acceptance (after fallback)
    #[must_use]
    pub fn source_address(&self) -> Option<SocketAddr> {
        self.access.source_address()
    }

    /// Connections currently open through the tube
    #[must_use]
    pub fn open_connections(&self) -> &BTreeSet<ConnectionId> {
        &self.open_connections
    }

    /// Seconds since the tube was offered
    #[must_use]
    pub fn age_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }

    /// Move to `next`; returns false (and changes nothing) if not allowed
    pub(crate) fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::debug!(
                tube = %self.tube.id(),
                from = %self.state,
                to = %next,
                "Ignoring invalid session transition"
            );
            return false;
        }
        self.state = next;
        if next.is_terminal() {
            self.open_connections.clear();
        }
        true
    }

    /// Track a new connection; false if the session cannot carry connections
    pub(crate) fn record_connection(&mut self, connection_id: ConnectionId) -> bool {
        if self.state != SessionState::Accepted {
            return false;
        }
        self.open_connections.insert(connection_id);
        true
    }

    /// Stop tracking a connection; false if the session is terminal
    pub(crate) fn forget_connection(&mut self, connection_id: ConnectionId) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.open_connections.remove(&connection_id);
        true
    }
}

impl Drop for TubeSession {
    fn drop(&mut self) {
        self.actor.abort();
    }
}

impl fmt::Debug for TubeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TubeSession")
            .field("tube", &self.tube)
            .field("serial", &self.serial)
            .field("state", &self.state)
            .field("access", &self.access)
            .field("open_connections", &self.open_connections)
            .finish_non_exhaustive()
    }
}

struct ActorContext {
    channel: Arc<dyn IncomingStreamTube>,
    tube_id: TubeId,
    serial: SessionSerial,
    access: AccessParams,
    monitor_connections: bool,
    engine: mpsc::UnboundedSender<Command>,
    signals: BroadcastStream<TubeSignal>,
}

impl ActorContext {
    /// Send an update to the engine; false once the engine is gone
    fn send(&self, update: SessionUpdate) -> bool {
        self.engine
            .send(Command::Session(SessionMessage {
                tube_id: self.tube_id.clone(),
                serial: self.serial,
                update,
            }))
            .is_ok()
    }

    /// Forward a tube signal after the accept finished; false to stop the actor
    fn relay(&self, signal: TubeSignal) -> bool {
        match signal {
            TubeSignal::Invalidated { error, message } => {
                self.send(SessionUpdate::Invalidated { error, message });
                false
            }
            TubeSignal::NewConnection { connection_id } if self.monitor_connections => {
                self.send(SessionUpdate::NewConnection(connection_id))
            }
            TubeSignal::ConnectionClosed {
                connection_id,
                error,
                message,
            } if self.monitor_connections => self.send(SessionUpdate::ConnectionClosed {
                connection_id,
                error,
                message,
            }),
            _ => true,
        }
    }

    fn lagged(&self, skipped: u64) {
        tracing::warn!(
            tube = %self.tube_id,
            skipped = skipped,
            "Tube signal receiver lagged, notifications lost"
        );
    }
}

async fn run_actor(mut ctx: ActorContext) {
    let channel = Arc::clone(&ctx.channel);
    let access = ctx.access;
    let accept = async move {
        match access {
            AccessParams::Tcp { source_address } => channel.accept_as_tcp(source_address).await,
            AccessParams::Unix {
                require_credentials,
            } => channel.accept_as_unix(require_credentials).await,
        }
    };
    tokio::pin!(accept);

    let mut deferred = Vec::new();
    let mut signals_open = true;
    let result = loop {
        tokio::select! {
            result = &mut accept => break result,
            signal = ctx.signals.next(), if signals_open => match signal {
                Some(Ok(TubeSignal::Invalidated { error, message })) => {
                    ctx.send(SessionUpdate::Invalidated { error, message });
                    return;
                }
                Some(Ok(signal)) => deferred.push(signal),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => ctx.lagged(skipped),
                None => signals_open = false,
            },
        }
    };

    let accepted = result.is_ok();
    if !ctx.send(SessionUpdate::AcceptFinished(result)) || !accepted {
        return;
    }

    for signal in deferred {
        if !ctx.relay(signal) {
            return;
        }
    }

    while let Some(signal) = ctx.signals.next().await {
        match signal {
            Ok(signal) => {
                if !ctx.relay(signal) {
                    return;
                }
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => ctx.lagged(skipped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tube::AccountRef;
    use crate::test_utils::MockStreamTube;

    fn accepted_tcp() -> Result<AcceptedEndpoint, AcceptError> {
        Ok(AcceptedEndpoint::Tcp {
            listen_address: "127.0.0.1:5000".parse().unwrap(),
        })
    }

    async fn next_update(rx: &mut mpsc::UnboundedReceiver<Command>) -> SessionMessage {
        match rx.recv().await {
            Some(Command::Session(message)) => message,
            _ => panic!("expected a session message"),
        }
    }

    #[test]
    fn test_state_transitions() {
        use SessionState::*;
        assert!(Accepting.can_transition_to(Accepted));
        assert!(Accepting.can_transition_to(Failed));
        assert!(Accepting.can_transition_to(Closed));
        assert!(Accepted.can_transition_to(Closed));
        assert!(!Accepted.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Accepted));
        assert!(Failed.is_terminal() && Closed.is_terminal());
    }

    #[test]
    fn test_serials_are_unique() {
        assert_ne!(SessionSerial::next(), SessionSerial::next());
    }

    #[tokio::test]
    async fn test_session_reports_accept_result() {
        let mock = MockStreamTube::incoming("/tube/1");
        mock.complete_accept(accepted_tcp());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let session = TubeSession::start(
            Tube::new(AccountRef::new("/acc/1"), mock.clone()),
            AccessParams::Tcp {
                source_address: crate::policy::LOCALHOST_AC,
            },
            false,
            tx,
        );
        assert_eq!(session.state(), SessionState::Accepting);

        let message = next_update(&mut rx).await;
        assert_eq!(message.serial, session.serial());
        assert!(matches!(
            message.update,
            SessionUpdate::AcceptFinished(Ok(AcceptedEndpoint::Tcp { .. }))
        ));
    }

    #[tokio::test]
    async fn test_connection_signals_wait_for_accept() {
        let mock = MockStreamTube::incoming("/tube/2");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _session = TubeSession::start(
            Tube::new(AccountRef::new("/acc/1"), mock.clone()),
            AccessParams::Unix {
                require_credentials: false,
            },
            true,
            tx,
        );

        // Connection seen before the accept result is delivered
        mock.open_connection(3);
        tokio::task::yield_now().await;
        mock.complete_accept(Ok(AcceptedEndpoint::Unix {
            path: "/tmp/tube".into(),
            requires_credentials: false,
            credential_byte: 0,
        }));

        let first = next_update(&mut rx).await;
        assert!(matches!(first.update, SessionUpdate::AcceptFinished(Ok(_))));
        let second = next_update(&mut rx).await;
        assert!(matches!(
            second.update,
            SessionUpdate::NewConnection(id) if id == ConnectionId::new(3)
        ));
    }

    #[tokio::test]
    async fn test_invalidation_while_accepting() {
        let mock = MockStreamTube::incoming("/tube/3");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _session = TubeSession::start(
            Tube::new(AccountRef::new("/acc/1"), mock.clone()),
            AccessParams::Unix {
                require_credentials: false,
            },
            true,
            tx,
        );

        mock.invalidate("Cancelled", "peer hung up");
        let message = next_update(&mut rx).await;
        assert!(matches!(
            message.update,
            SessionUpdate::Invalidated { ref error, .. } if error == "Cancelled"
        ));
    }

    #[tokio::test]
    async fn test_connection_signals_dropped_without_monitoring() {
        let mock = MockStreamTube::incoming("/tube/4");
        mock.complete_accept(accepted_tcp());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _session = TubeSession::start(
            Tube::new(AccountRef::new("/acc/1"), mock.clone()),
            AccessParams::Tcp {
                source_address: crate::policy::LOCALHOST_AC,
            },
            false,
            tx,
        );

        let first = next_update(&mut rx).await;
        assert!(matches!(first.update, SessionUpdate::AcceptFinished(Ok(_))));

        mock.open_connection(1);
        mock.invalidate("Terminated", "bye");
        let next = next_update(&mut rx).await;
        assert!(matches!(next.update, SessionUpdate::Invalidated { .. }));
    }

    #[tokio::test]
    async fn test_terminal_session_tracks_no_connections() {
        let mock = MockStreamTube::incoming("/tube/5");
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = TubeSession::start(
            Tube::new(AccountRef::new("/acc/1"), mock),
            AccessParams::Unix {
                require_credentials: false,
            },
            true,
            tx,
        );

        assert!(!session.record_connection(ConnectionId::new(1)));
        assert!(session.transition(SessionState::Accepted));
        assert!(session.record_connection(ConnectionId::new(1)));
        assert!(session.transition(SessionState::Closed));
        assert!(session.open_connections().is_empty());
        assert!(!session.forget_connection(ConnectionId::new(1)));
        assert!(!session.transition(SessionState::Accepted));
    }
}
