//! Channel Dispatch Boundary
//!
//! The [`ClientRegistrar`] publishes a handler on the bus so the channel
//! dispatcher can hand incoming stream tubes to this process. The object
//! registered is a [`TubeOfferHandler`]: it carries the channel-class filter
//! and forwards every dispatched tube into the client engine.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::client::{Command, OfferRequest};
use crate::error::TubeClientError;
use crate::tube::{AccountRef, ChannelRequestHints, StreamTube};

/// Registers client handlers with the bus dispatch mechanism
pub trait ClientRegistrar: Send + Sync {
    /// Unique name of this process's bus connection (e.g. `:1.42`)
    fn bus_unique_name(&self) -> String;

    /// Publish `handler` under `client_name`; false if registration failed
    fn register_client(&self, handler: Arc<TubeOfferHandler>, client_name: &str) -> bool;

    /// Withdraw the handler published under `client_name`
    fn unregister_client(&self, client_name: &str);
}

/// Whether a tube service is offered one-to-one or in a room
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TubeTarget {
    /// Peer-to-peer tube with a single contact
    Contact,
    /// Tube shared in a chat room
    Room,
}

/// One channel class the handler asks the dispatcher for
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelClassFilter {
    /// Stream tube service name
    pub service: String,
    /// Contact or room tubes
    pub target: TubeTarget,
    /// Always false: only peer-initiated tubes are handled
    pub requested: bool,
}

impl ChannelClassFilter {
    /// Filter for incoming tubes of `service` with the given target
    pub fn incoming(service: impl Into<String>, target: TubeTarget) -> Self {
        Self {
            service: service.into(),
            target,
            requested: false,
        }
    }
}

/// What the engine did with an offered tube
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OfferOutcome {
    /// A new session was created and the accept started
    Created,
    /// The tube is already tracked; nothing happened
    Duplicate,
    /// The channel was not an incoming stream tube; close was requested
    Rejected,
}

/// Handler object registered with the [`ClientRegistrar`]
pub struct TubeOfferHandler {
    filter: Vec<ChannelClassFilter>,
    monitor_connections: bool,
    bypass_approval: bool,
    registered: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<Command>,
}

impl TubeOfferHandler {
    pub(crate) fn new(
        p2p_services: &[String],
        room_services: &[String],
        monitor_connections: bool,
        bypass_approval: bool,
        registered: Arc<AtomicBool>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let filter = p2p_services
            .iter()
            .map(|s| ChannelClassFilter::incoming(s.clone(), TubeTarget::Contact))
            .chain(
                room_services
                    .iter()
                    .map(|s| ChannelClassFilter::incoming(s.clone(), TubeTarget::Room)),
            )
            .collect();

        Self {
            filter,
            monitor_connections,
            bypass_approval,
            registered,
            commands,
        }
    }

    /// Channel classes this handler accepts
    #[must_use]
    pub fn channel_filter(&self) -> &[ChannelClassFilter] {
        &self.filter
    }

    /// Whether tubes should be handed over without user approval
    #[must_use]
    pub fn bypass_approval(&self) -> bool {
        self.bypass_approval
    }

    /// Whether per-connection events are tracked
    #[must_use]
    pub fn monitors_connections(&self) -> bool {
        self.monitor_connections
    }

    /// Hand a dispatched tube to the client
    ///
    /// # Panics
    ///
    /// The dispatcher must only deliver tubes to a registered handler, and
    /// only peer-initiated ones. Violating either is a programming error.
    ///
    /// # Errors
    ///
    /// Returns [`TubeClientError::EngineStopped`] if the client is gone.
    pub async fn handle_tube(
        &self,
        account: AccountRef,
        tube: Arc<dyn StreamTube>,
        user_action_time: DateTime<Utc>,
        hints: ChannelRequestHints,
    ) -> Result<OfferOutcome, TubeClientError> {
        assert!(
            self.registered.load(Ordering::SeqCst),
            "stream tube handler invoked before registration"
        );
        assert!(
            !tube.is_requested(),
            "outgoing tube {} dispatched to a stream tube client",
            tube.id()
        );
        debug_assert!(tube.is_valid(), "invalid tube {} dispatched", tube.id());

        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Offer(OfferRequest {
                account,
                tube,
                user_action_time,
                hints,
                reply,
            }))
            .map_err(|_| TubeClientError::EngineStopped)?;

        outcome.await.map_err(|_| TubeClientError::EngineStopped)
    }
}

impl fmt::Debug for TubeOfferHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TubeOfferHandler")
            .field("filter", &self.filter)
            .field("monitor_connections", &self.monitor_connections)
            .field("bypass_approval", &self.bypass_approval)
            .field("registered", &self.registered.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
