//! Tube Channel Boundary
//!
//! Identity types and the collaborator traits through which the client talks
//! to tube channel objects. The channel objects themselves live outside this
//! crate: they own the bus proxy and perform the socket-level accept.
//!
//! # Design Philosophy
//!
//! The client never does socket I/O. It asks an [`IncomingStreamTube`] to
//! accept itself with some access control, and listens to the tube's
//! [`TubeSignal`]s for connection and invalidation notifications.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::AcceptError;

/// Bus-assigned identity of a tube channel (its object path)
///
/// Unique per live tube; used as the key of the client's session map.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TubeId(String);

impl TubeId {
    /// Create a tube ID from an object path
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Get the object path
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TubeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The account a tube was offered on
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountRef(String);

impl AccountRef {
    /// Create an account reference from an object path
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Get the object path
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one wire connection made through an accepted tube
///
/// Scoped to a single tube; two tubes may report the same number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u32);

impl ConnectionId {
    /// Create a connection ID from the value reported by the tube
    #[must_use]
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Socket access-control schemes a tube can honour
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TubeCapabilities {
    /// IPv4 sockets restricted to a specified source address (Port AC)
    pub ipv4_with_source_address: bool,
    /// IPv6 sockets restricted to a specified source address (Port AC)
    pub ipv6_with_source_address: bool,
    /// Unix sockets requiring an `SCM_CREDENTIALS` byte (Credentials AC)
    pub unix_with_credentials: bool,
}

impl TubeCapabilities {
    /// Only Localhost access control is available
    #[must_use]
    pub fn localhost_only() -> Self {
        Self::default()
    }

    /// Every access-control scheme is available
    #[must_use]
    pub fn full() -> Self {
        Self {
            ipv4_with_source_address: true,
            ipv6_with_source_address: true,
            unix_with_credentials: true,
        }
    }

    /// Whether a specified source address is supported for this address's family
    #[must_use]
    pub fn supports_source_address(&self, addr: &SocketAddr) -> bool {
        match addr {
            SocketAddr::V4(_) => self.ipv4_with_source_address,
            SocketAddr::V6(_) => self.ipv6_with_source_address,
        }
    }
}

/// Local endpoint produced by a successful accept
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcceptedEndpoint {
    /// The tube is exposed as a TCP listener
    Tcp {
        /// Address and port to connect to
        listen_address: SocketAddr,
    },
    /// The tube is exposed as a Unix socket
    Unix {
        /// Socket path
        path: PathBuf,
        /// Whether a credentials byte must be sent on connect
        requires_credentials: bool,
        /// The byte to send with the credentials
        credential_byte: u8,
    },
}

/// Notifications emitted by a tube channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TubeSignal {
    /// A socket connection was made through the tube
    NewConnection {
        /// Tube-scoped connection identifier
        connection_id: ConnectionId,
    },
    /// A connection through the tube went away
    ConnectionClosed {
        /// Tube-scoped connection identifier
        connection_id: ConnectionId,
        /// Error name (empty on a clean close)
        error: String,
        /// Error message
        message: String,
    },
    /// The tube channel is no longer usable
    Invalidated {
        /// Error name
        error: String,
        /// Error message
        message: String,
    },
}

/// Request hints passed along with a dispatched channel
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRequestHints(HashMap<String, String>);

impl ChannelRequestHints {
    /// Empty hints
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hint
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Look up a hint
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether no hints were given
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Any stream tube channel handed to the client by the dispatcher
pub trait StreamTube: Send + Sync {
    /// Bus identity of the channel
    fn id(&self) -> &TubeId;

    /// Service name the tube was offered for
    fn service(&self) -> &str;

    /// Whether the local side requested the tube (outgoing tube)
    fn is_requested(&self) -> bool;

    /// Whether the channel is still usable
    fn is_valid(&self) -> bool;

    /// Ask the remote end to close the channel
    fn request_close(&self);

    /// View this channel as an incoming stream tube, if the channel factory
    /// built one
    fn into_incoming(self: Arc<Self>) -> Option<Arc<dyn IncomingStreamTube>>;
}

/// A peer-initiated stream tube that can be accepted locally
#[async_trait]
pub trait IncomingStreamTube: StreamTube {
    /// Access-control schemes this tube supports
    fn capabilities(&self) -> TubeCapabilities;

    /// Accept the tube as a TCP socket
    ///
    /// A `source_address` of the wildcard address with port 0 requests
    /// Localhost access control; anything else requests Port access control.
    async fn accept_as_tcp(
        &self,
        source_address: SocketAddr,
    ) -> Result<AcceptedEndpoint, AcceptError>;

    /// Accept the tube as a Unix socket
    async fn accept_as_unix(
        &self,
        require_credentials: bool,
    ) -> Result<AcceptedEndpoint, AcceptError>;

    /// Subscribe to the tube's connection and invalidation notifications
    fn subscribe(&self) -> broadcast::Receiver<TubeSignal>;
}

/// An (account, incoming tube) pair as exposed to client users
///
/// Two `Tube`s are equal when they name the same account and channel path.
#[derive(Clone)]
pub struct Tube {
    account: AccountRef,
    channel: Arc<dyn IncomingStreamTube>,
}

impl Tube {
    /// Pair an account with a tube channel
    pub fn new(account: AccountRef, channel: Arc<dyn IncomingStreamTube>) -> Self {
        Self { account, channel }
    }

    /// The account the tube was offered on
    #[must_use]
    pub fn account(&self) -> &AccountRef {
        &self.account
    }

    /// The tube channel
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn IncomingStreamTube> {
        &self.channel
    }

    /// Bus identity of the tube channel
    #[must_use]
    pub fn id(&self) -> &TubeId {
        self.channel.id()
    }
}

impl PartialEq for Tube {
    fn eq(&self, other: &Self) -> bool {
        self.account == other.account && self.id() == other.id()
    }
}

impl Eq for Tube {}

impl Hash for Tube {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.account.hash(state);
        self.id().hash(state);
    }
}

impl fmt::Debug for Tube {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tube")
            .field("account", &self.account)
            .field("id", self.id())
            .field("service", &self.channel.service())
            .finish()
    }
}
