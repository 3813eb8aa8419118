//! Client Events
//!
//! Lifecycle events emitted by the [`StreamTubeClient`](crate::StreamTubeClient).
//!
//! `TubeOffered` and `TubeClosed` are always emitted. The accepted events are
//! emitted for whichever acceptance mode was active when the tube was offered.
//! Connection events are only emitted when connection monitoring is enabled.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::tube::{ConnectionId, Tube};

/// Events from the stream tube client to its user
#[derive(Clone, Debug)]
pub enum TubeClientEvent {
    // ============================================
    // Always emitted
    // ============================================
    /// A peer offered a tube and the client started accepting it
    TubeOffered {
        /// The offered tube
        tube: Tube,
    },

    /// The client stopped tracking a tube (accept failure or invalidation)
    TubeClosed {
        /// The tube
        tube: Tube,
        /// Error name
        error: String,
        /// Error message
        message: String,
    },

    // ============================================
    // Accept results
    // ============================================
    /// The tube was accepted as a TCP socket
    TubeAcceptedAsTcp {
        /// Address the local endpoint listens on
        listen_address: SocketAddr,
        /// Source address the application should connect from
        ///
        /// The wildcard address with port 0 when no Port AC is in use.
        source_address: SocketAddr,
        /// The tube
        tube: Tube,
    },

    /// The tube was accepted as a Unix socket
    TubeAcceptedAsUnix {
        /// Socket path to connect to
        listen_path: PathBuf,
        /// Whether a credentials byte must be sent
        requires_credentials: bool,
        /// The byte to send with the credentials
        credential_byte: u8,
        /// The tube
        tube: Tube,
    },

    // ============================================
    // Connection monitoring
    // ============================================
    /// A connection was made through an accepted tube
    NewConnection {
        /// The tube
        tube: Tube,
        /// Tube-scoped connection identifier
        connection_id: ConnectionId,
    },

    /// A connection through an accepted tube was closed
    ConnectionClosed {
        /// The tube
        tube: Tube,
        /// Tube-scoped connection identifier
        connection_id: ConnectionId,
        /// Error name (empty on a clean close)
        error: String,
        /// Error message
        message: String,
    },
}

impl TubeClientEvent {
    /// The tube this event is about
    #[must_use]
    pub fn tube(&self) -> &Tube {
        match self {
            Self::TubeOffered { tube }
            | Self::TubeClosed { tube, .. }
            | Self::TubeAcceptedAsTcp { tube, .. }
            | Self::TubeAcceptedAsUnix { tube, .. }
            | Self::NewConnection { tube, .. }
            | Self::ConnectionClosed { tube, .. } => tube,
        }
    }

    /// Event name (for logging)
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::TubeOffered { .. } => "TubeOffered",
            Self::TubeClosed { .. } => "TubeClosed",
            Self::TubeAcceptedAsTcp { .. } => "TubeAcceptedAsTcp",
            Self::TubeAcceptedAsUnix { .. } => "TubeAcceptedAsUnix",
            Self::NewConnection { .. } => "NewConnection",
            Self::ConnectionClosed { .. } => "ConnectionClosed",
        }
    }
}
