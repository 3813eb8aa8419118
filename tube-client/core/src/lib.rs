//! Tube Client Core - Accepting Incoming Stream Tubes
//!
//! This crate accepts stream tubes that peers offer to the local process,
//! exposes each accepted tube as a local TCP or Unix socket endpoint, and
//! reports the lifecycle of every tube and of the connections made through
//! it. It does no socket I/O itself: tube channels and the bus dispatcher are
//! collaborators behind traits.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Channel Dispatcher (bus)                      │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ handle_tube(account, tube)
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                        TUBE CLIENT CORE                           │
//! │                    ┌──────────┴─────────┐                         │
//! │                    │  TubeOfferHandler  │                         │
//! │                    └──────────┬─────────┘                         │
//! │                               │ Command                           │
//! │  ┌────────────────────────────┴────────────────────────────────┐  │
//! │  │                 StreamTubeClient engine                      │  │
//! │  │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────┐  │  │
//! │  │  │ AccessPolicy │  │ TubeSession  │  │  Connection sets   │  │  │
//! │  │  │  (fallback)  │  │   actors     │  │  (monitoring)      │  │  │
//! │  │  └──────────────┘  └──────┬───────┘  └────────────────────┘  │  │
//! │  └───────────────────────────┼──────────────────────────────────┘  │
//! └──────────────────────────────┼─────────────────────────────────────┘
//!                                │ accept / TubeSignal
//!                     ┌──────────┴──────────┐
//!                     │ IncomingStreamTube  │
//!                     └─────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`StreamTubeClient`]: The broker that accepts tubes and tracks sessions
//! - [`TubeClientEvent`]: Lifecycle events sent to the client's user
//! - [`AcceptanceMode`]: TCP (optionally with Port AC) or Unix acceptance
//! - [`AccessPolicy`]: Downgrade to Localhost AC when a tube lacks support
//! - [`IncomingStreamTube`] / [`ClientRegistrar`]: Collaborator boundaries
//!
//! # Quick Start
//!
//! ```ignore
//! use tube_client_core::{StreamTubeClient, TubeClientEvent, TubeClientOptions};
//! use tokio::sync::mpsc;
//!
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! let client = StreamTubeClient::create(
//!     registrar,
//!     TubeClientOptions::p2p(["x-vnc"]).with_monitor_connections(true),
//!     tx,
//! )?;
//! client.set_to_accept_as_tcp(None);
//!
//! while let Some(event) = rx.recv().await {
//!     if let TubeClientEvent::TubeAcceptedAsTcp { listen_address, .. } = event {
//!         // Point the application at listen_address
//!     }
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`client`]: The broker and its engine task
//! - [`config`]: TOML and environment configuration
//! - [`error`]: Error types
//! - [`events`]: Events emitted to the client's user
//! - [`handler`]: The handler object published to the dispatcher
//! - [`policy`]: Acceptance modes and access-control fallback
//! - [`session`]: Per-tube session state and accept actor
//! - [`test_utils`]: Mock tubes and registrar for tests
//! - [`tube`]: Tube identity types and channel traits

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod policy;
pub mod session;
pub mod test_utils;
pub mod tube;

pub use client::{StreamTubeClient, TubeClientOptions};
pub use config::{
    default_config_path, load_config, load_config_from_path, AcceptModeConfig, ConfigError,
    ConfigOverrides, ConfigSource, TubeClientConfig,
};
pub use error::{AcceptError, TubeClientError};
pub use events::TubeClientEvent;
pub use handler::{ChannelClassFilter, ClientRegistrar, OfferOutcome, TubeOfferHandler, TubeTarget};
pub use policy::{
    AcceptanceMode, AccessParams, AccessPolicy, ResolvedAccess, TcpSourceAddressGenerator,
    LOCALHOST_AC,
};
pub use session::{SessionSerial, SessionState, TubeSession};
pub use tube::{
    AcceptedEndpoint, AccountRef, ChannelRequestHints, ConnectionId, IncomingStreamTube,
    StreamTube, Tube, TubeCapabilities, TubeId, TubeSignal,
};
