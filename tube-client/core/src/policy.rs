//! Access-Control Policy
//!
//! Decides which access control to request when accepting a tube, given the
//! client's acceptance mode and what the tube supports.
//!
//! # Fallback Rules
//!
//! - **Port AC** (TCP with a specified source address): if the tube cannot
//!   restrict connections to a source address of that address family, fall
//!   back to Localhost AC (wildcard address of the same family, port 0).
//! - **Credentials AC** (Unix with `SCM_CREDENTIALS`): if the tube cannot check
//!   credentials, fall back to Localhost AC (`require_credentials = false`).
//!
//! A fallback is never an error. [`AccessPolicy::resolve`] is a pure function
//! of its inputs.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use crate::tube::{AccountRef, IncomingStreamTube, TubeCapabilities};

/// Source address meaning "no source binding requested"
pub const LOCALHOST_AC: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// Callback choosing the source address for TCP tubes (Port AC)
///
/// Implementations must answer synchronously. Returning [`LOCALHOST_AC`]
/// (or any port-0 address) skips Port AC for that tube, for example because
/// several connections will be made through it.
pub trait TcpSourceAddressGenerator: Send + Sync {
    /// Pick the local address the application socket will connect from
    fn next_source_address(
        &self,
        account: &AccountRef,
        tube: &dyn IncomingStreamTube,
    ) -> SocketAddr;
}

/// How the client accepts offered tubes
///
/// Only one mode is active at a time; switching modes affects tubes offered
/// afterwards, never tubes already being accepted.
#[derive(Clone, Default)]
pub enum AcceptanceMode {
    /// Neither TCP nor Unix acceptance has been configured yet
    #[default]
    Unconfigured,
    /// Accept as TCP sockets, optionally with Port AC
    Tcp {
        /// Source address generator (`None` means Localhost AC)
        generator: Option<Arc<dyn TcpSourceAddressGenerator>>,
    },
    /// Accept as Unix sockets
    Unix {
        /// Whether to ask for Credentials AC
        require_credentials: bool,
    },
}

impl AcceptanceMode {
    /// Whether TCP acceptance is configured
    #[must_use]
    pub fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp { .. })
    }

    /// Whether Unix acceptance is configured
    #[must_use]
    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix { .. })
    }

    /// Whether any acceptance mode is configured
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !matches!(self, Self::Unconfigured)
    }

    /// Short name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::Tcp { .. } => "tcp",
            Self::Unix { .. } => "unix",
        }
    }

    /// The access control this mode asks for on a given tube, before fallback
    ///
    /// Calls the TCP source address generator if one is set. Returns `None`
    /// when the mode is unconfigured.
    pub fn requested_access(
        &self,
        account: &AccountRef,
        tube: &dyn IncomingStreamTube,
    ) -> Option<AccessParams> {
        match self {
            Self::Unconfigured => None,
            Self::Tcp { generator } => {
                let source_address = generator
                    .as_ref()
                    .map_or(LOCALHOST_AC, |g| g.next_source_address(account, tube));
                Some(AccessParams::Tcp { source_address })
            }
            Self::Unix {
                require_credentials,
            } => Some(AccessParams::Unix {
                require_credentials: *require_credentials,
            }),
        }
    }
}

impl fmt::Debug for AcceptanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconfigured => f.write_str("Unconfigured"),
            Self::Tcp { generator } => f
                .debug_struct("Tcp")
                .field("generator", &generator.is_some())
                .finish(),
            Self::Unix {
                require_credentials,
            } => f
                .debug_struct("Unix")
                .field("require_credentials", require_credentials)
                .finish(),
        }
    }
}

/// Access-control parameters for one accept call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessParams {
    /// Accept as TCP, connecting from `source_address`
    Tcp {
        /// Source address (port 0 means Localhost AC)
        source_address: SocketAddr,
    },
    /// Accept as Unix
    Unix {
        /// Whether to require a credentials byte
        require_credentials: bool,
    },
}

impl AccessParams {
    /// The TCP source address, if these are TCP parameters
    #[must_use]
    pub fn source_address(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp { source_address } => Some(*source_address),
            Self::Unix { .. } => None,
        }
    }
}

/// Outcome of resolving requested access against a tube's capabilities
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedAccess {
    /// Parameters to actually pass to the accept call
    pub params: AccessParams,
    /// Whether the request was downgraded to Localhost AC
    pub fell_back: bool,
}

/// Access-control fallback logic
#[derive(Clone, Copy, Debug, Default)]
pub struct AccessPolicy;

impl AccessPolicy {
    /// Resolve the parameters to use for a tube with `capabilities`
    #[must_use]
    pub fn resolve(requested: AccessParams, capabilities: TubeCapabilities) -> ResolvedAccess {
        match requested {
            AccessParams::Tcp { source_address }
                if source_address.port() != 0
                    && !capabilities.supports_source_address(&source_address) =>
            {
                ResolvedAccess {
                    params: AccessParams::Tcp {
                        source_address: wildcard_for(&source_address),
                    },
                    fell_back: true,
                }
            }
            AccessParams::Unix {
                require_credentials: true,
            } if !capabilities.unix_with_credentials => ResolvedAccess {
                params: AccessParams::Unix {
                    require_credentials: false,
                },
                fell_back: true,
            },
            params => ResolvedAccess {
                params,
                fell_back: false,
            },
        }
    }
}

/// The unspecified address of the same family as `addr`, with port 0
#[must_use]
pub fn wildcard_for(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => LOCALHOST_AC,
        SocketAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
    }
}
