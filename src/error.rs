//! Error types for probing runs.

use std::net::IpAddr;
use thiserror::Error;

use crate::config::IpFamily;

/// Main error type for the engine.
#[derive(Error, Debug)]
pub enum MtrError {
    // Setup errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "Insufficient permissions for raw sockets ({source}).\n\n\
         Fix options:\n\
         \u{2022} Run with sudo: sudo hopwatch <target>\n\
         \u{2022} Add capability: sudo setcap cap_net_raw+ep {binary}"
    )]
    InsufficientPermissions {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create socket: {0}")]
    SocketCreation(#[source] std::io::Error),

    #[error("Failed to resolve target {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("No {family} address found for {host}")]
    NoAddressForFamily { host: String, family: IpFamily },

    #[error("Probe target has not been set")]
    TargetNotSet,

    #[error("Target {addr} does not match prober family {family}")]
    FamilyMismatch { addr: IpAddr, family: IpFamily },

    // Transport errors
    #[error("Failed to send probe: {0}")]
    Send(#[source] std::io::Error),

    #[error("Failed to receive response: {0}")]
    Receive(#[source] std::io::Error),

    // Collaborator setup
    #[error("Unknown geoip source: {0}")]
    UnknownGeoSource(String),

    #[error("Failed to open geoip database {path}: {reason}")]
    GeoDatabase { path: String, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl MtrError {
    /// Wrap a raw socket creation failure, separating privilege problems
    /// from other I/O failures.
    pub fn from_socket_creation(err: std::io::Error) -> Self {
        let denied = err.kind() == std::io::ErrorKind::PermissionDenied
            || matches!(err.raw_os_error(), Some(1) | Some(13)); // EPERM, EACCES
        if denied {
            let binary = std::env::current_exe()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "hopwatch".to_string());
            Self::InsufficientPermissions {
                binary,
                source: err,
            }
        } else {
            Self::SocketCreation(err)
        }
    }

    /// True for failures that happen before any probe is sent.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_)
                | Self::InsufficientPermissions { .. }
                | Self::SocketCreation(_)
                | Self::Resolve { .. }
                | Self::NoAddressForFamily { .. }
                | Self::TargetNotSet
                | Self::FamilyMismatch { .. }
                | Self::UnknownGeoSource(_)
                | Self::GeoDatabase { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// I/O errors are not `Clone`; rebuild one with the same OS code or kind and
/// message.
fn clone_io(err: &std::io::Error) -> std::io::Error {
    match err.raw_os_error() {
        Some(code) => std::io::Error::from_raw_os_error(code),
        None => std::io::Error::new(err.kind(), err.to_string()),
    }
}

impl Clone for MtrError {
    fn clone(&self) -> Self {
        match self {
            Self::InvalidConfig(s) => Self::InvalidConfig(s.clone()),
            Self::InsufficientPermissions { binary, source } => Self::InsufficientPermissions {
                binary: binary.clone(),
                source: clone_io(source),
            },
            Self::SocketCreation(e) => Self::SocketCreation(clone_io(e)),
            Self::Resolve { host, reason } => Self::Resolve {
                host: host.clone(),
                reason: reason.clone(),
            },
            Self::NoAddressForFamily { host, family } => Self::NoAddressForFamily {
                host: host.clone(),
                family: *family,
            },
            Self::TargetNotSet => Self::TargetNotSet,
            Self::FamilyMismatch { addr, family } => Self::FamilyMismatch {
                addr: *addr,
                family: *family,
            },
            Self::Send(e) => Self::Send(clone_io(e)),
            Self::Receive(e) => Self::Receive(clone_io(e)),
            Self::UnknownGeoSource(s) => Self::UnknownGeoSource(s.clone()),
            Self::GeoDatabase { path, reason } => Self::GeoDatabase {
                path: path.clone(),
                reason: reason.clone(),
            },
            Self::Internal(s) => Self::Internal(s.clone()),
            Self::Cancelled => Self::Cancelled,
        }
    }
}

/// Result type alias for engine operations.
pub type MtrResult<T> = Result<T, MtrError>;
