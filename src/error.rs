//! Shared error taxonomy for the proxy.
//!
//! One tagged enum covers every kind listed in the error handling design:
//! startup errors are fatal and bubble up through `anyhow`, session-scoped
//! errors are constructed here and logged by the connection handler.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum ProxyError {
    ConfigInvalid(String),
    CertLoadFailed(String),
    AcceptTransient(io::Error),
    HandshakeFailed(io::Error),
    NotAuthenticated(String),
    ClientNotConfigured(String),
    ClientExceedsLimit(String),
    CannotGetUpstream(String),
    UpstreamDialFailed(io::Error),
    ForwardIo(io::Error),
    ForwardHeartbeatTimeout,
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::ConfigInvalid(msg) => write!(f, "invalid configuration: {msg}"),
            ProxyError::CertLoadFailed(msg) => write!(f, "failed to load certificate material: {msg}"),
            ProxyError::AcceptTransient(e) => write!(f, "transient accept error: {e}"),
            ProxyError::HandshakeFailed(e) => write!(f, "TLS handshake failed: {e}"),
            ProxyError::NotAuthenticated(id) => write!(f, "client '{id}' is not configured"),
            ProxyError::ClientNotConfigured(id) => write!(f, "client '{id}' has no runtime state"),
            ProxyError::ClientExceedsLimit(id) => write!(f, "client '{id}' exceeds its connection limit"),
            ProxyError::CannotGetUpstream(id) => write!(f, "no permitted upstream available for client '{id}'"),
            ProxyError::UpstreamDialFailed(e) => write!(f, "failed to dial upstream: {e}"),
            ProxyError::ForwardIo(e) => write!(f, "forwarding I/O error: {e}"),
            ProxyError::ForwardHeartbeatTimeout => write!(f, "heartbeat timed out"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::AcceptTransient(e)
            | ProxyError::HandshakeFailed(e)
            | ProxyError::UpstreamDialFailed(e)
            | ProxyError::ForwardIo(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ProxyError {
    fn from(e: io::Error) -> Self {
        ProxyError::ForwardIo(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_non_empty_for_every_kind() {
        let kinds = vec![
            ProxyError::ConfigInvalid("x".into()),
            ProxyError::CertLoadFailed("x".into()),
            ProxyError::AcceptTransient(io::Error::other("x")),
            ProxyError::HandshakeFailed(io::Error::other("x")),
            ProxyError::NotAuthenticated("mallory".into()),
            ProxyError::ClientNotConfigured("mallory".into()),
            ProxyError::ClientExceedsLimit("bob".into()),
            ProxyError::CannotGetUpstream("carol".into()),
            ProxyError::UpstreamDialFailed(io::Error::other("x")),
            ProxyError::ForwardIo(io::Error::other("x")),
            ProxyError::ForwardHeartbeatTimeout,
        ];
        for kind in kinds {
            assert!(!kind.to_string().is_empty());
        }
    }

    #[test]
    fn not_authenticated_message_names_the_client() {
        let err = ProxyError::NotAuthenticated("mallory".into());
        assert!(err.to_string().contains("mallory"));
    }
}
