//! Relay engine errors.

use std::io;

use thiserror::Error;

use crate::session::SessionError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Not connected")]
    NotConnected,

    #[error("Peer silent after {0} empty reads")]
    PeerSilent(u32),

    #[error("Link failed: {0}")]
    Link(String),

    #[error("Poll failed: {0}")]
    Poll(String),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

impl RelayError {
    /// Creates a new link error
    pub fn link(msg: impl Into<String>) -> Self {
        RelayError::Link(msg.into())
    }

    /// Creates a new poll error
    pub fn poll(msg: impl Into<String>) -> Self {
        RelayError::Poll(msg.into())
    }

    /// Failures of the TCP link itself, counted toward the error threshold.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            RelayError::Io(_) | RelayError::NotConnected | RelayError::Link(_)
        )
    }
}
