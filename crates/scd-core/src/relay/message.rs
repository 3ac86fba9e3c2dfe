//! Relay control vocabulary.

use std::fmt;

/// Control messages exchanged between collector and edge.
///
/// Matched by exact equality; anything else on the wire is payload
/// (a sample row or a text chunk).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayMessage {
    /// Liveness probe / handshake.
    DevReady,
    /// Liveness probe / handshake.
    DevOpen,
    /// Start monitoring (STE without flash writes).
    SteStart,
    /// Stop monitoring.
    SteStop,
    /// Request one monitoring sample.
    SteReq,
    /// Record for the run time, then pull the flash block.
    BdtRun,
    /// Request the next text chunk of the block.
    BdtReq,
    /// Acknowledgment, echoed back by the edge.
    BdtEnd,
    /// Close the device session. Terminal.
    DevClose,
}

impl RelayMessage {
    pub const ALL: [RelayMessage; 9] = [
        RelayMessage::DevReady,
        RelayMessage::DevOpen,
        RelayMessage::SteStart,
        RelayMessage::SteStop,
        RelayMessage::SteReq,
        RelayMessage::BdtRun,
        RelayMessage::BdtReq,
        RelayMessage::BdtEnd,
        RelayMessage::DevClose,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelayMessage::DevReady => "DEV_READY",
            RelayMessage::DevOpen => "DEV_OPEN",
            RelayMessage::SteStart => "STE_START",
            RelayMessage::SteStop => "STE_STOP",
            RelayMessage::SteReq => "STE_REQ",
            RelayMessage::BdtRun => "BDT_RUN",
            RelayMessage::BdtReq => "BDT_REQ",
            RelayMessage::BdtEnd => "BDT_END",
            RelayMessage::DevClose => "DEV_CLOSE",
        }
    }

    /// Exact match only: no trimming, no case folding.
    pub fn parse(text: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == text)
    }
}

impl fmt::Display for RelayMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vocabulary_roundtrip() {
        for m in RelayMessage::ALL {
            assert_eq!(RelayMessage::parse(m.as_str()), Some(m));
        }
    }

    #[test]
    fn test_exact_match_only() {
        assert_eq!(RelayMessage::parse("STE_REQ\n"), None);
        assert_eq!(RelayMessage::parse("ste_req"), None);
        assert_eq!(RelayMessage::parse("BDT_START"), None);
        assert_eq!(RelayMessage::parse(""), None);
    }
}
