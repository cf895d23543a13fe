//! Error types for tracerouted.

use sonic_fabric_types::{MacAddress, PacketError, SwitchId};
use thiserror::Error;

/// Failure reported by the switch control channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwitchIoError {
    #[error("switch {0} is not reachable")]
    Unreachable(SwitchId),

    #[error("switch {switch} rejected the request: {reason}")]
    Rejected { switch: SwitchId, reason: String },

    #[error("timed out waiting for switch {0}")]
    Timeout(SwitchId),
}

/// Path discovery errors.
#[derive(Debug, Error)]
pub enum TraceError {
    /// Greedy coloring needed a color the tag field cannot carry.
    #[error("switch {switch} needs color {needed}, but the tag field only carries 1-{max}")]
    TooManyColors {
        switch: SwitchId,
        needed: u8,
        max: u8,
    },

    #[error("no attachment point known for endpoint {0}")]
    UnknownEndpoint(MacAddress),

    #[error("invalid probe: {0}")]
    InvalidProbe(String),

    #[error("failed to program tag rules on switch {switch}: {source}")]
    RuleInstall {
        switch: SwitchId,
        #[source]
        source: SwitchIoError,
    },

    #[error("failed to inject probe at switch {switch}: {source}")]
    PacketInjection {
        switch: SwitchId,
        #[source]
        source: SwitchIoError,
    },

    #[error("probe codec error: {0}")]
    Codec(#[from] PacketError),

    #[error("topology kept changing; gave up after {restarts} restarts")]
    TopologyUnstable { restarts: u32 },

    #[error("interception event stream closed")]
    EventStreamClosed,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TraceError {
    pub fn invalid_probe(reason: impl Into<String>) -> Self {
        Self::InvalidProbe(reason.into())
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    /// Errors a caller may clear by simply asking again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TopologyUnstable { .. } | Self::RuleInstall { .. } | Self::PacketInjection { .. }
        )
    }
}

/// Result type for tracerouted operations.
pub type Result<T> = std::result::Result<T, TraceError>;
