//! The error taxonomy shared across every module (§7 of the design).
//!
//! Call sites match on variant, never on message content; the `String`
//! payloads exist purely for operator-facing diagnostics.

use thiserror::Error;

/// The crate-wide result alias.
pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    /// An async resolution (ARP lookup, port lookup, ready handshake) did
    /// not complete before its deadline.
    #[error("operation timed out")]
    Timeout,

    /// A referenced entity (port, route, bridge, VTEP) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The shared-state store reported a transient failure. Retried by the
    /// connection-watcher scheduler with the same operation.
    #[error("state store access failed: {0}")]
    StateAccess(String),

    /// Encoding or decoding a wire value failed; fatal for the affected
    /// operation.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A vpn-helper invocation exited non-zero.
    #[error("ipsec helper step `{step}` failed (exit code {code:?})")]
    IPSecException {
        step: &'static str,
        code: Option<i32>,
    },

    /// The owning bridge is no longer bound to any VxLAN port; a normal
    /// termination signal for `VxGatewayManager`, not a fault.
    #[error("bridge is no longer part of a vxlan gateway")]
    NotInVxlanGateway,
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::StateAccess(e.to_string())
    }
}
