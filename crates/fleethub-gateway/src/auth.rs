//! Authorization gate for edge connections and messages.
//!
//! Evaluated once at session admission and again per message whenever a
//! message claims a different node identity than its session.

use tracing::warn;

use fleethub_core::NodeId;

use crate::config::{AuthorizationConfig, AuthorizationMode};

/// Result of evaluating the configured modes against one identity claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Claim admitted.
    Allow,

    /// Claim rejected.
    Deny,

    /// Claim would have been rejected, but debug mode tolerates it.
    AllowWithWarning,
}

impl Decision {
    /// Whether callers should let the connection/message proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow | Decision::AllowWithWarning)
    }
}

/// The authorization gate.
pub struct AuthorizationGate {
    enable: bool,
    debug: bool,
    modes: Vec<AuthorizationMode>,
}

impl AuthorizationGate {
    /// Build a gate from configuration.
    pub fn from_config(config: &AuthorizationConfig) -> Self {
        Self {
            enable: config.enable,
            debug: config.debug,
            modes: config.modes.clone(),
        }
    }

    /// Evaluate the configured modes, in order, against a claim.
    ///
    /// `cert_identity` is the certificate-derived identity of the session;
    /// `claimed` is the node the connection or message says it is.
    pub fn evaluate(&self, cert_identity: &NodeId, claimed: &NodeId) -> Decision {
        if !self.enable || self.modes.is_empty() {
            return Decision::Allow;
        }

        for mode in &self.modes {
            let denied = match mode {
                AuthorizationMode::Node => cert_identity != claimed,
            };

            if denied {
                if self.debug {
                    warn!(
                        cert_identity = %cert_identity,
                        claimed = %claimed,
                        "Authorization denied, tolerated by debug mode"
                    );
                    return Decision::AllowWithWarning;
                }
                warn!(
                    cert_identity = %cert_identity,
                    claimed = %claimed,
                    "Authorization denied"
                );
                return Decision::Deny;
            }
        }

        Decision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(enable: bool, debug: bool) -> AuthorizationGate {
        AuthorizationGate::from_config(&AuthorizationConfig {
            enable,
            debug,
            modes: vec![AuthorizationMode::Node],
        })
    }

    #[test]
    fn test_disabled_gate_allows_everything() {
        let gate = gate(false, false);
        let decision = gate.evaluate(&NodeId::new("edge-1"), &NodeId::new("edge-2"));
        assert_eq!(decision, Decision::Allow);
    }

    #[test]
    fn test_matching_identity_allows() {
        let gate = gate(true, false);
        let decision = gate.evaluate(&NodeId::new("edge-1"), &NodeId::new("edge-1"));
        assert_eq!(decision, Decision::Allow);
    }

    #[test]
    fn test_mismatch_denies() {
        let gate = gate(true, false);
        let decision = gate.evaluate(&NodeId::new("edge-1"), &NodeId::new("edge-2"));
        assert_eq!(decision, Decision::Deny);
        assert!(!decision.is_allowed());
    }

    #[test]
    fn test_debug_coerces_deny_to_warning() {
        let gate = gate(true, true);
        let decision = gate.evaluate(&NodeId::new("edge-1"), &NodeId::new("edge-2"));
        assert_eq!(decision, Decision::AllowWithWarning);
        assert!(decision.is_allowed());
    }

    #[test]
    fn test_no_modes_allows() {
        let gate = AuthorizationGate::from_config(&AuthorizationConfig {
            enable: true,
            debug: false,
            modes: vec![],
        });
        let decision = gate.evaluate(&NodeId::new("edge-1"), &NodeId::new("edge-2"));
        assert_eq!(decision, Decision::Allow);
    }
}
