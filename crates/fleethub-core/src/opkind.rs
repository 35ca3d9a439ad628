//! The enumerable set of operation kinds the gateway dispatches.
//!
//! Every inbound edge message is classified into exactly one `OpKind`, and
//! each kind owns its own bounded queue and worker pool. Anything outside
//! this set is rejected by the router rather than routed to a default queue.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Operation kind of an edge message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    UpdatePodStatus,
    CreatePod,
    PatchPod,
    DeletePod,
    UpdateNodeStatus,
    CreateNode,
    PatchNode,
    UpdateNode,
    QueryNode,
    QueryConfigMap,
    QuerySecret,
    QueryPersistentVolume,
    QueryPersistentVolumeClaim,
    QueryVolumeAttachment,
    CreateLease,
    QueryLease,
    ServiceAccountToken,
    CertificateSigningRequest,
    UpdateRuleStatus,
    UpdateDeviceTwins,
    UpdateDeviceStates,
    TaskStatus,
}

/// Queue capacity and worker-pool size for one operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTuning {
    /// Bounded queue capacity (pending work items).
    pub capacity: usize,

    /// Fixed worker-pool size.
    pub workers: usize,
}

impl OpKind {
    /// All operation kinds, in dispatch-table order.
    pub const ALL: [OpKind; 22] = [
        OpKind::UpdatePodStatus,
        OpKind::CreatePod,
        OpKind::PatchPod,
        OpKind::DeletePod,
        OpKind::UpdateNodeStatus,
        OpKind::CreateNode,
        OpKind::PatchNode,
        OpKind::UpdateNode,
        OpKind::QueryNode,
        OpKind::QueryConfigMap,
        OpKind::QuerySecret,
        OpKind::QueryPersistentVolume,
        OpKind::QueryPersistentVolumeClaim,
        OpKind::QueryVolumeAttachment,
        OpKind::CreateLease,
        OpKind::QueryLease,
        OpKind::ServiceAccountToken,
        OpKind::CertificateSigningRequest,
        OpKind::UpdateRuleStatus,
        OpKind::UpdateDeviceTwins,
        OpKind::UpdateDeviceStates,
        OpKind::TaskStatus,
    ];

    /// Wire name of this kind (the `op` field of an edge message).
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::UpdatePodStatus => "update_pod_status",
            OpKind::CreatePod => "create_pod",
            OpKind::PatchPod => "patch_pod",
            OpKind::DeletePod => "delete_pod",
            OpKind::UpdateNodeStatus => "update_node_status",
            OpKind::CreateNode => "create_node",
            OpKind::PatchNode => "patch_node",
            OpKind::UpdateNode => "update_node",
            OpKind::QueryNode => "query_node",
            OpKind::QueryConfigMap => "query_config_map",
            OpKind::QuerySecret => "query_secret",
            OpKind::QueryPersistentVolume => "query_persistent_volume",
            OpKind::QueryPersistentVolumeClaim => "query_persistent_volume_claim",
            OpKind::QueryVolumeAttachment => "query_volume_attachment",
            OpKind::CreateLease => "create_lease",
            OpKind::QueryLease => "query_lease",
            OpKind::ServiceAccountToken => "service_account_token",
            OpKind::CertificateSigningRequest => "certificate_signing_request",
            OpKind::UpdateRuleStatus => "update_rule_status",
            OpKind::UpdateDeviceTwins => "update_device_twins",
            OpKind::UpdateDeviceStates => "update_device_states",
            OpKind::TaskStatus => "task_status",
        }
    }

    /// Parse a wire name into an OpKind.
    ///
    /// Unknown names are a protocol-skew error, never mapped to a default.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CoreError::UnknownOpKind(s.to_string()))
    }

    /// Returns true if processing this kind produces a response body the
    /// originating node is waiting for (query-style operations).
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            OpKind::QueryNode
                | OpKind::QueryConfigMap
                | OpKind::QuerySecret
                | OpKind::QueryPersistentVolume
                | OpKind::QueryPersistentVolumeClaim
                | OpKind::QueryVolumeAttachment
                | OpKind::QueryLease
                | OpKind::ServiceAccountToken
                | OpKind::CertificateSigningRequest
        )
    }

    /// Default queue capacity and worker-pool size for this kind.
    ///
    /// High-volume ordered streams (pod status, node status, device state,
    /// task status) run a single worker; everything else gets a pool of 4.
    pub fn default_tuning(&self) -> QueueTuning {
        let workers = match self {
            OpKind::UpdatePodStatus
            | OpKind::UpdateNodeStatus
            | OpKind::UpdateDeviceTwins
            | OpKind::UpdateDeviceStates
            | OpKind::TaskStatus => 1,
            _ => 4,
        };
        QueueTuning {
            capacity: 1024,
            workers,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trips_every_kind() {
        for kind in OpKind::ALL {
            assert_eq!(OpKind::parse(kind.as_str()).unwrap(), kind);
        }
    }

    #[test]
    fn test_parse_rejects_unknown() {
        let err = OpKind::parse("reboot_universe").unwrap_err();
        assert!(matches!(err, CoreError::UnknownOpKind(_)));
    }

    #[test]
    fn test_status_streams_are_single_worker() {
        assert_eq!(OpKind::UpdatePodStatus.default_tuning().workers, 1);
        assert_eq!(OpKind::TaskStatus.default_tuning().workers, 1);
        assert_eq!(OpKind::QueryConfigMap.default_tuning().workers, 4);
    }

    #[test]
    fn test_queries_are_marked() {
        assert!(OpKind::QueryLease.is_query());
        assert!(!OpKind::UpdatePodStatus.is_query());
    }
}
