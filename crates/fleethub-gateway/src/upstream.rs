//! Cluster-manager client boundary.
//!
//! Workers call these per-resource operations synchronously per work item.
//! The real deployment points this trait at the cluster manager; the
//! in-memory implementation backs tests and standalone operation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;

use fleethub_core::{NodeId, OpKind};

use crate::crypto::EdgeCa;
use crate::dispatch::{WorkItem, WorkProcessor};

/// Errors returned by the cluster manager.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Transient unavailability; workers retry these.
    #[error("cluster manager unavailable: {0}")]
    Unavailable(String),

    /// Requested resource does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Payload is structurally unusable for the operation.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Certificate signing failed.
    #[error("certificate signing failed: {0}")]
    Signing(String),
}

/// Per-resource operations on the cluster manager.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn update_pod_status(&self, node: &NodeId, payload: Value) -> Result<(), ClusterError>;
    async fn create_pod(&self, node: &NodeId, payload: Value) -> Result<(), ClusterError>;
    async fn patch_pod(&self, node: &NodeId, payload: Value) -> Result<(), ClusterError>;
    async fn delete_pod(&self, node: &NodeId, payload: Value) -> Result<(), ClusterError>;

    async fn update_node_status(&self, node: &NodeId, payload: Value) -> Result<(), ClusterError>;
    async fn create_node(&self, node: &NodeId, payload: Value) -> Result<(), ClusterError>;
    async fn patch_node(&self, node: &NodeId, payload: Value) -> Result<(), ClusterError>;
    async fn update_node(&self, node: &NodeId, payload: Value) -> Result<(), ClusterError>;
    async fn query_node(&self, node: &NodeId, payload: Value) -> Result<Value, ClusterError>;

    async fn query_config_map(&self, node: &NodeId, payload: Value) -> Result<Value, ClusterError>;
    async fn query_secret(&self, node: &NodeId, payload: Value) -> Result<Value, ClusterError>;

    async fn query_persistent_volume(
        &self,
        node: &NodeId,
        payload: Value,
    ) -> Result<Value, ClusterError>;
    async fn query_persistent_volume_claim(
        &self,
        node: &NodeId,
        payload: Value,
    ) -> Result<Value, ClusterError>;
    async fn query_volume_attachment(
        &self,
        node: &NodeId,
        payload: Value,
    ) -> Result<Value, ClusterError>;

    async fn create_lease(&self, node: &NodeId, payload: Value) -> Result<(), ClusterError>;
    async fn query_lease(&self, node: &NodeId, payload: Value) -> Result<Value, ClusterError>;

    async fn service_account_token(
        &self,
        node: &NodeId,
        payload: Value,
    ) -> Result<Value, ClusterError>;
    async fn sign_certificate(&self, node: &NodeId, payload: Value) -> Result<Value, ClusterError>;

    async fn update_rule_status(&self, node: &NodeId, payload: Value) -> Result<(), ClusterError>;
    async fn update_device_twins(&self, node: &NodeId, payload: Value) -> Result<(), ClusterError>;
    async fn update_device_states(&self, node: &NodeId, payload: Value)
        -> Result<(), ClusterError>;
    async fn report_task_status(&self, node: &NodeId, payload: Value) -> Result<(), ClusterError>;
}

/// Adapts the client to the dispatch worker interface: one match arm per
/// operation kind, mutations return no body, queries return one.
pub struct ClusterProcessor {
    client: Arc<dyn ClusterClient>,
}

impl ClusterProcessor {
    pub fn new(client: Arc<dyn ClusterClient>) -> Arc<Self> {
        Arc::new(Self { client })
    }
}

#[async_trait]
impl WorkProcessor for ClusterProcessor {
    async fn process(&self, item: &WorkItem) -> Result<Option<Value>, ClusterError> {
        let node = &item.node;
        let payload = item.payload.clone();
        let client = self.client.as_ref();

        match item.kind {
            OpKind::UpdatePodStatus => client.update_pod_status(node, payload).await.map(|_| None),
            OpKind::CreatePod => client.create_pod(node, payload).await.map(|_| None),
            OpKind::PatchPod => client.patch_pod(node, payload).await.map(|_| None),
            OpKind::DeletePod => client.delete_pod(node, payload).await.map(|_| None),
            OpKind::UpdateNodeStatus => {
                client.update_node_status(node, payload).await.map(|_| None)
            }
            OpKind::CreateNode => client.create_node(node, payload).await.map(|_| None),
            OpKind::PatchNode => client.patch_node(node, payload).await.map(|_| None),
            OpKind::UpdateNode => client.update_node(node, payload).await.map(|_| None),
            OpKind::QueryNode => client.query_node(node, payload).await.map(Some),
            OpKind::QueryConfigMap => client.query_config_map(node, payload).await.map(Some),
            OpKind::QuerySecret => client.query_secret(node, payload).await.map(Some),
            OpKind::QueryPersistentVolume => {
                client.query_persistent_volume(node, payload).await.map(Some)
            }
            OpKind::QueryPersistentVolumeClaim => client
                .query_persistent_volume_claim(node, payload)
                .await
                .map(Some),
            OpKind::QueryVolumeAttachment => {
                client.query_volume_attachment(node, payload).await.map(Some)
            }
            OpKind::CreateLease => client.create_lease(node, payload).await.map(|_| None),
            OpKind::QueryLease => client.query_lease(node, payload).await.map(Some),
            OpKind::ServiceAccountToken => {
                client.service_account_token(node, payload).await.map(Some)
            }
            OpKind::CertificateSigningRequest => {
                client.sign_certificate(node, payload).await.map(Some)
            }
            OpKind::UpdateRuleStatus => client.update_rule_status(node, payload).await.map(|_| None),
            OpKind::UpdateDeviceTwins => {
                client.update_device_twins(node, payload).await.map(|_| None)
            }
            OpKind::UpdateDeviceStates => {
                client.update_device_states(node, payload).await.map(|_| None)
            }
            OpKind::TaskStatus => client.report_task_status(node, payload).await.map(|_| None),
        }
    }
}

/// Extract the resource name a payload refers to.
fn payload_name(payload: &Value) -> Result<String, ClusterError> {
    payload
        .get("name")
        .and_then(Value::as_str)
        .or_else(|| {
            payload
                .get("metadata")
                .and_then(|m| m.get("name"))
                .and_then(Value::as_str)
        })
        .map(|s| s.to_string())
        .ok_or_else(|| ClusterError::InvalidPayload("missing resource name".to_string()))
}

/// In-memory cluster state, keyed by resource name.
#[derive(Default)]
struct ClusterStore {
    pods: HashMap<String, Value>,
    nodes: HashMap<String, Value>,
    leases: HashMap<String, Value>,
    config_maps: HashMap<String, Value>,
    secrets: HashMap<String, Value>,
    volumes: HashMap<String, Value>,
    rule_statuses: HashMap<String, Value>,
    device_twins: HashMap<String, Value>,
    device_states: HashMap<String, Value>,
    task_statuses: HashMap<String, Value>,
}

/// Cluster client backed by in-process maps.
pub struct InMemoryCluster {
    store: RwLock<ClusterStore>,

    /// CA backing certificate-signing requests, when configured.
    ca: Option<Arc<EdgeCa>>,
}

impl InMemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            store: RwLock::new(ClusterStore::default()),
            ca: None,
        })
    }

    pub fn with_ca(ca: Arc<EdgeCa>) -> Arc<Self> {
        Arc::new(Self {
            store: RwLock::new(ClusterStore::default()),
            ca: Some(ca),
        })
    }

    /// Seed a config map for tests and standalone operation.
    pub async fn insert_config_map(&self, name: impl Into<String>, value: Value) {
        self.store.write().await.config_maps.insert(name.into(), value);
    }

    /// Seed a secret.
    pub async fn insert_secret(&self, name: impl Into<String>, value: Value) {
        self.store.write().await.secrets.insert(name.into(), value);
    }

    /// Number of stored leases.
    pub async fn lease_count(&self) -> usize {
        self.store.read().await.leases.len()
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn update_pod_status(&self, _node: &NodeId, payload: Value) -> Result<(), ClusterError> {
        let name = payload_name(&payload)?;
        self.store.write().await.pods.insert(name, payload);
        Ok(())
    }

    async fn create_pod(&self, _node: &NodeId, payload: Value) -> Result<(), ClusterError> {
        let name = payload_name(&payload)?;
        self.store.write().await.pods.insert(name, payload);
        Ok(())
    }

    async fn patch_pod(&self, _node: &NodeId, payload: Value) -> Result<(), ClusterError> {
        let name = payload_name(&payload)?;
        let mut store = self.store.write().await;
        match store.pods.get_mut(&name) {
            Some(existing) => {
                *existing = payload;
                Ok(())
            }
            None => Err(ClusterError::NotFound(name)),
        }
    }

    async fn delete_pod(&self, _node: &NodeId, payload: Value) -> Result<(), ClusterError> {
        let name = payload_name(&payload)?;
        self.store.write().await.pods.remove(&name);
        Ok(())
    }

    async fn update_node_status(&self, node: &NodeId, payload: Value) -> Result<(), ClusterError> {
        self.store
            .write()
            .await
            .nodes
            .insert(node.as_str().to_string(), payload);
        Ok(())
    }

    async fn create_node(&self, node: &NodeId, payload: Value) -> Result<(), ClusterError> {
        self.store
            .write()
            .await
            .nodes
            .insert(node.as_str().to_string(), payload);
        Ok(())
    }

    async fn patch_node(&self, node: &NodeId, payload: Value) -> Result<(), ClusterError> {
        let mut store = self.store.write().await;
        match store.nodes.get_mut(node.as_str()) {
            Some(existing) => {
                *existing = payload;
                Ok(())
            }
            None => Err(ClusterError::NotFound(node.to_string())),
        }
    }

    async fn update_node(&self, node: &NodeId, payload: Value) -> Result<(), ClusterError> {
        self.store
            .write()
            .await
            .nodes
            .insert(node.as_str().to_string(), payload);
        Ok(())
    }

    async fn query_node(&self, node: &NodeId, _payload: Value) -> Result<Value, ClusterError> {
        self.store
            .read()
            .await
            .nodes
            .get(node.as_str())
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(node.to_string()))
    }

    async fn query_config_map(&self, _node: &NodeId, payload: Value) -> Result<Value, ClusterError> {
        let name = payload_name(&payload)?;
        self.store
            .read()
            .await
            .config_maps
            .get(&name)
            .cloned()
            .ok_or(ClusterError::NotFound(name))
    }

    async fn query_secret(&self, _node: &NodeId, payload: Value) -> Result<Value, ClusterError> {
        let name = payload_name(&payload)?;
        self.store
            .read()
            .await
            .secrets
            .get(&name)
            .cloned()
            .ok_or(ClusterError::NotFound(name))
    }

    async fn query_persistent_volume(
        &self,
        _node: &NodeId,
        payload: Value,
    ) -> Result<Value, ClusterError> {
        let name = payload_name(&payload)?;
        self.store
            .read()
            .await
            .volumes
            .get(&name)
            .cloned()
            .ok_or(ClusterError::NotFound(name))
    }

    async fn query_persistent_volume_claim(
        &self,
        node: &NodeId,
        payload: Value,
    ) -> Result<Value, ClusterError> {
        self.query_persistent_volume(node, payload).await
    }

    async fn query_volume_attachment(
        &self,
        node: &NodeId,
        payload: Value,
    ) -> Result<Value, ClusterError> {
        self.query_persistent_volume(node, payload).await
    }

    async fn create_lease(&self, node: &NodeId, payload: Value) -> Result<(), ClusterError> {
        let name = payload_name(&payload).unwrap_or_else(|_| node.as_str().to_string());
        self.store.write().await.leases.insert(name, payload);
        Ok(())
    }

    async fn query_lease(&self, node: &NodeId, payload: Value) -> Result<Value, ClusterError> {
        let name = payload_name(&payload).unwrap_or_else(|_| node.as_str().to_string());
        self.store
            .read()
            .await
            .leases
            .get(&name)
            .cloned()
            .ok_or(ClusterError::NotFound(name))
    }

    async fn service_account_token(
        &self,
        node: &NodeId,
        payload: Value,
    ) -> Result<Value, ClusterError> {
        let name = payload_name(&payload)?;
        // Opaque token; real deployments mint these cluster-side.
        let token = uuid::Uuid::new_v4().to_string();
        Ok(json!({
            "name": name,
            "node": node.as_str(),
            "token": token,
        }))
    }

    async fn sign_certificate(&self, node: &NodeId, payload: Value) -> Result<Value, ClusterError> {
        let ca = self
            .ca
            .as_ref()
            .ok_or_else(|| ClusterError::Unavailable("no signing CA configured".to_string()))?;

        let csr_pem = payload
            .get("csr")
            .and_then(Value::as_str)
            .ok_or_else(|| ClusterError::InvalidPayload("missing csr".to_string()))?;

        let signed = ca
            .sign_csr(csr_pem)
            .map_err(|e| ClusterError::Signing(e.to_string()))?;

        Ok(json!({
            "node": node.as_str(),
            "cert_pem": signed.cert_pem,
            "key_pem": signed.key_pem,
            "expires_at": signed.expires_at.to_rfc3339(),
        }))
    }

    async fn update_rule_status(&self, _node: &NodeId, payload: Value) -> Result<(), ClusterError> {
        let name = payload_name(&payload)?;
        self.store.write().await.rule_statuses.insert(name, payload);
        Ok(())
    }

    async fn update_device_twins(&self, _node: &NodeId, payload: Value) -> Result<(), ClusterError> {
        let name = payload_name(&payload)?;
        self.store.write().await.device_twins.insert(name, payload);
        Ok(())
    }

    async fn update_device_states(
        &self,
        _node: &NodeId,
        payload: Value,
    ) -> Result<(), ClusterError> {
        let name = payload_name(&payload)?;
        self.store.write().await.device_states.insert(name, payload);
        Ok(())
    }

    async fn report_task_status(&self, node: &NodeId, payload: Value) -> Result<(), ClusterError> {
        let name = payload_name(&payload).unwrap_or_else(|_| node.as_str().to_string());
        self.store.write().await.task_statuses.insert(name, payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleethub_core::MessageId;

    fn work_item(node: &str, kind: OpKind, payload: Value) -> WorkItem {
        WorkItem {
            node: NodeId::new(node),
            kind,
            message_id: MessageId::generate(),
            payload,
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_query_config_map_round_trip() {
        let cluster = InMemoryCluster::new();
        cluster
            .insert_config_map("app-config", json!({"name": "app-config", "data": {"k": "v"}}))
            .await;

        let processor = ClusterProcessor::new(cluster);
        let body = processor
            .process(&work_item(
                "edge-1",
                OpKind::QueryConfigMap,
                json!({"name": "app-config"}),
            ))
            .await
            .unwrap();

        assert_eq!(body.unwrap()["data"]["k"], "v");
    }

    #[tokio::test]
    async fn test_query_missing_secret_is_not_found() {
        let cluster = InMemoryCluster::new();
        let err = cluster
            .query_secret(&NodeId::new("edge-1"), json!({"name": "nope"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_lease_create_then_query() {
        let cluster = InMemoryCluster::new();
        let node = NodeId::new("edge-1");

        cluster
            .create_lease(&node, json!({"name": "edge-1", "duration_secs": 40}))
            .await
            .unwrap();
        assert_eq!(cluster.lease_count().await, 1);

        let lease = cluster.query_lease(&node, json!({"name": "edge-1"})).await.unwrap();
        assert_eq!(lease["duration_secs"], 40);
    }

    #[tokio::test]
    async fn test_mutations_return_no_body_queries_do() {
        let cluster = InMemoryCluster::new();
        let processor = ClusterProcessor::new(cluster);

        let body = processor
            .process(&work_item(
                "edge-1",
                OpKind::UpdatePodStatus,
                json!({"name": "nginx", "phase": "Running"}),
            ))
            .await
            .unwrap();
        assert!(body.is_none());

        let body = processor
            .process(&work_item("edge-1", OpKind::QueryNode, json!({})))
            .await;
        // Node never registered: queries surface NotFound.
        assert!(body.is_err());
    }

    #[tokio::test]
    async fn test_payload_without_name_is_invalid() {
        let cluster = InMemoryCluster::new();
        let err = cluster
            .query_config_map(&NodeId::new("edge-1"), json!({"data": {}}))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::InvalidPayload(_)));
    }
}
