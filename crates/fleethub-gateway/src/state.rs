//! Shared gateway state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::auth::AuthorizationGate;
use crate::config::Config;
use crate::crypto::{BootstrapToken, EdgeCa};
use crate::dispatch::Dispatcher;
use crate::metrics::Metrics;
use crate::registry::SessionRegistry;
use crate::router::MessageRouter;
use crate::upstream::{ClusterClient, ClusterProcessor};

/// Shared gateway state, wired once at startup.
pub struct AppState {
    /// Loaded configuration.
    pub config: Config,

    /// Live edge sessions.
    pub registry: Arc<SessionRegistry>,

    /// Classification + dispatch entry point.
    pub router: Arc<MessageRouter>,

    /// Authorization gate.
    pub gate: AuthorizationGate,

    /// Process-wide counters and gauges.
    pub metrics: Arc<Metrics>,

    /// Certificate authority for the bootstrap surface.
    pub ca: Option<Arc<EdgeCa>>,

    /// Bootstrap tokens indexed by token hash.
    pub bootstrap_tokens: RwLock<HashMap<String, BootstrapToken>>,
}

impl AppState {
    /// Wire the state graph: registry, dispatcher, router, gate.
    pub fn new(
        config: Config,
        client: Arc<dyn ClusterClient>,
        ca: Option<Arc<EdgeCa>>,
    ) -> Arc<Self> {
        let metrics = Metrics::new();
        let registry = SessionRegistry::new(
            config.node_limit,
            Duration::from_secs(config.write_timeout_secs),
        );

        let processor = ClusterProcessor::new(client);
        let dispatcher = Arc::new(Dispatcher::start(
            &config.dispatch,
            processor,
            registry.clone(),
            metrics.clone(),
        ));
        let router = MessageRouter::new(dispatcher, metrics.clone());
        let gate = AuthorizationGate::from_config(&config.authorization);

        Arc::new(Self {
            config,
            registry,
            router,
            gate,
            metrics,
            ca,
            bootstrap_tokens: RwLock::new(HashMap::new()),
        })
    }

    /// Register a bootstrap token hash for the certificate-signing endpoint.
    pub async fn add_bootstrap_token(&self, token_hash: String, validity_hours: u64) {
        self.bootstrap_tokens
            .write()
            .await
            .insert(token_hash.clone(), BootstrapToken::new(token_hash, validity_hours));
    }
}
