//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use fleethub_core::OpKind;

use crate::registry::SessionRegistry;

/// Process-wide gateway counters and gauges.
pub struct Metrics {
    /// Work items processed to success.
    pub items_processed: AtomicU64,

    /// Work items that exhausted retries.
    pub items_failed: AtomicU64,

    /// Collaborator retries attempted.
    pub items_retried: AtomicU64,

    /// Messages refused by the router (unknown kind or full queue).
    pub messages_rejected: AtomicU64,

    /// Authorization denials delivered to callers.
    pub auth_denied: AtomicU64,

    /// Live depth of each dispatch queue.
    queue_depths: HashMap<OpKind, AtomicUsize>,
}

impl Metrics {
    /// Create the metrics registry with a depth gauge per operation kind.
    pub fn new() -> Arc<Self> {
        let queue_depths = OpKind::ALL
            .iter()
            .map(|kind| (*kind, AtomicUsize::new(0)))
            .collect();

        Arc::new(Self {
            items_processed: AtomicU64::new(0),
            items_failed: AtomicU64::new(0),
            items_retried: AtomicU64::new(0),
            messages_rejected: AtomicU64::new(0),
            auth_denied: AtomicU64::new(0),
            queue_depths,
        })
    }

    /// Record an item entering a queue.
    pub fn inc_depth(&self, kind: OpKind) {
        if let Some(depth) = self.queue_depths.get(&kind) {
            depth.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an item leaving a queue.
    pub fn dec_depth(&self, kind: OpKind) {
        if let Some(depth) = self.queue_depths.get(&kind) {
            depth.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Current depth of one queue.
    pub fn depth(&self, kind: OpKind) -> usize {
        self.queue_depths
            .get(&kind)
            .map(|d| d.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// Collect all gateway metrics and format as Prometheus text.
pub async fn collect_metrics(registry: &Arc<SessionRegistry>, metrics: &Arc<Metrics>) -> String {
    let mut output = String::new();

    collect_session_metrics(registry, &mut output).await;
    collect_dispatch_metrics(metrics, &mut output);

    output
}

/// Session gauges by transport, plus the node-limit ceiling.
async fn collect_session_metrics(registry: &Arc<SessionRegistry>, output: &mut String) {
    let by_transport = registry.count_by_transport().await;
    let total = registry.live_count().await;

    writeln!(
        output,
        "# HELP fleethub_sessions Number of live edge sessions by transport"
    )
    .ok();
    writeln!(output, "# TYPE fleethub_sessions gauge").ok();
    for kind in [
        fleethub_core::TransportKind::WebSocket,
        fleethub_core::TransportKind::Quic,
        fleethub_core::TransportKind::Unix,
        fleethub_core::TransportKind::Https,
    ] {
        let count = by_transport.get(&kind).copied().unwrap_or(0);
        writeln!(
            output,
            "fleethub_sessions{{transport=\"{}\"}} {count}",
            kind.as_str()
        )
        .ok();
    }

    writeln!(output).ok();
    writeln!(output, "# HELP fleethub_sessions_total Total live edge sessions").ok();
    writeln!(output, "# TYPE fleethub_sessions_total gauge").ok();
    writeln!(output, "fleethub_sessions_total {total}").ok();

    writeln!(output).ok();
    writeln!(output, "# HELP fleethub_node_limit Configured session ceiling").ok();
    writeln!(output, "# TYPE fleethub_node_limit gauge").ok();
    writeln!(output, "fleethub_node_limit {}", registry.node_limit()).ok();
}

/// Queue depths and work-item counters.
fn collect_dispatch_metrics(metrics: &Arc<Metrics>, output: &mut String) {
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP fleethub_queue_depth Pending work items per dispatch queue"
    )
    .ok();
    writeln!(output, "# TYPE fleethub_queue_depth gauge").ok();
    for kind in OpKind::ALL {
        writeln!(
            output,
            "fleethub_queue_depth{{op=\"{}\"}} {}",
            kind.as_str(),
            metrics.depth(kind)
        )
        .ok();
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP fleethub_work_items_total Work items by terminal result"
    )
    .ok();
    writeln!(output, "# TYPE fleethub_work_items_total counter").ok();
    writeln!(
        output,
        "fleethub_work_items_total{{result=\"processed\"}} {}",
        metrics.items_processed.load(Ordering::Relaxed)
    )
    .ok();
    writeln!(
        output,
        "fleethub_work_items_total{{result=\"failed\"}} {}",
        metrics.items_failed.load(Ordering::Relaxed)
    )
    .ok();
    writeln!(
        output,
        "fleethub_work_items_total{{result=\"retried\"}} {}",
        metrics.items_retried.load(Ordering::Relaxed)
    )
    .ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP fleethub_messages_rejected_total Messages refused by the router"
    )
    .ok();
    writeln!(output, "# TYPE fleethub_messages_rejected_total counter").ok();
    writeln!(
        output,
        "fleethub_messages_rejected_total {}",
        metrics.messages_rejected.load(Ordering::Relaxed)
    )
    .ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP fleethub_authorization_denied_total Denials delivered to callers"
    )
    .ok();
    writeln!(output, "# TYPE fleethub_authorization_denied_total counter").ok();
    writeln!(
        output,
        "fleethub_authorization_denied_total {}",
        metrics.auth_denied.load(Ordering::Relaxed)
    )
    .ok();
}
