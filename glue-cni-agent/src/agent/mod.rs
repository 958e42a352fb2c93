use std::sync::Arc;

use glue_cni_common::NetworkTopology;
use tokio::sync::mpsc::Receiver;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::ReconcileMetrics;
use crate::reconcile::{FilterOps, LinkOps, PassOutcome, Reconciler, RuleOps, TeardownReport};
use crate::topology::{Fence, Message, VersionedTopology};
use crate::{Error, Result};

/// Owns the reconciler. Topologies are applied one at a time in the order
/// received and teardown runs once when the loop ends.
pub struct Agent<K> {
    reconciler: Arc<Reconciler<K>>,
    rx: Receiver<Message>,
    fence: Fence,
    ready: CancellationToken,
    metrics: ReconcileMetrics,
}

impl<K> Agent<K>
where
    K: LinkOps + RuleOps + FilterOps + Send + Sync + 'static,
{
    pub fn new(
        reconciler: Reconciler<K>,
        rx: Receiver<Message>,
        fence: Fence,
        ready: CancellationToken,
        metrics: ReconcileMetrics,
    ) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            rx,
            fence,
            ready,
            metrics,
        }
    }

    /// Runs until a shutdown is requested or every publisher is gone.
    pub async fn run(mut self) -> Result<TeardownReport> {
        let mut attempted: Option<NetworkTopology> = None;
        let reason = loop {
            match self.rx.recv().await {
                Some(Message::Topology(versioned)) => {
                    if !self.fence.is_current(versioned.generation) {
                        debug!(
                            generation = versioned.generation,
                            latest = self.fence.latest(),
                            "skipping stale topology"
                        );
                        continue;
                    }
                    attempted = Some(versioned.topology.clone());
                    self.apply(versioned).await;
                }
                Some(Message::Shutdown(reason)) => break reason,
                None => break "all topology publishers closed",
            }
        };

        info!(reason, "tearing down");
        let reconciler = self.reconciler.clone();
        let report = spawn_blocking(move || reconciler.teardown(attempted.as_ref()))
            .await
            .map_err(|e| Error::Task(e.to_string()))?;
        self.metrics.count_teardown(&report);
        report.log();
        Ok(report)
    }

    /// Runs one pass. Nothing here ends the loop: a pass that fails or never
    /// completes leaves the agent waiting for the next topology.
    async fn apply(&self, versioned: VersionedTopology) {
        let generation = versioned.generation;
        let node_cidr = versioned.topology.node_cidr;
        let reconciler = self.reconciler.clone();
        let joined = {
            let _measure = self.metrics.measure();
            spawn_blocking(move || reconciler.reconcile(&versioned)).await
        };
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(generation, %node_cidr, %e, "reconcile task did not complete");
                self.metrics.count_task_failure();
                return;
            }
        };
        self.metrics.count_pass(generation, &outcome);

        match &outcome {
            PassOutcome::Applied => {
                info!(generation, %node_cidr, "topology applied");
                self.ready.cancel();
            }
            PassOutcome::Failed { step, error } => {
                error!(generation, %node_cidr, %step, %error, "reconcile failed");
            }
            PassOutcome::Superseded { latest, .. } => {
                warn!(generation, latest, "reconcile superseded");
            }
        }
    }
}
