//! Shared controller context

use super::table::Reconciler;
use crate::cluster::ClusterApi;
use crate::config::OperatorConfig;
use std::time::Duration;

/// Shared context handed to every reconciliation.
pub struct Context<C> {
    pub reconciler: Reconciler<C>,
    /// Delay before a failed reconciliation is retried.
    pub error_requeue: Duration,
}

impl<C: ClusterApi> Context<C> {
    pub fn new(cluster: C, config: &OperatorConfig) -> Self {
        Self {
            reconciler: Reconciler::new(cluster, config.synthesis()),
            error_requeue: config.error_requeue,
        }
    }
}
