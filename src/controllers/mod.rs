//! Reconciliation controllers
//!
//! PackageVariantSets unroll into PackageVariants; PackageVariants keep
//! downstream package revisions current. Both run as work-queue
//! controllers over the in-memory [`ClusterStore`] and talk to the package
//! API in-process.

pub mod cluster;
pub mod packagevariant;
pub mod runtime;
pub mod variantset;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::Porch;
use crate::config::ControllerConfig;
use crate::retry::Backoff;
use cluster::ClusterStore;
use packagevariant::DownstreamReconciler;
use runtime::Controller;
use variantset::VariantSetReconciler;

/// Start both controllers; they stop when `shutdown` flips to true
pub fn spawn(
    porch: &Arc<Porch>,
    cluster: &Arc<ClusterStore>,
    config: &ControllerConfig,
    backoff: &Backoff,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let variants = Controller::new(
        Arc::new(DownstreamReconciler::new(Arc::clone(porch), Arc::clone(cluster))),
        config,
        backoff.clone(),
    );
    let sets = Controller::new(
        Arc::new(VariantSetReconciler::new(Arc::clone(porch), Arc::clone(cluster))),
        config,
        backoff.clone(),
    );
    vec![
        tokio::spawn(variants.run(cluster.subscribe(), shutdown.clone())),
        tokio::spawn(sets.run(cluster.subscribe(), shutdown.clone())),
    ]
}
