//! Topology epoch and the coloring that goes with it.
//!
//! Every topology change bumps the epoch. The installed configuration
//! remembers the epoch it was computed for, so it is stale exactly when the
//! two differ. Sessions watch the epoch and restart when it moves.

use crate::coloring::{compute_coloring, Coloring};
use crate::error::Result;
use crate::fabric::{TopologyEvent, TopologySnapshot};
use crate::rules::{InstallReport, RuleInstaller};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, instrument, warn};

/// Coloring and rule installation computed for one topology epoch.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    pub epoch: u64,
    pub coloring: Coloring,
    pub install: InstallReport,
}

pub struct ConfigRegistry {
    epoch: watch::Sender<u64>,
    current: RwLock<Option<Arc<TopologyConfig>>>,
    /// Serializes recomputation so concurrent callers install rules once.
    recompute: Mutex<()>,
    recomputations: AtomicU64,
    install_failures: AtomicU64,
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConfigRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigRegistry")
            .field("epoch", &self.epoch())
            .field("configured_epoch", &self.configured_epoch())
            .field("recomputations", &self.recomputations())
            .finish()
    }
}

impl ConfigRegistry {
    /// Starts stale: nothing has been computed yet.
    pub fn new() -> Self {
        let (epoch, _) = watch::channel(1);
        Self {
            epoch,
            current: RwLock::new(None),
            recompute: Mutex::new(()),
            recomputations: AtomicU64::new(0),
            install_failures: AtomicU64::new(0),
        }
    }

    pub fn epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    /// Receiver that wakes on every epoch change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    /// Marks the configuration stale and wakes every watcher. Returns the new
    /// epoch.
    pub fn topology_changed(&self) -> u64 {
        let mut next = 0;
        self.epoch.send_modify(|epoch| {
            *epoch += 1;
            next = *epoch;
        });
        debug!(epoch = next, "Topology epoch advanced");
        next
    }

    pub fn current(&self) -> Option<Arc<TopologyConfig>> {
        self.current.read().clone()
    }

    pub fn configured_epoch(&self) -> Option<u64> {
        self.current.read().as_ref().map(|config| config.epoch)
    }

    pub fn is_stale(&self) -> bool {
        self.configured_epoch() != Some(self.epoch())
    }

    pub fn recomputations(&self) -> u64 {
        self.recomputations.load(Ordering::Relaxed)
    }

    /// Switches whose rule programming failed, summed over recomputations.
    pub fn install_failures(&self) -> u64 {
        self.install_failures.load(Ordering::Relaxed)
    }

    /// Returns the configuration for the current epoch, recoloring and
    /// reprogramming the fabric first if it is stale.
    ///
    /// Rule failures on individual switches do not fail the call; the
    /// configuration is stored anyway. A coloring failure leaves the registry
    /// stale and is returned.
    #[instrument(skip_all)]
    pub async fn ensure_current(
        &self,
        topology: &dyn TopologySnapshot,
        installer: &RuleInstaller,
    ) -> Result<Arc<TopologyConfig>> {
        let _guard = self.recompute.lock().await;

        let epoch = self.epoch();
        if let Some(config) = self.current() {
            if config.epoch == epoch {
                return Ok(config);
            }
        }

        info!(epoch, "Recomputing fabric coloring");
        let coloring = compute_coloring(topology)?;
        for (switch, color) in coloring.iter() {
            debug!(%switch, color = color.get(), "Switch colored");
        }
        if !coloring.is_proper(topology) {
            warn!(epoch, "Coloring does not fit the live topology, it changed meanwhile");
        }
        let install = installer.install_all(topology, &coloring).await;

        self.recomputations.fetch_add(1, Ordering::Relaxed);
        if !install.is_clean() {
            self.install_failures
                .fetch_add(install.failures.len() as u64, Ordering::Relaxed);
            warn!(
                failed = install.failures.len(),
                "Some switches were not programmed; traces through them will be cut short"
            );
        }

        // Tagged with the epoch read before coloring: a change that landed
        // meanwhile leaves this config stale.
        let config = Arc::new(TopologyConfig {
            epoch,
            coloring,
            install,
        });
        *self.current.write() = Some(config.clone());
        Ok(config)
    }

    /// Advances the epoch for every topology event until the stream ends.
    pub async fn watch_topology(self: Arc<Self>, mut events: mpsc::Receiver<TopologyEvent>) {
        while let Some(event) = events.recv().await {
            debug!(?event, "Topology event");
            self.topology_changed();
        }
        info!("Topology event stream closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{FabricDescription, LabFabric};
    use pretty_assertions::assert_eq;
    use sonic_fabric_types::{Hop, Link, PortId, SwitchId};

    fn hop(sw: u64, port: u16) -> Hop {
        Hop::new(SwitchId::new(sw), PortId::new(port))
    }

    fn pair() -> FabricDescription {
        FabricDescription {
            switches: vec![SwitchId::new(1), SwitchId::new(2)],
            links: vec![Link::new(hop(1, 1), hop(2, 1))],
            ..Default::default()
        }
    }

    #[test]
    fn test_starts_stale() {
        let registry = ConfigRegistry::new();
        assert!(registry.is_stale());
        assert_eq!(registry.epoch(), 1);
        assert_eq!(registry.configured_epoch(), None);
    }

    #[tokio::test]
    async fn test_ensure_current_recomputes_once() {
        let (fabric, _, _) = LabFabric::new(pair(), 8);
        let installer = RuleInstaller::new(fabric.clone());
        let registry = ConfigRegistry::new();

        let first = registry.ensure_current(fabric.as_ref(), &installer).await.unwrap();
        assert!(!registry.is_stale());
        assert!(first.coloring.is_proper(fabric.as_ref()));
        let second = registry.ensure_current(fabric.as_ref(), &installer).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.recomputations(), 1);

        registry.topology_changed();
        assert!(registry.is_stale());
        let third = registry.ensure_current(fabric.as_ref(), &installer).await.unwrap();
        assert_eq!(third.epoch, 2);
        assert_eq!(registry.recomputations(), 2);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let registry = ConfigRegistry::new();
        let mut rx = registry.subscribe();

        assert_eq!(registry.topology_changed(), 2);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 2);
    }

    #[tokio::test]
    async fn test_rule_failures_still_store_config() {
        let (fabric, _, _) = LabFabric::new(pair(), 8);
        fabric.set_control_down(SwitchId::new(2), true);
        let installer = RuleInstaller::new(fabric.clone());
        let registry = ConfigRegistry::new();

        let config = registry.ensure_current(fabric.as_ref(), &installer).await.unwrap();
        assert!(!registry.is_stale());
        assert_eq!(config.install.failures.len(), 1);
        assert_eq!(registry.install_failures(), 1);
    }

    #[tokio::test]
    async fn test_coloring_failure_leaves_registry_stale() {
        let mut description = FabricDescription {
            switches: (1..=8).map(SwitchId::new).collect(),
            ..Default::default()
        };
        for a in 1..=8u64 {
            for b in (a + 1)..=8 {
                description
                    .links
                    .push(Link::new(hop(a, b as u16), hop(b, a as u16)));
            }
        }
        let (fabric, _, _) = LabFabric::new(description, 8);
        let installer = RuleInstaller::new(fabric.clone());
        let registry = ConfigRegistry::new();

        assert!(registry.ensure_current(fabric.as_ref(), &installer).await.is_err());
        assert!(registry.is_stale());
        assert_eq!(registry.recomputations(), 0);
    }

    #[tokio::test]
    async fn test_watch_topology_bumps_epoch() {
        let (fabric, _, events) = LabFabric::new(pair(), 8);
        let registry = Arc::new(ConfigRegistry::new());
        let mut rx = registry.subscribe();
        let watcher = tokio::spawn(registry.clone().watch_topology(events));

        fabric.remove_link(Link::new(hop(1, 1), hop(2, 1)));
        rx.changed().await.unwrap();
        assert_eq!(registry.epoch(), 2);

        drop(fabric);
        watcher.await.unwrap();
    }
}
