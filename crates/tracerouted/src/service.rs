//! Trace request handling.
//!
//! [`TraceService`] owns the interception stream. A request holds it for the
//! whole trace, so traces run one at a time and later requests queue in
//! arrival order. Each attempt brings the configuration up to date, runs a
//! [`TraceSession`], and starts over when the topology changes under it.

use crate::config::{ForwardingMode, TraceConfig};
use crate::error::{Result, TraceError};
use crate::fabric::{DeviceInventory, InterceptEvent, SwitchIo, TopologySnapshot};
use crate::injector::ProbeInjector;
use crate::registry::ConfigRegistry;
use crate::rules::RuleInstaller;
use crate::session::{SessionContext, TraceSession, WaitOutcome};
use serde::Serialize;
use sonic_fabric_types::{Color, Hop, ProbePacket};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument};

/// Trace service statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TraceStats {
    pub traces_started: u64,
    pub traces_completed: u64,
    pub traces_failed: u64,
    pub restarts: u64,
    pub hops_recorded: u64,
    pub injection_failures: u64,
    /// Packet-ins that were not colored probes.
    pub ignored_packets: u64,
    /// Leftover packet-ins discarded before a session started.
    pub drained_events: u64,
}

/// Result of one trace request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceReport {
    /// Attachment points first, then one hop per interception in arrival
    /// order.
    pub hops: Vec<Hop>,
    /// Sessions abandoned because the topology changed.
    pub restarts: u32,
    /// Topology epoch the hops were recorded under.
    pub epoch: u64,
    pub elapsed: Duration,
}

/// Snapshot served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub epoch: u64,
    pub configured_epoch: Option<u64>,
    pub stale: bool,
    pub switches_colored: usize,
    pub max_color: Option<u8>,
    pub recomputations: u64,
    pub install_failures: u64,
    pub forwarding_mode: ForwardingMode,
    pub stats: TraceStats,
}

/// Controller-side handles the service works through.
#[derive(Clone)]
pub struct Collaborators {
    pub topology: Arc<dyn TopologySnapshot>,
    pub inventory: Arc<dyn DeviceInventory>,
    pub io: Arc<dyn SwitchIo>,
}

impl Collaborators {
    /// Uses one object for all three roles.
    pub fn from_fabric<F>(fabric: Arc<F>) -> Self
    where
        F: TopologySnapshot + DeviceInventory + SwitchIo + 'static,
    {
        Self {
            topology: fabric.clone(),
            inventory: fabric.clone(),
            io: fabric,
        }
    }
}

pub struct TraceService {
    config: TraceConfig,
    topology: Arc<dyn TopologySnapshot>,
    inventory: Arc<dyn DeviceInventory>,
    registry: Arc<ConfigRegistry>,
    installer: RuleInstaller,
    injector: ProbeInjector,
    events: Mutex<mpsc::Receiver<InterceptEvent>>,
    stats: parking_lot::Mutex<TraceStats>,
}

impl std::fmt::Debug for TraceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceService")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("stats", &*self.stats.lock())
            .finish()
    }
}

impl TraceService {
    pub fn new(
        config: TraceConfig,
        fabric: Collaborators,
        registry: Arc<ConfigRegistry>,
        events: mpsc::Receiver<InterceptEvent>,
    ) -> Self {
        Self {
            config,
            topology: fabric.topology,
            inventory: fabric.inventory,
            registry,
            installer: RuleInstaller::new(fabric.io.clone()),
            injector: ProbeInjector::new(fabric.io),
            events: Mutex::new(events),
            stats: parking_lot::Mutex::new(TraceStats::default()),
        }
    }

    pub fn registry(&self) -> &Arc<ConfigRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> TraceStats {
        self.stats.lock().clone()
    }

    pub fn status(&self) -> ServiceStatus {
        let current = self.registry.current();
        ServiceStatus {
            epoch: self.registry.epoch(),
            configured_epoch: current.as_ref().map(|config| config.epoch),
            stale: self.registry.is_stale(),
            switches_colored: current.as_ref().map_or(0, |config| config.coloring.len()),
            max_color: current
                .as_ref()
                .and_then(|config| config.coloring.max_color())
                .map(Color::get),
            recomputations: self.registry.recomputations(),
            install_failures: self.registry.install_failures(),
            forwarding_mode: self.config.forwarding_mode,
            stats: self.stats(),
        }
    }

    /// Traces the path `probe` takes from its source through the fabric.
    ///
    /// The probe must carry an 802.1Q header; its tag field is overwritten
    /// hop by hop. Waits for any trace already in progress.
    #[instrument(skip(self, probe), fields(src = %probe.eth_src, dst = %probe.eth_dst))]
    pub async fn trace_route(&self, probe: ProbePacket) -> Result<TraceReport> {
        self.stats.lock().traces_started += 1;

        let result = self.run_trace(probe).await;

        let mut stats = self.stats.lock();
        match &result {
            Ok(report) => {
                stats.traces_completed += 1;
                stats.hops_recorded += report.hops.len() as u64;
                info!(
                    hops = report.hops.len(),
                    restarts = report.restarts,
                    epoch = report.epoch,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Trace complete"
                );
            }
            Err(e) => {
                stats.traces_failed += 1;
                error!(error = %e, "Trace failed");
            }
        }
        result
    }

    async fn run_trace(&self, probe: ProbePacket) -> Result<TraceReport> {
        if !probe.is_tagged() {
            return Err(TraceError::invalid_probe(
                "probe must carry an 802.1Q header to hold the trace tag",
            ));
        }

        let mut events = self.events.lock().await;
        self.drain(&mut events);

        let started = Instant::now();
        let mut epochs = self.registry.subscribe();
        let ctx = SessionContext {
            topology: self.topology.as_ref(),
            inventory: self.inventory.as_ref(),
            injector: &self.injector,
            mode: self.config.forwarding_mode,
            idle_timeout: self.config.idle_timeout(),
        };

        let mut restarts = 0u32;
        loop {
            let config = self
                .registry
                .ensure_current(self.topology.as_ref(), &self.installer)
                .await?;
            let mut session = TraceSession::new(probe.clone(), config);
            session.inject_sources(&ctx).await?;
            let outcome = session.run_until_idle(&ctx, &mut events, &mut epochs).await;

            {
                let mut stats = self.stats.lock();
                stats.injection_failures += session.injection_failures();
                stats.ignored_packets += session.ignored_packets();
            }

            match outcome? {
                WaitOutcome::Complete => {
                    return Ok(TraceReport {
                        epoch: session.epoch(),
                        hops: session.into_hops(),
                        restarts,
                        elapsed: started.elapsed(),
                    });
                }
                WaitOutcome::Stale { epoch } => {
                    restarts += 1;
                    self.stats.lock().restarts += 1;
                    info!(restarts, epoch, "Topology changed during trace, restarting");

                    if self.config.max_restarts != 0 && restarts > self.config.max_restarts {
                        return Err(TraceError::TopologyUnstable { restarts });
                    }
                    self.drain(&mut events);
                }
            }
        }
    }

    /// Discards packet-ins left over from an earlier session.
    fn drain(&self, events: &mut mpsc::Receiver<InterceptEvent>) {
        let mut drained = 0u64;
        while events.try_recv().is_ok() {
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, "Discarded stale packet-ins");
            self.stats.lock().drained_events += drained;
        }
    }
}
