//! One trace attempt against one topology configuration.
//!
//! A session injects the probe at every attachment point of its source,
//! then waits. Each interception of a colored probe is recorded as a hop
//! and the probe is sent on toward the next switch. The session completes
//! once no interception has arrived for the idle timeout, and goes stale as
//! soon as the topology epoch moves past the one its configuration was
//! computed for.

use crate::config::ForwardingMode;
use crate::error::{Result, TraceError};
use crate::fabric::{DeviceInventory, InterceptEvent, OutputAction, TopologySnapshot};
use crate::injector::{egress_port_toward, ProbeInjector};
use crate::registry::TopologyConfig;
use sonic_fabric_types::{Color, Hop, PortId, ProbePacket};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Injecting,
    Waiting,
    Recording,
    StaleRestart,
    Complete,
}

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The idle timeout passed with no interception.
    Complete,
    /// The topology moved to `epoch`; the recorded hops are void.
    Stale { epoch: u64 },
}

/// Collaborators a session reads from and writes through.
pub struct SessionContext<'a> {
    pub topology: &'a dyn TopologySnapshot,
    pub inventory: &'a dyn DeviceInventory,
    pub injector: &'a ProbeInjector,
    pub mode: ForwardingMode,
    pub idle_timeout: Duration,
}

pub struct TraceSession {
    probe: ProbePacket,
    config: Arc<TopologyConfig>,
    hops: Vec<Hop>,
    state: SessionState,
    last_event: Instant,
    ignored_packets: u64,
    injection_failures: u64,
}

impl std::fmt::Debug for TraceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceSession")
            .field("state", &self.state)
            .field("epoch", &self.config.epoch)
            .field("hops", &self.hops.len())
            .finish()
    }
}

impl TraceSession {
    pub fn new(probe: ProbePacket, config: Arc<TopologyConfig>) -> Self {
        Self {
            probe,
            config,
            hops: Vec::new(),
            state: SessionState::Idle,
            last_event: Instant::now(),
            ignored_packets: 0,
            injection_failures: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    pub fn into_hops(self) -> Vec<Hop> {
        self.hops
    }

    /// Epoch of the configuration this session runs against.
    pub fn epoch(&self) -> u64 {
        self.config.epoch
    }

    pub fn ignored_packets(&self) -> u64 {
        self.ignored_packets
    }

    pub fn injection_failures(&self) -> u64 {
        self.injection_failures
    }

    /// Records every attachment point of the probe's source as a hop and
    /// injects the probe there, colored with that switch's color.
    ///
    /// Fails with [`TraceError::UnknownEndpoint`] when the source has no
    /// attachment point. Injection failures are logged and counted.
    pub async fn inject_sources(&mut self, ctx: &SessionContext<'_>) -> Result<usize> {
        self.state = SessionState::Injecting;

        let source = self.probe.eth_src;
        let points = ctx.inventory.attachment_points(source);
        if points.is_empty() {
            self.state = SessionState::Idle;
            return Err(TraceError::UnknownEndpoint(source));
        }

        for point in &points {
            self.hops.push(*point);
            self.last_event = Instant::now();

            let Some(color) = self.config.coloring.color_of(point.switch) else {
                warn!(switch = %point.switch, "Attachment switch has no color, not injecting");
                continue;
            };
            let result = ctx
                .injector
                .inject(&self.probe, color, point.switch, point.port, OutputAction::Table)
                .await;
            self.note_injection(result);
        }

        debug!(%source, points = points.len(), "Probe injected at source");
        self.state = SessionState::Waiting;
        Ok(points.len())
    }

    /// Processes interceptions until the idle timeout passes or the
    /// topology epoch moves.
    pub async fn run_until_idle(
        &mut self,
        ctx: &SessionContext<'_>,
        events: &mut mpsc::Receiver<InterceptEvent>,
        epochs: &mut watch::Receiver<u64>,
    ) -> Result<WaitOutcome> {
        let mut watching = true;
        self.state = SessionState::Waiting;

        loop {
            let latest = *epochs.borrow_and_update();
            if latest != self.config.epoch {
                debug!(from = self.config.epoch, to = latest, "Session went stale");
                self.state = SessionState::StaleRestart;
                return Ok(WaitOutcome::Stale { epoch: latest });
            }

            let deadline = self.last_event + ctx.idle_timeout;
            tokio::select! {
                biased;

                changed = epochs.changed(), if watching => {
                    // Sender gone: the epoch can no longer move.
                    if changed.is_err() {
                        watching = false;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.record(ctx, event).await,
                    None => return Err(TraceError::EventStreamClosed),
                },
                _ = sleep_until(deadline) => {
                    self.state = SessionState::Complete;
                    return Ok(WaitOutcome::Complete);
                }
            }
        }
    }

    /// Handles one interception: records the hop and sends the probe on.
    ///
    /// Packets that do not decode or carry no color are not probes and are
    /// ignored without touching the idle timer.
    pub async fn record(&mut self, ctx: &SessionContext<'_>, event: InterceptEvent) {
        let packet = match ProbePacket::decode(&event.data) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(switch = %event.switch, error = %e, "Ignoring undecodable packet-in");
                self.ignored_packets += 1;
                return;
            }
        };
        let Some(tag) = packet.color() else {
            trace!(switch = %event.switch, "Ignoring uncolored packet-in");
            self.ignored_packets += 1;
            return;
        };

        self.state = SessionState::Recording;
        let hop = event.hop();
        self.hops.push(hop);
        self.last_event = Instant::now();
        debug!(%hop, tag = tag.get(), "Recorded hop");

        match self.config.coloring.color_of(hop.switch) {
            Some(own) => {
                let result = self.reinject(ctx, &packet, hop, tag, own).await;
                self.note_injection(result);
            }
            None => warn!(switch = %hop.switch, "Intercepting switch has no color, trace ends here"),
        }
        self.state = SessionState::Waiting;
    }

    async fn reinject(
        &self,
        ctx: &SessionContext<'_>,
        packet: &ProbePacket,
        hop: Hop,
        tag: Color,
        own: Color,
    ) -> Result<()> {
        match ctx.mode {
            ForwardingMode::Pipeline => {
                ctx.injector
                    .inject(packet, own, hop.switch, hop.port, OutputAction::Table)
                    .await
            }
            ForwardingMode::EgressPort => {
                let Some((upstream, egress)) = self.upstream_of(ctx.topology, hop, tag) else {
                    warn!(%hop, tag = tag.get(), "No upstream hop found, not reinjecting");
                    return Ok(());
                };
                ctx.injector
                    .inject(
                        packet,
                        own,
                        upstream.switch,
                        upstream.port,
                        OutputAction::Port(egress),
                    )
                    .await
            }
        }
    }

    /// Finds the switch that sent the probe into `hop`: the neighbor across
    /// the ingress port whose color matches the tag. Returns its most recent
    /// recorded hop and the port it egresses toward `hop`.
    fn upstream_of(
        &self,
        topology: &dyn TopologySnapshot,
        hop: Hop,
        tag: Color,
    ) -> Option<(Hop, PortId)> {
        topology
            .links_at(hop)
            .into_iter()
            .filter_map(|link| link.opposite(hop))
            .filter(|peer| peer.switch != hop.switch)
            .filter(|peer| self.config.coloring.color_of(peer.switch) == Some(tag))
            .find_map(|peer| {
                let previous = self
                    .hops
                    .iter()
                    .rev()
                    .find(|recorded| recorded.switch == peer.switch)?;
                let egress = egress_port_toward(topology, peer.switch, hop)?;
                Some((*previous, egress))
            })
    }

    fn note_injection(&mut self, result: Result<()>) {
        if let Err(e) = result {
            warn!(error = %e, "Probe injection failed");
            self.injection_failures += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coloring::compute_coloring;
    use crate::rules::RuleInstaller;
    use crate::sim::{FabricDescription, HostDescription, LabFabric, RouteEntry};
    use pretty_assertions::assert_eq;
    use sonic_fabric_types::{Link, MacAddress, PortId, SwitchId, VlanId};

    const SRC: MacAddress = MacAddress::new([0, 0, 0, 0, 0, 0x0a]);
    const DST: MacAddress = MacAddress::new([0, 0, 0, 0, 0, 0x0b]);

    fn hop(sw: u64, port: u16) -> Hop {
        Hop::new(SwitchId::new(sw), PortId::new(port))
    }

    fn route(sw: u64, port: u16) -> RouteEntry {
        RouteEntry {
            switch: SwitchId::new(sw),
            eth_dst: DST,
            out_port: PortId::new(port),
        }
    }

    /// 1 - 2 - 3, source on 1/10, destination on 3/10.
    fn chain() -> FabricDescription {
        FabricDescription {
            switches: (1..=3).map(SwitchId::new).collect(),
            links: vec![
                Link::new(hop(1, 1), hop(2, 1)),
                Link::new(hop(2, 2), hop(3, 1)),
            ],
            hosts: vec![
                HostDescription { mac: SRC, attachments: vec![hop(1, 10)] },
                HostDescription { mac: DST, attachments: vec![hop(3, 10)] },
            ],
            routes: vec![route(1, 1), route(2, 2), route(3, 10)],
        }
    }

    fn probe() -> ProbePacket {
        ProbePacket::new(SRC, DST, Some(VlanId::new(1).unwrap()))
    }

    struct Harness {
        fabric: Arc<LabFabric>,
        injector: ProbeInjector,
        config: Arc<TopologyConfig>,
        intercepts: mpsc::Receiver<InterceptEvent>,
        epochs: watch::Sender<u64>,
    }

    impl Harness {
        async fn new(description: FabricDescription) -> Self {
            let (fabric, intercepts, _) = LabFabric::new(description, 64);
            let coloring = compute_coloring(fabric.as_ref()).unwrap();
            let install = RuleInstaller::new(fabric.clone())
                .install_all(fabric.as_ref(), &coloring)
                .await;
            let (epochs, _) = watch::channel(1);
            Harness {
                injector: ProbeInjector::new(fabric.clone()),
                fabric,
                config: Arc::new(TopologyConfig { epoch: 1, coloring, install }),
                intercepts,
                epochs,
            }
        }

        fn ctx(&self, mode: ForwardingMode) -> SessionContext<'_> {
            SessionContext {
                topology: self.fabric.as_ref(),
                inventory: self.fabric.as_ref(),
                injector: &self.injector,
                mode,
                idle_timeout: Duration::from_secs(1),
            }
        }
    }

    async fn run(mode: ForwardingMode) -> (Vec<Hop>, WaitOutcome) {
        let mut h = Harness::new(chain()).await;
        let mut epochs = h.epochs.subscribe();
        let ctx = SessionContext {
            topology: h.fabric.as_ref(),
            inventory: h.fabric.as_ref(),
            injector: &h.injector,
            mode,
            idle_timeout: Duration::from_secs(1),
        };
        let mut session = TraceSession::new(probe(), h.config.clone());
        session.inject_sources(&ctx).await.unwrap();
        let outcome = session
            .run_until_idle(&ctx, &mut h.intercepts, &mut epochs)
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Complete);
        (session.into_hops(), outcome)
    }

    #[tokio::test(start_paused = true)]
    async fn test_egress_port_mode_walks_chain() {
        let (hops, outcome) = run(ForwardingMode::EgressPort).await;
        assert_eq!(outcome, WaitOutcome::Complete);
        assert_eq!(hops, vec![hop(1, 10), hop(2, 1), hop(3, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_mode_walks_chain() {
        let (hops, outcome) = run(ForwardingMode::Pipeline).await;
        assert_eq!(outcome, WaitOutcome::Complete);
        assert_eq!(hops, vec![hop(1, 10), hop(2, 1), hop(3, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_source_fails() {
        let h = Harness::new(chain()).await;
        let ctx = h.ctx(ForwardingMode::EgressPort);
        let mut unknown = probe();
        unknown.eth_src = MacAddress::from_u64(0xdead);

        let mut session = TraceSession::new(unknown, h.config.clone());
        let err = session.inject_sources(&ctx).await.unwrap_err();
        assert!(matches!(err, TraceError::UnknownEndpoint(mac) if mac == MacAddress::from_u64(0xdead)));
        assert!(session.hops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_completes_after_one_second() {
        let mut h = Harness::new(chain()).await;
        let mut epochs = h.epochs.subscribe();
        let ctx = SessionContext {
            topology: h.fabric.as_ref(),
            inventory: h.fabric.as_ref(),
            injector: &h.injector,
            mode: ForwardingMode::EgressPort,
            idle_timeout: Duration::from_secs(1),
        };

        // No injection at all: nothing will ever be intercepted.
        let mut session = TraceSession::new(probe(), h.config.clone());
        let started = Instant::now();
        let outcome = session
            .run_until_idle(&ctx, &mut h.intercepts, &mut epochs)
            .await
            .unwrap();

        assert_eq!(outcome, WaitOutcome::Complete);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_epoch_change_marks_session_stale() {
        let mut h = Harness::new(chain()).await;
        let mut epochs = h.epochs.subscribe();
        h.epochs.send_replace(2);
        let ctx = SessionContext {
            topology: h.fabric.as_ref(),
            inventory: h.fabric.as_ref(),
            injector: &h.injector,
            mode: ForwardingMode::EgressPort,
            idle_timeout: Duration::from_secs(1),
        };

        let mut session = TraceSession::new(probe(), h.config.clone());
        let outcome = session
            .run_until_idle(&ctx, &mut h.intercepts, &mut epochs)
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Stale { epoch: 2 });
        assert_eq!(session.state(), SessionState::StaleRestart);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlinked_ingress_records_hop_without_reinjecting() {
        let h = Harness::new(chain()).await;
        let ctx = h.ctx(ForwardingMode::EgressPort);
        let mut session = TraceSession::new(probe(), h.config.clone());
        session.inject_sources(&ctx).await.unwrap();
        let injected = h.fabric.packets_injected();

        // Port 7 on switch 2 has no link, so there is no upstream to send from.
        let tag = h.config.coloring.color_of(SwitchId::new(1)).unwrap();
        let data = probe().with_color(tag).unwrap().encode().unwrap();
        session
            .record(&ctx, InterceptEvent { switch: SwitchId::new(2), port: PortId::new(7), data })
            .await;

        assert_eq!(session.hops(), &[hop(1, 10), hop(2, 7)]);
        assert_eq!(h.fabric.packets_injected(), injected);
        assert_eq!(session.injection_failures(), 0);
        assert_eq!(session.state(), SessionState::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncolored_and_garbage_packets_are_ignored() {
        let h = Harness::new(chain()).await;
        let ctx = h.ctx(ForwardingMode::EgressPort);
        let mut session = TraceSession::new(probe(), h.config.clone());

        session
            .record(&ctx, InterceptEvent { switch: SwitchId::new(2), port: PortId::new(1), data: vec![1, 2, 3] })
            .await;
        session
            .record(
                &ctx,
                InterceptEvent {
                    switch: SwitchId::new(2),
                    port: PortId::new(1),
                    data: probe().encode().unwrap(),
                },
            )
            .await;

        assert!(session.hops().is_empty());
        assert_eq!(session.ignored_packets(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_event_stream_is_an_error() {
        let mut h = Harness::new(chain()).await;
        let mut epochs = h.epochs.subscribe();
        let ctx = SessionContext {
            topology: h.fabric.as_ref(),
            inventory: h.fabric.as_ref(),
            injector: &h.injector,
            mode: ForwardingMode::EgressPort,
            idle_timeout: Duration::from_secs(1),
        };
        h.intercepts.close();
        while h.intercepts.try_recv().is_ok() {}

        let mut session = TraceSession::new(probe(), h.config.clone());
        let err = session
            .run_until_idle(&ctx, &mut h.intercepts, &mut epochs)
            .await
            .unwrap_err();
        assert!(matches!(err, TraceError::EventStreamClosed));
    }
}
