//! In-memory lab fabric.
//!
//! [`LabFabric`] stands in for a controller and its switches: it serves the
//! topology and device inventory, keeps per-switch tag rules, and walks
//! injected packets hop by hop through a static forwarding table keyed by
//! destination MAC. Tag rules are matched before forwarding, and a match
//! punts the packet back as an [`InterceptEvent`].
//!
//! A description file looks like:
//!
//! ```json
//! {
//!   "switches": ["00:00:00:00:00:00:00:01", "00:00:00:00:00:00:00:02"],
//!   "links": [{"src": {"switch": "00:00:00:00:00:00:00:01", "port": 1},
//!              "dst": {"switch": "00:00:00:00:00:00:00:02", "port": 1}}],
//!   "hosts": [{"mac": "00:00:00:00:00:0a",
//!              "attachments": [{"switch": "00:00:00:00:00:00:00:01", "port": 10}]}],
//!   "routes": [{"switch": "00:00:00:00:00:00:00:01", "eth_dst": "00:00:00:00:00:0b", "out_port": 1}]
//! }
//! ```

use crate::error::{Result, SwitchIoError, TraceError};
use crate::fabric::{
    DeviceInventory, InterceptEvent, OutputAction, SwitchIo, TagRule, TopologyEvent,
    TopologySnapshot,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sonic_fabric_types::{peek_eth_dst, peek_tag, Color, Hop, Link, MacAddress, PortId, SwitchId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

/// Switch-to-switch hops a single injected packet may take before the walk
/// is abandoned as a forwarding loop.
pub const MAX_FABRIC_HOPS: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricDescription {
    pub switches: Vec<SwitchId>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub hosts: Vec<HostDescription>,
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDescription {
    pub mac: MacAddress,
    pub attachments: Vec<Hop>,
}

/// Forwarding entry: packets for `eth_dst` leave `switch` on `out_port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub switch: SwitchId,
    pub eth_dst: MacAddress,
    pub out_port: PortId,
}

impl FabricDescription {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            TraceError::configuration(format!("fabric description {}: {}", path.display(), e))
        })
    }
}

#[derive(Default)]
struct FabricState {
    switches: Vec<SwitchId>,
    links: Vec<Link>,
    hosts: HashMap<MacAddress, Vec<Hop>>,
    routes: HashMap<(SwitchId, MacAddress), PortId>,
    rules: HashMap<SwitchId, BTreeMap<Color, TagRule>>,
    control_down: HashSet<SwitchId>,
}

impl FabricState {
    fn has_switch(&self, switch: SwitchId) -> bool {
        self.switches.contains(&switch)
    }

    fn check_control(&self, switch: SwitchId) -> std::result::Result<(), SwitchIoError> {
        if !self.has_switch(switch) || self.control_down.contains(&switch) {
            Err(SwitchIoError::Unreachable(switch))
        } else {
            Ok(())
        }
    }

    fn link_peer(&self, end: Hop) -> Option<Hop> {
        self.links.iter().find_map(|link| link.opposite(end))
    }

    fn intercepts(&self, switch: SwitchId, frame: &[u8]) -> bool {
        peek_tag(frame)
            .and_then(Color::from_tag)
            .is_some_and(|tag| {
                self.rules
                    .get(&switch)
                    .is_some_and(|rules| rules.contains_key(&tag))
            })
    }

    /// Follows `frame` from `switch` until it is punted, dropped or leaves
    /// the fabric.
    fn walk(
        &self,
        mut switch: SwitchId,
        frame: &[u8],
        eth_dst: MacAddress,
        mut in_port: PortId,
        mut output: OutputAction,
    ) -> Option<InterceptEvent> {
        for _ in 0..MAX_FABRIC_HOPS {
            let out_port = match output {
                OutputAction::Port(port) => port,
                OutputAction::Table => {
                    if self.intercepts(switch, frame) {
                        return Some(InterceptEvent {
                            switch,
                            port: in_port,
                            data: frame.to_vec(),
                        });
                    }
                    match self.routes.get(&(switch, eth_dst)) {
                        Some(port) if *port != in_port => *port,
                        _ => {
                            trace!(%switch, %eth_dst, "No route, dropping packet");
                            return None;
                        }
                    }
                }
            };

            match self.link_peer(Hop::new(switch, out_port)) {
                Some(next) if self.has_switch(next.switch) => {
                    switch = next.switch;
                    in_port = next.port;
                    output = OutputAction::Table;
                }
                _ => {
                    trace!(%switch, port = %out_port, "Packet left the fabric");
                    return None;
                }
            }
        }

        warn!(%eth_dst, "Forwarding loop, packet discarded");
        None
    }
}

/// Simulated controller and switches.
pub struct LabFabric {
    state: RwLock<FabricState>,
    intercepts: mpsc::Sender<InterceptEvent>,
    topology_events: mpsc::Sender<TopologyEvent>,
    packets_injected: AtomicU64,
}

impl LabFabric {
    /// Builds a fabric and returns it with the receiving ends of its
    /// interception and topology event queues.
    pub fn new(
        description: FabricDescription,
        queue_depth: usize,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<InterceptEvent>,
        mpsc::Receiver<TopologyEvent>,
    ) {
        let (intercept_tx, intercept_rx) = mpsc::channel(queue_depth.max(1));
        let (topology_tx, topology_rx) = mpsc::channel(queue_depth.max(1));

        let mut state = FabricState {
            switches: description.switches,
            links: description.links,
            ..Default::default()
        };
        for host in description.hosts {
            state.hosts.entry(host.mac).or_default().extend(host.attachments);
        }
        for route in description.routes {
            state.routes.insert((route.switch, route.eth_dst), route.out_port);
        }

        let fabric = Arc::new(Self {
            state: RwLock::new(state),
            intercepts: intercept_tx,
            topology_events: topology_tx,
            packets_injected: AtomicU64::new(0),
        });
        (fabric, intercept_rx, topology_rx)
    }

    pub fn from_file(
        path: impl AsRef<Path>,
        queue_depth: usize,
    ) -> Result<(
        Arc<Self>,
        mpsc::Receiver<InterceptEvent>,
        mpsc::Receiver<TopologyEvent>,
    )> {
        Ok(Self::new(FabricDescription::from_file(path)?, queue_depth))
    }

    /// Tag rules currently installed on `switch`, ordered by tag.
    pub fn rules_on(&self, switch: SwitchId) -> Vec<TagRule> {
        self.state
            .read()
            .rules
            .get(&switch)
            .map(|rules| rules.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn packets_injected(&self) -> u64 {
        self.packets_injected.load(Ordering::Relaxed)
    }

    /// Cuts or restores the control channel of `switch`. The data plane
    /// keeps forwarding with whatever rules it already has.
    pub fn set_control_down(&self, switch: SwitchId, down: bool) {
        let mut state = self.state.write();
        if down {
            state.control_down.insert(switch);
        } else {
            state.control_down.remove(&switch);
        }
    }

    pub fn add_switch(&self, switch: SwitchId) {
        {
            let mut state = self.state.write();
            if state.has_switch(switch) {
                return;
            }
            state.switches.push(switch);
        }
        self.notify(TopologyEvent::SwitchAdded(switch));
    }

    /// Removes `switch` along with its links, rules and routes.
    pub fn remove_switch(&self, switch: SwitchId) {
        {
            let mut state = self.state.write();
            if !state.has_switch(switch) {
                return;
            }
            state.switches.retain(|sw| *sw != switch);
            state.links.retain(|link| !link.touches(switch));
            state.rules.remove(&switch);
            state.routes.retain(|(sw, _), _| *sw != switch);
        }
        self.notify(TopologyEvent::SwitchRemoved(switch));
    }

    pub fn add_link(&self, link: Link) {
        {
            let mut state = self.state.write();
            if state.links.iter().any(|l| l.same_as(&link)) {
                return;
            }
            state.links.push(link);
        }
        self.notify(TopologyEvent::LinkAdded(link));
    }

    /// Returns false when no such link exists.
    pub fn remove_link(&self, link: Link) -> bool {
        let removed = {
            let mut state = self.state.write();
            let before = state.links.len();
            state.links.retain(|l| !l.same_as(&link));
            before != state.links.len()
        };
        if removed {
            self.notify(TopologyEvent::LinkRemoved(link));
        }
        removed
    }

    /// Reports a port status change without touching any link.
    pub fn port_changed(&self, switch: SwitchId, port: PortId) {
        self.notify(TopologyEvent::PortChanged { switch, port });
    }

    pub fn set_route(&self, switch: SwitchId, eth_dst: MacAddress, out_port: PortId) {
        self.state.write().routes.insert((switch, eth_dst), out_port);
    }

    fn notify(&self, event: TopologyEvent) {
        debug!(?event, "Topology change");
        if let Err(e) = self.topology_events.try_send(event) {
            warn!(error = %e, "Topology event not delivered");
        }
    }

    fn deliver(&self, event: InterceptEvent) {
        match self.intercepts.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(switch = %event.switch, "Interception queue full, dropping packet-in")
            }
            Err(TrySendError::Closed(_)) => debug!("Interception queue closed"),
        }
    }
}

impl TopologySnapshot for LabFabric {
    fn list_switches(&self) -> Vec<SwitchId> {
        self.state.read().switches.clone()
    }

    fn links_of(&self, switch: SwitchId) -> Vec<Link> {
        self.state
            .read()
            .links
            .iter()
            .filter(|link| link.touches(switch))
            .copied()
            .collect()
    }
}

impl DeviceInventory for LabFabric {
    fn attachment_points(&self, mac: MacAddress) -> Vec<Hop> {
        self.state.read().hosts.get(&mac).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl SwitchIo for LabFabric {
    async fn install_rule(
        &self,
        switch: SwitchId,
        rule: &TagRule,
    ) -> std::result::Result<(), SwitchIoError> {
        let mut state = self.state.write();
        state.check_control(switch)?;
        state.rules.entry(switch).or_default().insert(rule.tag, *rule);
        Ok(())
    }

    async fn remove_rule(
        &self,
        switch: SwitchId,
        tag: Color,
    ) -> std::result::Result<(), SwitchIoError> {
        let mut state = self.state.write();
        state.check_control(switch)?;
        if let Some(rules) = state.rules.get_mut(&switch) {
            rules.remove(&tag);
        }
        Ok(())
    }

    async fn send_packet(
        &self,
        switch: SwitchId,
        packet: &[u8],
        in_port: PortId,
        output: OutputAction,
    ) -> std::result::Result<(), SwitchIoError> {
        let intercepted = {
            let state = self.state.read();
            state.check_control(switch)?;
            let eth_dst = peek_eth_dst(packet).ok_or_else(|| SwitchIoError::Rejected {
                switch,
                reason: format!("frame of {} bytes has no Ethernet header", packet.len()),
            })?;
            state.walk(switch, packet, eth_dst, in_port, output)
        };
        self.packets_injected.fetch_add(1, Ordering::Relaxed);

        if let Some(event) = intercepted {
            self.deliver(event);
        }
        Ok(())
    }
}
