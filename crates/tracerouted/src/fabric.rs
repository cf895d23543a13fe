//! Seams to the controller: topology, device inventory and switch I/O.
//!
//! The daemon never talks to switches directly. Everything it learns about
//! the fabric comes through [`TopologySnapshot`] and [`DeviceInventory`],
//! everything it changes goes through [`SwitchIo`], and probes that hit a
//! tag rule come back as [`InterceptEvent`]s on an mpsc channel.

use crate::error::SwitchIoError;
use async_trait::async_trait;
use sonic_fabric_types::{Color, Hop, Link, MacAddress, PortId, SwitchId};

/// Highest rule priority a switch accepts. Tag rules use it so they win over
/// every forwarding entry.
pub const MAX_RULE_PRIORITY: u16 = 32767;

/// Read-only view of the current fabric graph.
pub trait TopologySnapshot: Send + Sync {
    /// All switches, in a stable order.
    fn list_switches(&self) -> Vec<SwitchId>;

    /// Links with at least one end on `switch`.
    fn links_of(&self, switch: SwitchId) -> Vec<Link>;

    /// Links with one end exactly at `hop`.
    fn links_at(&self, hop: Hop) -> Vec<Link> {
        self.links_of(hop.switch)
            .into_iter()
            .filter(|link| link.src == hop || link.dst == hop)
            .collect()
    }

    /// Distinct neighboring switches, self-loops excluded.
    fn neighbors(&self, switch: SwitchId) -> Vec<SwitchId> {
        let mut neighbors: Vec<SwitchId> = self
            .links_of(switch)
            .iter()
            .filter_map(|link| link.peer_of(switch))
            .map(|peer| peer.switch)
            .collect();
        neighbors.sort_unstable();
        neighbors.dedup();
        neighbors
    }
}

/// Where end hosts attach to the fabric.
pub trait DeviceInventory: Send + Sync {
    /// Every (switch, port) the host with `mac` is attached at.
    fn attachment_points(&self, mac: MacAddress) -> Vec<Hop>;
}

/// What a switch does with a packet handed to it by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputAction {
    /// Run the packet through the switch's forwarding pipeline.
    Table,
    /// Send it straight out of a port.
    Port(PortId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Punt matching packets to the controller.
    ToController,
}

/// A match-on-tag rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagRule {
    pub tag: Color,
    pub priority: u16,
    pub action: RuleAction,
    /// Rules never expire on their own.
    pub idle_timeout: u16,
    pub hard_timeout: u16,
}

impl TagRule {
    /// Highest-priority rule punting packets tagged `tag` to the controller.
    pub fn intercept(tag: Color) -> Self {
        TagRule {
            tag,
            priority: MAX_RULE_PRIORITY,
            action: RuleAction::ToController,
            idle_timeout: 0,
            hard_timeout: 0,
        }
    }
}

/// Control channel to the switches.
#[async_trait]
pub trait SwitchIo: Send + Sync {
    /// Installs or replaces the rule matching `rule.tag`.
    async fn install_rule(&self, switch: SwitchId, rule: &TagRule) -> Result<(), SwitchIoError>;

    /// Removes the rule matching `tag`. Removing a rule that is not present
    /// succeeds.
    async fn remove_rule(&self, switch: SwitchId, tag: Color) -> Result<(), SwitchIoError>;

    /// Hands `packet` to `switch` as if it had arrived on `in_port`.
    async fn send_packet(
        &self,
        switch: SwitchId,
        packet: &[u8],
        in_port: PortId,
        output: OutputAction,
    ) -> Result<(), SwitchIoError>;
}

/// A packet a switch punted to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptEvent {
    pub switch: SwitchId,
    /// Port the packet arrived on.
    pub port: PortId,
    pub data: Vec<u8>,
}

impl InterceptEvent {
    pub fn hop(&self) -> Hop {
        Hop::new(self.switch, self.port)
    }
}

/// Fabric changes that invalidate the current coloring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    SwitchAdded(SwitchId),
    SwitchRemoved(SwitchId),
    PortChanged { switch: SwitchId, port: PortId },
    LinkAdded(Link),
    LinkRemoved(Link),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Triangle;

    fn hop(sw: u64, port: u16) -> Hop {
        Hop::new(SwitchId::new(sw), PortId::new(port))
    }

    impl TopologySnapshot for Triangle {
        fn list_switches(&self) -> Vec<SwitchId> {
            (1..=3).map(SwitchId::new).collect()
        }

        fn links_of(&self, switch: SwitchId) -> Vec<Link> {
            [
                Link::new(hop(1, 1), hop(2, 1)),
                Link::new(hop(2, 2), hop(3, 1)),
                Link::new(hop(3, 2), hop(1, 2)),
                // parallel link between 1 and 2
                Link::new(hop(1, 3), hop(2, 3)),
            ]
            .into_iter()
            .filter(|link| link.touches(switch))
            .collect()
        }
    }

    #[test]
    fn test_links_at_filters_by_port() {
        let links = Triangle.links_at(hop(1, 2));
        assert_eq!(links, vec![Link::new(hop(3, 2), hop(1, 2))]);
        assert!(Triangle.links_at(hop(1, 9)).is_empty());
    }

    #[test]
    fn test_neighbors_are_deduplicated() {
        assert_eq!(
            Triangle.neighbors(SwitchId::new(1)),
            vec![SwitchId::new(2), SwitchId::new(3)]
        );
    }

    #[test]
    fn test_intercept_rule_shape() {
        let rule = TagRule::intercept(Color::new(4).unwrap());
        assert_eq!(rule.priority, MAX_RULE_PRIORITY);
        assert_eq!(rule.action, RuleAction::ToController);
        assert_eq!((rule.idle_timeout, rule.hard_timeout), (0, 0));
    }
}
