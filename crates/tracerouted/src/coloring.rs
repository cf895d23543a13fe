//! Greedy graph coloring of the switch graph.
//!
//! Each switch gets the smallest color not already held by a colored
//! neighbor. A packet tagged with a switch's color is therefore
//! intercepted by every neighbor of that switch and by nothing else, which
//! is what lets a trace attribute every interception to exactly one
//! upstream switch.

use crate::error::{Result, TraceError};
use crate::fabric::TopologySnapshot;
use sonic_fabric_types::{Color, SwitchId, MAX_COLOR};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, instrument};

/// Color assignment for every switch in one topology snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coloring {
    colors: HashMap<SwitchId, Color>,
}

impl Coloring {
    pub fn color_of(&self, switch: SwitchId) -> Option<Color> {
        self.colors.get(&switch).copied()
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SwitchId, Color)> + '_ {
        self.colors.iter().map(|(sw, color)| (*sw, *color))
    }

    /// Highest color in use.
    pub fn max_color(&self) -> Option<Color> {
        self.colors.values().max().copied()
    }

    /// Colors held by the neighbors of `switch`: the tags `switch` must
    /// intercept.
    pub fn adjacent_colors(
        &self,
        topology: &dyn TopologySnapshot,
        switch: SwitchId,
    ) -> BTreeSet<Color> {
        topology
            .neighbors(switch)
            .into_iter()
            .filter_map(|peer| self.color_of(peer))
            .collect()
    }

    /// True when every switch is colored and no two neighbors share a color.
    pub fn is_proper(&self, topology: &dyn TopologySnapshot) -> bool {
        topology.list_switches().into_iter().all(|switch| {
            let Some(own) = self.color_of(switch) else {
                return false;
            };
            topology
                .neighbors(switch)
                .into_iter()
                .all(|peer| self.color_of(peer) != Some(own))
        })
    }
}

/// Colors `topology` greedily in `list_switches` order.
///
/// Fails with [`TraceError::TooManyColors`] when a switch would need a color
/// beyond [`MAX_COLOR`]. Any graph whose maximum degree is below
/// `MAX_COLOR` colors successfully.
#[instrument(skip(topology))]
pub fn compute_coloring(topology: &dyn TopologySnapshot) -> Result<Coloring> {
    let mut coloring = Coloring::default();

    for switch in topology.list_switches() {
        let taken: BTreeSet<u8> = coloring
            .adjacent_colors(topology, switch)
            .into_iter()
            .map(Color::get)
            .collect();

        let mut candidate = Color::FIRST.get();
        while taken.contains(&candidate) {
            candidate += 1;
        }

        let color = Color::new(candidate).map_err(|_| TraceError::TooManyColors {
            switch,
            needed: candidate,
            max: MAX_COLOR,
        })?;
        coloring.colors.insert(switch, color);
    }

    debug!(
        switches = coloring.len(),
        max_color = coloring.max_color().map(Color::get).unwrap_or(0),
        "Computed fabric coloring"
    );
    Ok(coloring)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use sonic_fabric_types::{Hop, Link, PortId};

    /// Plain adjacency list; each link gets a fresh port on both ends.
    #[derive(Default)]
    struct Graph {
        switches: Vec<SwitchId>,
        links: Vec<Link>,
        next_port: HashMap<SwitchId, u16>,
    }

    impl Graph {
        fn with_switches(n: u64) -> Self {
            Graph {
                switches: (1..=n).map(SwitchId::new).collect(),
                ..Default::default()
            }
        }

        fn port(&mut self, sw: SwitchId) -> PortId {
            let next = self.next_port.entry(sw).or_insert(0);
            *next += 1;
            PortId::new(*next)
        }

        fn connect(&mut self, a: u64, b: u64) {
            let (a, b) = (SwitchId::new(a), SwitchId::new(b));
            let (pa, pb) = (self.port(a), self.port(b));
            self.links.push(Link::new(Hop::new(a, pa), Hop::new(b, pb)));
        }

        fn degree(&self, sw: SwitchId) -> usize {
            self.neighbors(sw).len()
        }
    }

    impl TopologySnapshot for Graph {
        fn list_switches(&self) -> Vec<SwitchId> {
            self.switches.clone()
        }

        fn links_of(&self, switch: SwitchId) -> Vec<Link> {
            self.links.iter().filter(|l| l.touches(switch)).copied().collect()
        }
    }

    fn colors(coloring: &Coloring, n: u64) -> Vec<u8> {
        (1..=n)
            .map(|i| coloring.color_of(SwitchId::new(i)).map(Color::get).unwrap_or(0))
            .collect()
    }

    #[test]
    fn test_linear_chain_alternates() {
        let mut g = Graph::with_switches(4);
        g.connect(1, 2);
        g.connect(2, 3);
        g.connect(3, 4);

        let coloring = compute_coloring(&g).unwrap();
        assert_eq!(colors(&coloring, 4), vec![1, 2, 1, 2]);
        assert!(coloring.is_proper(&g));
        assert_eq!(
            coloring.adjacent_colors(&g, SwitchId::new(2)),
            BTreeSet::from([Color::new(1).unwrap()])
        );
    }

    #[test]
    fn test_odd_ring_needs_three_colors() {
        let mut g = Graph::with_switches(5);
        for i in 1..=5 {
            g.connect(i, i % 5 + 1);
        }

        let coloring = compute_coloring(&g).unwrap();
        assert!(coloring.is_proper(&g));
        assert_eq!(coloring.max_color().map(Color::get), Some(3));
    }

    #[test]
    fn test_isolated_and_empty() {
        let g = Graph::with_switches(3);
        let coloring = compute_coloring(&g).unwrap();
        assert_eq!(colors(&coloring, 3), vec![1, 1, 1]);

        let empty = Graph::default();
        assert!(compute_coloring(&empty).unwrap().is_empty());
    }

    #[test]
    fn test_self_loops_and_parallel_links_ignored() {
        let mut g = Graph::with_switches(2);
        g.connect(1, 1);
        g.connect(1, 2);
        g.connect(1, 2);

        let coloring = compute_coloring(&g).unwrap();
        assert_eq!(colors(&coloring, 2), vec![1, 2]);
    }

    #[test]
    fn test_clique_of_seven_fits() {
        let mut g = Graph::with_switches(7);
        for a in 1..=7 {
            for b in (a + 1)..=7 {
                g.connect(a, b);
            }
        }

        let coloring = compute_coloring(&g).unwrap();
        assert_eq!(coloring.max_color().map(Color::get), Some(MAX_COLOR));
        assert!(coloring.is_proper(&g));
    }

    #[test]
    fn test_clique_of_eight_overflows() {
        let mut g = Graph::with_switches(8);
        for a in 1..=8 {
            for b in (a + 1)..=8 {
                g.connect(a, b);
            }
        }

        match compute_coloring(&g) {
            Err(TraceError::TooManyColors { switch, needed, max }) => {
                assert_eq!(switch, SwitchId::new(8));
                assert_eq!(needed, 8);
                assert_eq!(max, 7);
            }
            other => panic!("expected TooManyColors, got {:?}", other),
        }
    }

    #[test]
    fn test_random_low_degree_graphs_color_properly() {
        let mut rng = StdRng::seed_from_u64(0x7ace);

        for _ in 0..200 {
            let n = rng.gen_range(1..=40u64);
            let mut g = Graph::with_switches(n);
            for _ in 0..rng.gen_range(0..=n * 3) {
                let a = rng.gen_range(1..=n);
                let b = rng.gen_range(1..=n);
                let (sa, sb) = (SwitchId::new(a), SwitchId::new(b));
                if a != b
                    && g.degree(sa) < usize::from(MAX_COLOR - 1)
                    && g.degree(sb) < usize::from(MAX_COLOR - 1)
                {
                    g.connect(a, b);
                }
            }

            let coloring = compute_coloring(&g).unwrap();
            assert!(coloring.is_proper(&g));
            assert_eq!(coloring.len(), n as usize);
        }
    }
}
