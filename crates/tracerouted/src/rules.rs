//! Tag rule programming.
//!
//! A switch colored `c` must never intercept packets tagged `c`, and must
//! intercept every tag held by one of its neighbors.

use crate::coloring::Coloring;
use crate::error::{Result, SwitchIoError, TraceError};
use crate::fabric::{SwitchIo, TagRule, TopologySnapshot};
use futures::future::join_all;
use sonic_fabric_types::{Color, SwitchId};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Outcome of programming every switch for one coloring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Switches that were attempted.
    pub switches: usize,
    pub rules_installed: usize,
    /// Switches with at least one failed write, and the first error seen.
    pub failures: Vec<(SwitchId, SwitchIoError)>,
}

impl InstallReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct RuleInstaller {
    io: Arc<dyn SwitchIo>,
}

impl RuleInstaller {
    pub fn new(io: Arc<dyn SwitchIo>) -> Self {
        Self { io }
    }

    /// Programs one switch: drops any rule for its own color, then installs
    /// an intercept rule per adjacent color.
    ///
    /// Every write is attempted even after a failure; the first failure is
    /// returned. Returns the number of rules installed.
    pub async fn install_rules(
        &self,
        switch: SwitchId,
        own: Color,
        adjacent: &BTreeSet<Color>,
    ) -> Result<usize> {
        let mut first_error = None;

        if let Err(e) = self.io.remove_rule(switch, own).await {
            warn!(%switch, tag = own.get(), error = %e, "Failed to remove own-color rule");
            first_error.get_or_insert(e);
        }

        let mut installed = 0;
        for tag in adjacent.iter().filter(|tag| **tag != own) {
            match self.io.install_rule(switch, &TagRule::intercept(*tag)).await {
                Ok(()) => installed += 1,
                Err(e) => {
                    warn!(%switch, tag = tag.get(), error = %e, "Failed to install tag rule");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            None => Ok(installed),
            Some(source) => Err(TraceError::RuleInstall { switch, source }),
        }
    }

    /// Programs every switch in `topology` for `coloring`. Switches are
    /// written concurrently and a failure on one never stops the others.
    #[instrument(skip_all, fields(switches = coloring.len()))]
    pub async fn install_all(
        &self,
        topology: &dyn TopologySnapshot,
        coloring: &Coloring,
    ) -> InstallReport {
        let mut report = InstallReport::default();

        let mut plans = Vec::new();
        for switch in topology.list_switches() {
            match coloring.color_of(switch) {
                Some(own) => plans.push((switch, own, coloring.adjacent_colors(topology, switch))),
                None => warn!(%switch, "Switch has no color, skipping rule install"),
            }
        }
        report.switches = plans.len();

        let results = join_all(
            plans
                .iter()
                .map(|(switch, own, adjacent)| self.install_rules(*switch, *own, adjacent)),
        )
        .await;

        for ((switch, _, _), result) in plans.iter().zip(results) {
            match result {
                Ok(installed) => report.rules_installed += installed,
                Err(TraceError::RuleInstall { source, .. }) => {
                    report.failures.push((*switch, source))
                }
                Err(e) => warn!(%switch, error = %e, "Unexpected rule install error"),
            }
        }

        info!(
            switches = report.switches,
            rules = report.rules_installed,
            failed = report.failures.len(),
            "Tag rules installed"
        );
        report
    }
}
