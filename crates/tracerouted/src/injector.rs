//! Emits colored probes into the fabric.

use crate::error::{Result, TraceError};
use crate::fabric::{OutputAction, SwitchIo, TopologySnapshot};
use sonic_fabric_types::{Color, Hop, PortId, ProbePacket, SwitchId};
use std::sync::Arc;
use tracing::trace;

pub struct ProbeInjector {
    io: Arc<dyn SwitchIo>,
}

impl ProbeInjector {
    pub fn new(io: Arc<dyn SwitchIo>) -> Self {
        Self { io }
    }

    /// Tags a copy of `probe` with `color` and hands it to `switch` as if it
    /// had arrived on `in_port`. Every other field of the probe is kept.
    pub async fn inject(
        &self,
        probe: &ProbePacket,
        color: Color,
        switch: SwitchId,
        in_port: PortId,
        output: OutputAction,
    ) -> Result<()> {
        let frame = probe.with_color(color)?.encode()?;
        trace!(%switch, %in_port, color = color.get(), ?output, "Injecting probe");

        self.io
            .send_packet(switch, &frame, in_port, output)
            .await
            .map_err(|source| TraceError::PacketInjection { switch, source })
    }
}

/// Port on `from` whose link lands exactly at `to`.
pub fn egress_port_toward(
    topology: &dyn TopologySnapshot,
    from: SwitchId,
    to: Hop,
) -> Option<PortId> {
    topology
        .links_at(to)
        .into_iter()
        .filter_map(|link| link.opposite(to))
        .find(|end| end.switch == from)
        .map(|end| end.port)
}
