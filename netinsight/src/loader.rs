use std::path::Path;

use anyhow::{Context, Result};
use aya::maps::{Array, HashMap, MapData};
use aya::programs::xdp::XdpLinkId;
use aya::programs::{Xdp, XdpFlags};
use aya::{Ebpf, Pod};
use aya_log::EbpfLogger;
use clap::ValueEnum;
use serde::Deserialize;

use netinsight_common::{maps, CoarseFlowKey, FineFlowKey};

use crate::snapshot::{TableRows, TableSnapshot};

const XDP_PROGRAM: &str = "netinsight";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XdpMode {
    /// Generic mode, works on every driver.
    #[default]
    Skb,
    Driver,
    Hw,
}

impl XdpMode {
    fn flags(self) -> XdpFlags {
        match self {
            XdpMode::Skb => XdpFlags::SKB_MODE,
            XdpMode::Driver => XdpFlags::DRV_MODE,
            XdpMode::Hw => XdpFlags::HW_MODE,
        }
    }
}

/// The loaded XDP probe and its maps.
///
/// The kernel owns the tables; this handle only reads them and, when asked
/// to drain, deletes the rows it has read.
pub struct KernelProbe {
    bpf: Ebpf,
    link: Option<(String, XdpLinkId)>,
}

impl KernelProbe {
    /// Load the compiled eBPF object. Must run inside a tokio runtime: the
    /// log forwarder spawns a task per CPU.
    pub fn load(object: &Path) -> Result<Self> {
        let mut bpf = Ebpf::load_file(object)
            .with_context(|| format!("failed to load eBPF object {}", object.display()))?;

        if let Err(e) = EbpfLogger::init(&mut bpf) {
            // Happens when the program carries no log statements.
            tracing::warn!("failed to initialize eBPF logger: {}", e);
        }

        Ok(Self { bpf, link: None })
    }

    pub fn attach(&mut self, iface: &str, mode: XdpMode) -> Result<()> {
        let program: &mut Xdp = self
            .bpf
            .program_mut(XDP_PROGRAM)
            .with_context(|| format!("program {XDP_PROGRAM} not found"))?
            .try_into()
            .context("xdp program has wrong type")?;
        program.load().context("failed to load xdp program")?;
        let link = program.attach(iface, mode.flags()).with_context(|| {
            format!("failed to attach xdp on {iface} in {mode:?} mode - try --xdp-mode skb")
        })?;

        tracing::info!("XDP probe attached to {} ({:?} mode)", iface, mode);
        self.link = Some((iface.to_string(), link));
        Ok(())
    }

    pub fn detach(&mut self) -> Result<()> {
        let Some((iface, link)) = self.link.take() else {
            return Ok(());
        };
        let program: &mut Xdp = self
            .bpf
            .program_mut(XDP_PROGRAM)
            .with_context(|| format!("program {XDP_PROGRAM} not found"))?
            .try_into()
            .context("xdp program has wrong type")?;
        program
            .detach(link)
            .context("failed to detach xdp program")?;
        tracing::info!("XDP probe detached from {}", iface);
        Ok(())
    }

    /// Read every aggregate map.
    ///
    /// With `drain` set, counter rows are deleted after being read and the
    /// protocol slots are zeroed. Increments that land between the read and
    /// the delete of a row are lost. Pending timestamps and overflow counters
    /// are never drained.
    pub fn read(&mut self, drain: bool) -> Result<TableSnapshot> {
        let bpf = &mut self.bpf;
        let rows = TableRows {
            packet_count: hash_rows::<CoarseFlowKey>(bpf, maps::PACKET_COUNT, drain)?,
            byte_volume: hash_rows::<CoarseFlowKey>(bpf, maps::BYTE_VOLUME, drain)?,
            latency: hash_rows::<CoarseFlowKey>(bpf, maps::LATENCY, drain)?,
            gap_count: hash_rows::<CoarseFlowKey>(bpf, maps::GAP_COUNT, drain)?,
            pending_timestamps: hash_rows::<CoarseFlowKey>(bpf, maps::PENDING_TIMESTAMP, false)?
                .len(),
            connection_count: hash_rows::<FineFlowKey>(bpf, maps::CONNECTION_COUNT, drain)?,
            protocol_count: array_rows(bpf, maps::PROTOCOL_COUNT, drain)?,
            drop_count: hash_rows::<u32>(bpf, maps::DROP_COUNT, drain)?,
            overflows: array_rows(bpf, maps::TABLE_OVERFLOWS, false)?,
        };
        Ok(TableSnapshot::from_rows(rows))
    }
}

impl Drop for KernelProbe {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            tracing::error!("{:#}", e);
        }
    }
}

fn hash_rows<K: Pod>(bpf: &mut Ebpf, name: &str, drain: bool) -> Result<Vec<(K, u64)>> {
    let map = bpf
        .map_mut(name)
        .with_context(|| format!("map {name} not found"))?;
    let mut table: HashMap<&mut MapData, K, u64> =
        HashMap::try_from(map).with_context(|| format!("map {name} is not a hash map"))?;

    let rows = table
        .iter()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to iterate map {name}"))?;

    if drain {
        for (key, _) in &rows {
            if let Err(e) = table.remove(key) {
                tracing::debug!("failed to drain row from {}: {}", name, e);
            }
        }
    }
    Ok(rows)
}

fn array_rows(bpf: &mut Ebpf, name: &str, drain: bool) -> Result<Vec<u64>> {
    let map = bpf
        .map_mut(name)
        .with_context(|| format!("map {name} not found"))?;
    let mut array: Array<&mut MapData, u64> =
        Array::try_from(map).with_context(|| format!("map {name} is not an array"))?;

    let values = array
        .iter()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to read map {name}"))?;

    if drain {
        for index in 0..array.len() {
            array
                .set(index, 0u64, 0)
                .with_context(|| format!("failed to reset slot {index} of map {name}"))?;
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xdp_mode_flags() {
        assert_eq!(XdpMode::Skb.flags().bits(), XdpFlags::SKB_MODE.bits());
        assert_eq!(XdpMode::Driver.flags().bits(), XdpFlags::DRV_MODE.bits());
        assert_eq!(XdpMode::Hw.flags().bits(), XdpFlags::HW_MODE.bits());
        assert_eq!(XdpMode::default(), XdpMode::Skb);
    }

    #[test]
    fn test_xdp_mode_from_yaml() {
        let mode: XdpMode = serde_yaml::from_str("driver").unwrap();
        assert_eq!(mode, XdpMode::Driver);
    }
}
