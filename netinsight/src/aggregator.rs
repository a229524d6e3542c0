use std::net::Ipv4Addr;
use std::sync::Arc;

use netinsight_common::CoarseFlowKey;

use crate::flow::FlowKeys;
use crate::table::TableError;
use crate::tables::AggregateTables;

/// What one packet did to the tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Update {
    /// The packet created the packet-count row of its host pair.
    pub new_flow: bool,
    /// Gap consumed from a pending timestamp, if this packet closed one.
    pub gap_ns: Option<u64>,
    /// Table updates dropped because a table was full.
    pub lost: u32,
}

/// Applies one validated packet to every applicable aggregate table.
pub struct Aggregator {
    tables: Arc<AggregateTables>,
}

impl Aggregator {
    pub fn new(tables: Arc<AggregateTables>) -> Self {
        Self { tables }
    }

    pub fn tables(&self) -> &Arc<AggregateTables> {
        &self.tables
    }

    /// Byte volume and packet count apply to every IPv4 packet. Connection
    /// count, protocol count and the gap measurement apply to TCP and UDP
    /// only.
    pub fn record(&self, keys: &FlowKeys, frame_len: u64, now_ns: u64) -> Update {
        let tables = &*self.tables;
        let mut update = Update::default();

        update.lost += note_loss(tables.byte_volume.add(keys.coarse, frame_len));

        match tables.packet_count.add(keys.coarse, 1) {
            Ok(1) => {
                update.new_flow = true;
                trace_flow("new flow", &keys.coarse, 1);
            }
            Ok(packets) => trace_flow("flow updated", &keys.coarse, packets),
            Err(err) => update.lost += note_loss::<u64>(Err(err)),
        }

        let Some(slot) = keys.slot else {
            return update;
        };

        update.lost += note_loss(tables.connection_count.add(keys.fine, 1));
        update.lost += note_loss(tables.protocol_count.add(slot, 1));
        update.gap_ns = self.record_gap(keys.coarse, now_ns, &mut update.lost);

        update
    }

    /// Alternating inter-arrival measurement: the first packet of a pair parks
    /// its timestamp, the next one consumes it. `take` removes the row
    /// atomically, so a parked timestamp feeds exactly one gap.
    fn record_gap(&self, key: CoarseFlowKey, now_ns: u64, lost: &mut u32) -> Option<u64> {
        let tables = &*self.tables;
        match tables.pending_timestamp.take(&key) {
            Some(start) => {
                let gap = now_ns.saturating_sub(start);
                *lost += note_loss(tables.latency.add(key, gap));
                *lost += note_loss(tables.gap_count.add(key, 1));
                Some(gap)
            }
            None => {
                *lost += note_loss(tables.pending_timestamp.insert(key, now_ns));
                None
            }
        }
    }
}

/// Table-full errors are absorbed here; the table's overflow counter already
/// recorded them.
fn note_loss<T>(result: Result<T, TableError>) -> u32 {
    match result {
        Ok(_) => 0,
        Err(err) => {
            tracing::trace!(%err, "aggregate update lost");
            1
        }
    }
}

fn trace_flow(event: &'static str, key: &CoarseFlowKey, packets: u64) {
    tracing::trace!(
        src = %Ipv4Addr::from(key.src_addr),
        dst = %Ipv4Addr::from(key.dst_addr),
        packets,
        "{}",
        event
    );
}
