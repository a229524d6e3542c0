use netinsight_common::{
    CoarseFlowKey, FineFlowKey, TableId, DROP_TABLE_CAPACITY, FLOW_TABLE_CAPACITY,
    PROTOCOL_SLOTS,
};

use crate::snapshot::{TableRows, TableSnapshot};
use crate::table::{CounterTable, SlotTable};

/// The aggregate tables of one attached probe.
///
/// Owned by whoever attaches the probe and handed to the pipeline as an
/// `Arc`; the pipeline only creates, updates and deletes rows.
pub struct AggregateTables {
    pub packet_count: CounterTable<CoarseFlowKey>,
    pub byte_volume: CounterTable<CoarseFlowKey>,
    /// Sum of alternating inter-arrival gaps in nanoseconds. This is not a
    /// round-trip time.
    pub latency: CounterTable<CoarseFlowKey>,
    /// Number of gaps summed into `latency`, per host pair.
    pub gap_count: CounterTable<CoarseFlowKey>,
    pub pending_timestamp: CounterTable<CoarseFlowKey>,
    pub connection_count: CounterTable<FineFlowKey>,
    pub protocol_count: SlotTable,
    pub drop_count: CounterTable<u32>,
}

impl Default for AggregateTables {
    fn default() -> Self {
        Self::with_flow_capacity(FLOW_TABLE_CAPACITY as usize)
    }
}

impl AggregateTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tables with a non-default capacity for the keyed flow tables. The
    /// protocol and drop tables keep their fixed sizes.
    pub fn with_flow_capacity(capacity: usize) -> Self {
        Self {
            packet_count: CounterTable::with_capacity(TableId::PacketCount.name(), capacity),
            byte_volume: CounterTable::with_capacity(TableId::ByteVolume.name(), capacity),
            latency: CounterTable::with_capacity(TableId::Latency.name(), capacity),
            gap_count: CounterTable::with_capacity(TableId::GapCount.name(), capacity),
            pending_timestamp: CounterTable::with_capacity(
                TableId::PendingTimestamp.name(),
                capacity,
            ),
            connection_count: CounterTable::with_capacity(
                TableId::ConnectionCount.name(),
                capacity,
            ),
            protocol_count: SlotTable::new(TableId::ProtocolCount.name(), PROTOCOL_SLOTS),
            drop_count: CounterTable::with_capacity(
                TableId::DropCount.name(),
                DROP_TABLE_CAPACITY as usize,
            ),
        }
    }

    /// Lost inserts per table, in `TableId` order. The protocol table is an
    /// array and never overflows.
    pub fn overflows(&self) -> [u64; TableId::COUNT as usize] {
        [
            self.packet_count.overflows(),
            self.byte_volume.overflows(),
            self.latency.overflows(),
            self.pending_timestamp.overflows(),
            self.connection_count.overflows(),
            0,
            self.drop_count.overflows(),
            self.gap_count.overflows(),
        ]
    }

    pub fn snapshot(&self) -> TableSnapshot {
        TableSnapshot::from_rows(TableRows {
            packet_count: self.packet_count.entries(),
            byte_volume: self.byte_volume.entries(),
            latency: self.latency.entries(),
            gap_count: self.gap_count.entries(),
            pending_timestamps: self.pending_timestamp.len(),
            connection_count: self.connection_count.entries(),
            protocol_count: self.protocol_count.values(),
            drop_count: self.drop_count.entries(),
            overflows: self.overflows().to_vec(),
        })
    }

    /// Snapshot and reset the counters, the way a reader drains the kernel
    /// maps. Pending timestamps are left in place so an in-progress gap
    /// measurement survives the drain.
    pub fn drain(&self) -> TableSnapshot {
        TableSnapshot::from_rows(TableRows {
            packet_count: self.packet_count.drain(),
            byte_volume: self.byte_volume.drain(),
            latency: self.latency.drain(),
            gap_count: self.gap_count.drain(),
            pending_timestamps: self.pending_timestamp.len(),
            connection_count: self.connection_count.drain(),
            protocol_count: self.protocol_count.drain(),
            drop_count: self.drop_count.drain(),
            overflows: self.overflows().to_vec(),
        })
    }
}
