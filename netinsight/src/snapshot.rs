use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use netinsight_common::{
    drop_reason_name, CoarseFlowKey, FineFlowKey, TableId, IPPROTO_TCP, IPPROTO_UDP,
    PROTO_SLOT_TCP, PROTO_SLOT_UDP,
};

/// Raw rows read from one set of aggregate tables, kernel maps or host
/// tables alike.
#[derive(Debug, Clone, Default)]
pub struct TableRows {
    pub packet_count: Vec<(CoarseFlowKey, u64)>,
    pub byte_volume: Vec<(CoarseFlowKey, u64)>,
    pub latency: Vec<(CoarseFlowKey, u64)>,
    pub gap_count: Vec<(CoarseFlowKey, u64)>,
    pub pending_timestamps: usize,
    pub connection_count: Vec<(FineFlowKey, u64)>,
    pub protocol_count: Vec<u64>,
    pub drop_count: Vec<(u32, u64)>,
    /// Lost inserts indexed by `TableId`.
    pub overflows: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FlowStats {
    pub src_ip: String,
    pub dst_ip: String,
    pub packets: u64,
    pub bytes: u64,
    /// Sum of alternating inter-arrival gaps, not a round-trip time.
    pub latency_sum_ns: u64,
    /// Gaps summed into `latency_sum_ns`.
    pub gaps: u64,
    pub mean_gap_ns: Option<u64>,
    pub avg_packet_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConnectionStats {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: String,
    pub packets: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ProtocolStats {
    pub tcp: u64,
    pub udp: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DropStats {
    pub code: u32,
    pub reason: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OverflowStats {
    pub table: &'static str,
    pub lost: u64,
}

/// Reader-side view of every aggregate table at one instant.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableSnapshot {
    /// Unix timestamp in milliseconds.
    pub taken_at: i64,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub flows: Vec<FlowStats>,
    pub connections: Vec<ConnectionStats>,
    pub protocols: ProtocolStats,
    pub drops: Vec<DropStats>,
    pub pending_timestamps: usize,
    pub overflows: Vec<OverflowStats>,
}

#[derive(Default)]
struct FlowTotals {
    packets: u64,
    bytes: u64,
    latency: u64,
    gaps: u64,
}

impl TableSnapshot {
    pub fn from_rows(rows: TableRows) -> Self {
        let mut totals: BTreeMap<CoarseFlowKey, FlowTotals> = BTreeMap::new();
        for (key, packets) in rows.packet_count {
            totals.entry(key).or_default().packets = packets;
        }
        for (key, bytes) in rows.byte_volume {
            totals.entry(key).or_default().bytes = bytes;
        }
        for (key, latency) in rows.latency {
            totals.entry(key).or_default().latency = latency;
        }
        for (key, gaps) in rows.gap_count {
            totals.entry(key).or_default().gaps = gaps;
        }

        let mut flows: Vec<FlowStats> = totals
            .into_iter()
            .map(|(key, t)| FlowStats {
                src_ip: Ipv4Addr::from(key.src_addr).to_string(),
                dst_ip: Ipv4Addr::from(key.dst_addr).to_string(),
                packets: t.packets,
                bytes: t.bytes,
                latency_sum_ns: t.latency,
                gaps: t.gaps,
                mean_gap_ns: t.latency.checked_div(t.gaps),
                avg_packet_bytes: t.bytes.checked_div(t.packets),
            })
            .collect();
        // Stable sort keeps key order among equal counts.
        flows.sort_by(|a, b| b.packets.cmp(&a.packets));

        let mut connection_rows = rows.connection_count;
        connection_rows.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let connections = connection_rows
            .into_iter()
            .map(|(key, packets)| ConnectionStats {
                src_ip: Ipv4Addr::from(key.src_addr).to_string(),
                dst_ip: Ipv4Addr::from(key.dst_addr).to_string(),
                src_port: key.src_port,
                dst_port: key.dst_port,
                protocol: protocol_name(key.protocol),
                packets,
            })
            .collect();

        let slot = |index: u32| {
            rows.protocol_count
                .get(index as usize)
                .copied()
                .unwrap_or(0)
        };
        let protocols = ProtocolStats {
            tcp: slot(PROTO_SLOT_TCP),
            udp: slot(PROTO_SLOT_UDP),
        };

        let mut drop_rows = rows.drop_count;
        drop_rows.sort();
        let drops = drop_rows
            .into_iter()
            .map(|(code, count)| DropStats {
                code,
                reason: drop_reason_name(code)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("unknown({})", code)),
                count,
            })
            .collect();

        let overflows = TableId::ALL
            .iter()
            .zip(rows.overflows.iter().chain(std::iter::repeat(&0u64)))
            .map(|(table, lost)| OverflowStats {
                table: table.name(),
                lost: *lost,
            })
            .collect();

        Self {
            taken_at: chrono::Utc::now().timestamp_millis(),
            total_packets: flows.iter().map(|f| f.packets).sum(),
            total_bytes: flows.iter().map(|f| f.bytes).sum(),
            flows,
            connections,
            protocols,
            drops,
            pending_timestamps: rows.pending_timestamps,
            overflows,
        }
    }

    pub fn total_overflows(&self) -> u64 {
        self.overflows.iter().map(|o| o.lost).sum()
    }
}

pub fn protocol_name(protocol: u8) -> String {
    match protocol {
        IPPROTO_TCP => "TCP".to_string(),
        IPPROTO_UDP => "UDP".to_string(),
        other => format!("IP({})", other),
    }
}
