#![no_std]

//! Table schema shared by the XDP probe and the userspace agent.
//!
//! Everything here is part of the map ABI: key layouts, map names, capacities
//! and slot numbering must stay identical on both sides of the boundary.
//! Addresses and ports are stored in host byte order.

pub const ETH_P_IPV4: u16 = 0x0800;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Capacity of every keyed hash table.
pub const FLOW_TABLE_CAPACITY: u32 = 1024;
pub const DROP_TABLE_CAPACITY: u32 = 16;
pub const PROTOCOL_SLOTS: u32 = 2;

pub const PROTO_SLOT_TCP: u32 = 0;
pub const PROTO_SLOT_UDP: u32 = 1;

/// The only drop reason the probe records.
pub const DROP_REASON_GENERIC: u32 = 1;

/// Map names, as declared by the `#[map]` statics in the eBPF program.
pub mod maps {
    pub const PACKET_COUNT: &str = "PACKET_COUNT";
    pub const BYTE_VOLUME: &str = "BYTE_VOLUME";
    pub const LATENCY: &str = "LATENCY";
    pub const GAP_COUNT: &str = "GAP_COUNT";
    pub const PENDING_TIMESTAMP: &str = "PENDING_TIMESTAMP";
    pub const CONNECTION_COUNT: &str = "CONNECTION_COUNT";
    pub const PROTOCOL_COUNT: &str = "PROTOCOL_COUNT";
    pub const DROP_COUNT: &str = "DROP_COUNT";
    pub const TABLE_OVERFLOWS: &str = "TABLE_OVERFLOWS";
}

/// Slot of each aggregate table in the `TABLE_OVERFLOWS` array.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableId {
    PacketCount = 0,
    ByteVolume = 1,
    Latency = 2,
    PendingTimestamp = 3,
    ConnectionCount = 4,
    ProtocolCount = 5,
    DropCount = 6,
    GapCount = 7,
}

impl TableId {
    pub const COUNT: u32 = 8;

    pub const ALL: [TableId; 8] = [
        TableId::PacketCount,
        TableId::ByteVolume,
        TableId::Latency,
        TableId::PendingTimestamp,
        TableId::ConnectionCount,
        TableId::ProtocolCount,
        TableId::DropCount,
        TableId::GapCount,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            TableId::PacketCount => "packet_count",
            TableId::ByteVolume => "byte_volume",
            TableId::Latency => "latency",
            TableId::PendingTimestamp => "pending_timestamp",
            TableId::ConnectionCount => "connection_count",
            TableId::ProtocolCount => "protocol_count",
            TableId::DropCount => "drop_count",
            TableId::GapCount => "gap_count",
        }
    }
}

/// Forwarding decision handed back to the network stack.
///
/// Discriminants are the kernel's `XDP_DROP` / `XDP_PASS` action codes.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Drop = 1,
    Pass = 2,
}

impl Verdict {
    pub const fn action(self) -> u32 {
        self as u32
    }
}

/// Host pair, irrespective of ports and protocol.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct CoarseFlowKey {
    pub src_addr: u32,
    pub dst_addr: u32,
}

impl CoarseFlowKey {
    pub const fn new(src_addr: u32, dst_addr: u32) -> Self {
        Self { src_addr, dst_addr }
    }
}

/// Connection 5-tuple.
///
/// The trailing padding is explicit and always zero: the kernel hashes the
/// raw key bytes, so stray padding would split one flow into many rows.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct FineFlowKey {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    #[cfg_attr(feature = "user", serde(skip))]
    pub _pad: [u8; 3],
}

impl FineFlowKey {
    pub const fn new(
        src_addr: u32,
        dst_addr: u32,
        src_port: u16,
        dst_port: u16,
        protocol: u8,
    ) -> Self {
        Self {
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            protocol,
            _pad: [0; 3],
        }
    }

    pub const fn coarse(&self) -> CoarseFlowKey {
        CoarseFlowKey::new(self.src_addr, self.dst_addr)
    }
}

/// Protocol-count slot for an IP protocol number; `None` for anything that
/// is neither TCP nor UDP.
#[inline(always)]
pub const fn protocol_slot(protocol: u8) -> Option<u32> {
    match protocol {
        IPPROTO_TCP => Some(PROTO_SLOT_TCP),
        IPPROTO_UDP => Some(PROTO_SLOT_UDP),
        _ => None,
    }
}

pub const fn drop_reason_name(code: u32) -> Option<&'static str> {
    match code {
        1 => Some("generic"),
        2 => Some("invalid_ip_header"),
        3 => Some("tcp_checksum_error"),
        4 => Some("udp_checksum_error"),
        _ => None,
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for CoarseFlowKey {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for FineFlowKey {}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn test_key_layouts() {
        assert_eq!(size_of::<CoarseFlowKey>(), 8);
        assert_eq!(size_of::<FineFlowKey>(), 16);
    }

    #[test]
    fn test_protocol_slot() {
        assert_eq!(protocol_slot(IPPROTO_TCP), Some(PROTO_SLOT_TCP));
        assert_eq!(protocol_slot(IPPROTO_UDP), Some(PROTO_SLOT_UDP));
        assert_eq!(protocol_slot(1), None);
        assert_eq!(protocol_slot(47), None);
    }

    #[test]
    fn test_fine_key_projects_to_coarse() {
        let fine = FineFlowKey::new(1, 2, 1000, 80, IPPROTO_TCP);
        assert_eq!(fine.coarse(), CoarseFlowKey::new(1, 2));
        assert_eq!(fine._pad, [0; 3]);
    }

    #[test]
    fn test_verdict_action_codes() {
        assert_eq!(Verdict::Drop.action(), 1);
        assert_eq!(Verdict::Pass.action(), 2);
    }
}
