#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::BPF_NOEXIST,
    helpers::bpf_ktime_get_ns,
    macros::{map, xdp},
    maps::{Array, HashMap},
    programs::XdpContext,
};
use aya_log_ebpf::debug;
use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};
use netinsight_common::{
    protocol_slot, CoarseFlowKey, FineFlowKey, TableId, Verdict, DROP_REASON_GENERIC,
    DROP_TABLE_CAPACITY, FLOW_TABLE_CAPACITY, PROTOCOL_SLOTS,
};
use network_types::{
    eth::{EthHdr, EtherType},
    ip::{IpProto, Ipv4Hdr},
    tcp::TcpHdr,
    udp::UdpHdr,
};

#[no_mangle]
#[link_section = "license"]
pub static _license: [u8; 4] = *b"GPL\0";

#[map]
static PACKET_COUNT: HashMap<CoarseFlowKey, u64> =
    HashMap::with_max_entries(FLOW_TABLE_CAPACITY, 0);

#[map]
static BYTE_VOLUME: HashMap<CoarseFlowKey, u64> =
    HashMap::with_max_entries(FLOW_TABLE_CAPACITY, 0);

// value: sum of inter-arrival gaps in nanoseconds
#[map]
static LATENCY: HashMap<CoarseFlowKey, u64> = HashMap::with_max_entries(FLOW_TABLE_CAPACITY, 0);

// value: number of gaps summed into LATENCY
#[map]
static GAP_COUNT: HashMap<CoarseFlowKey, u64> = HashMap::with_max_entries(FLOW_TABLE_CAPACITY, 0);

// value: timestamp in nanoseconds
#[map]
static PENDING_TIMESTAMP: HashMap<CoarseFlowKey, u64> =
    HashMap::with_max_entries(FLOW_TABLE_CAPACITY, 0);

#[map]
static CONNECTION_COUNT: HashMap<FineFlowKey, u64> =
    HashMap::with_max_entries(FLOW_TABLE_CAPACITY, 0);

#[map]
static PROTOCOL_COUNT: Array<u64> = Array::with_max_entries(PROTOCOL_SLOTS, 0);

#[map]
static DROP_COUNT: HashMap<u32, u64> = HashMap::with_max_entries(DROP_TABLE_CAPACITY, 0);

#[map]
static TABLE_OVERFLOWS: Array<u64> = Array::with_max_entries(TableId::COUNT, 0);

/// XDP entry point.
///
/// The clock is read once per packet, before parsing, so every table update
/// of one invocation sees the same instant.
#[xdp]
pub fn netinsight(ctx: XdpContext) -> u32 {
    let now = unsafe { bpf_ktime_get_ns() };
    let verdict = process_packet(&ctx, now);

    if verdict == Verdict::Drop {
        add(&DROP_COUNT, &DROP_REASON_GENERIC, 1, TableId::DropCount);
    }
    verdict.action()
}

/// Parse and aggregate one frame.
///
/// Every header is bounds-checked before it is read and any failure returns
/// `Verdict::Pass` without touching a map. There are no loops: the verifier
/// sees a straight line of at most three header steps.
#[inline(always)]
fn process_packet(ctx: &XdpContext, now: u64) -> Verdict {
    // -- Ethernet ----------------------------------------------------------
    let data = ctx.data();
    let data_end = ctx.data_end();

    let eth_end = data + EthHdr::LEN;
    if eth_end > data_end {
        return Verdict::Pass;
    }
    let eth_hdr = data as *const EthHdr;
    let ether_type = unsafe { ptr::read_unaligned(ptr::addr_of!((*eth_hdr).ether_type)) };
    if ether_type != EtherType::Ipv4 {
        return Verdict::Pass;
    }

    // -- IPv4 --------------------------------------------------------------
    let ip_start = eth_end;
    let ip_end = ip_start + Ipv4Hdr::LEN;
    if ip_end > data_end {
        return Verdict::Pass;
    }
    let ip_hdr = ip_start as *const Ipv4Hdr;
    let proto = unsafe { ptr::read_unaligned(ptr::addr_of!((*ip_hdr).proto)) };
    let src_addr = u32::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*ip_hdr).src_addr)) });
    let dst_addr = u32::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*ip_hdr).dst_addr)) });

    // -- Transport ---------------------------------------------------------
    // Other protocols keep zero ports and only feed the coarse counters.
    let transport_start = ip_end;
    let (src_port, dst_port) = match proto {
        IpProto::Tcp => {
            let tcp_end = transport_start + TcpHdr::LEN;
            if tcp_end > data_end {
                return Verdict::Pass;
            }
            let tcp_hdr = transport_start as *const TcpHdr;
            (
                u16::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*tcp_hdr).source)) }),
                u16::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*tcp_hdr).dest)) }),
            )
        }
        IpProto::Udp => {
            let udp_end = transport_start + UdpHdr::LEN;
            if udp_end > data_end {
                return Verdict::Pass;
            }
            let udp_hdr = transport_start as *const UdpHdr;
            (
                u16::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*udp_hdr).source)) }),
                u16::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*udp_hdr).dest)) }),
            )
        }
        _ => (0, 0),
    };

    // -- Aggregate ---------------------------------------------------------
    let frame_len = (data_end - data) as u64;
    let coarse = CoarseFlowKey::new(src_addr, dst_addr);

    add(&BYTE_VOLUME, &coarse, frame_len, TableId::ByteVolume);
    add(&PACKET_COUNT, &coarse, 1, TableId::PacketCount);
    debug!(ctx, "packet captured: {:i} -> {:i}", src_addr, dst_addr);

    let Some(slot) = protocol_slot(proto as u8) else {
        return Verdict::Pass;
    };

    let conn = FineFlowKey::new(src_addr, dst_addr, src_port, dst_port, proto as u8);
    add(&CONNECTION_COUNT, &conn, 1, TableId::ConnectionCount);

    match PROTOCOL_COUNT.get_ptr_mut(slot) {
        Some(count) => {
            unsafe { AtomicU64::from_ptr(count) }.fetch_add(1, Ordering::Relaxed);
        }
        None => count_overflow(TableId::ProtocolCount),
    }

    record_gap(&coarse, now);

    Verdict::Pass
}

/// Insert `delta` for `key`, or atomically add it to the existing value.
///
/// `BPF_NOEXIST` makes the insert fail when another CPU created the row
/// between our lookup and our insert; the second lookup then finds it. A miss
/// on the second lookup means the table is full.
#[inline(always)]
fn add<K>(map: &HashMap<K, u64>, key: &K, delta: u64, table: TableId) {
    if let Some(value) = map.get_ptr_mut(key) {
        unsafe { AtomicU64::from_ptr(value) }.fetch_add(delta, Ordering::Relaxed);
        return;
    }
    if map.insert(key, &delta, BPF_NOEXIST as u64).is_ok() {
        return;
    }
    match map.get_ptr_mut(key) {
        Some(value) => {
            unsafe { AtomicU64::from_ptr(value) }.fetch_add(delta, Ordering::Relaxed);
        }
        None => count_overflow(table),
    }
}

/// Alternating inter-arrival gap per host pair.
///
/// The first packet parks its timestamp, the second consumes it. Only the CPU
/// whose delete succeeds adds the gap, so a parked timestamp is counted once.
#[inline(always)]
fn record_gap(key: &CoarseFlowKey, now: u64) {
    match unsafe { PENDING_TIMESTAMP.get(key) } {
        Some(&start) => {
            if PENDING_TIMESTAMP.remove(key).is_ok() {
                add(&LATENCY, key, now.saturating_sub(start), TableId::Latency);
                add(&GAP_COUNT, key, 1, TableId::GapCount);
            }
        }
        None => {
            if PENDING_TIMESTAMP.insert(key, &now, 0).is_err() {
                count_overflow(TableId::PendingTimestamp);
            }
        }
    }
}

#[inline(always)]
fn count_overflow(table: TableId) {
    if let Some(lost) = TABLE_OVERFLOWS.get_ptr_mut(table as u32) {
        unsafe { AtomicU64::from_ptr(lost) }.fetch_add(1, Ordering::Relaxed);
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
