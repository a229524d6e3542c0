use std::sync::Arc;
use std::thread;

use netinsight::{AggregateTables, Probe, Verdict};
use netinsight_common::{CoarseFlowKey, FineFlowKey, DROP_REASON_GENERIC, IPPROTO_TCP, IPPROTO_UDP};

const A: [u8; 4] = [10, 0, 0, 1];
const B: [u8; 4] = [10, 0, 0, 2];

/// Ethernet + 20-byte IPv4 header + optional transport header, padded with
/// payload bytes up to `len`.
fn frame(src: [u8; 4], dst: [u8; 4], protocol: u8, ports: Option<(u16, u16)>, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; 12];
    buf.extend_from_slice(&0x0800u16.to_be_bytes());

    let mut ip = [0u8; 20];
    ip[0] = 0x45;
    ip[8] = 64;
    ip[9] = protocol;
    ip[12..16].copy_from_slice(&src);
    ip[16..20].copy_from_slice(&dst);
    buf.extend_from_slice(&ip);

    if let Some((sport, dport)) = ports {
        let header_len = if protocol == IPPROTO_TCP { 20 } else { 8 };
        let mut transport = vec![0u8; header_len];
        transport[0..2].copy_from_slice(&sport.to_be_bytes());
        transport[2..4].copy_from_slice(&dport.to_be_bytes());
        buf.extend_from_slice(&transport);
    }

    assert!(len >= buf.len(), "frame length {len} shorter than headers");
    buf.resize(len, 0);
    buf
}

fn tcp(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, len: usize) -> Vec<u8> {
    frame(src, dst, IPPROTO_TCP, Some((sport, dport)), len)
}

fn udp(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, len: usize) -> Vec<u8> {
    frame(src, dst, IPPROTO_UDP, Some((sport, dport)), len)
}

fn coarse(src: [u8; 4], dst: [u8; 4]) -> CoarseFlowKey {
    CoarseFlowKey::new(u32::from_be_bytes(src), u32::from_be_bytes(dst))
}

fn probe() -> Probe {
    Probe::new(Arc::new(AggregateTables::new()))
}

#[test]
fn test_scenario_a_untransported_packets_feed_coarse_counters() {
    let probe = probe();
    // GRE: IPv4 but neither TCP nor UDP.
    assert_eq!(probe.process_at(&frame(A, B, 47, None, 100), 0), Verdict::Pass);
    assert_eq!(probe.process_at(&frame(A, B, 47, None, 200), 10), Verdict::Pass);

    let tables = probe.tables();
    assert_eq!(tables.packet_count.get(&coarse(A, B)), Some(2));
    assert_eq!(tables.byte_volume.get(&coarse(A, B)), Some(300));
    assert!(tables.connection_count.is_empty());
    assert_eq!(tables.protocol_count.values(), vec![0, 0]);
}

#[test]
fn test_scenario_b_connections_and_protocol_slots() {
    let probe = probe();
    probe.process_at(&tcp(A, B, 1000, 80, 60), 0);
    probe.process_at(&udp(A, B, 1000, 53, 60), 1);

    let tables = probe.tables();
    let a = u32::from_be_bytes(A);
    let b = u32::from_be_bytes(B);
    assert_eq!(tables.connection_count.len(), 2);
    assert_eq!(
        tables.connection_count.get(&FineFlowKey::new(a, b, 1000, 80, IPPROTO_TCP)),
        Some(1)
    );
    assert_eq!(
        tables.connection_count.get(&FineFlowKey::new(a, b, 1000, 53, IPPROTO_UDP)),
        Some(1)
    );
    assert_eq!(tables.protocol_count.values(), vec![1, 1]);
}

#[test]
fn test_scenario_c_gap_between_two_packets() {
    let probe = probe();
    probe.process_at(&tcp(A, B, 1000, 80, 60), 0);
    assert_eq!(probe.tables().pending_timestamp.get(&coarse(A, B)), Some(0));

    probe.process_at(&tcp(A, B, 1000, 80, 60), 500);

    let tables = probe.tables();
    assert_eq!(tables.latency.get(&coarse(A, B)), Some(500));
    assert_eq!(tables.pending_timestamp.get(&coarse(A, B)), None);
}

#[test]
fn test_scenario_d_capacity_boundary() {
    let probe = probe();
    for i in 0..1025u32 {
        let src = (0x0a00_0000 + i).to_be_bytes();
        probe.process_at(&frame(src, B, 47, None, 64), u64::from(i));
    }

    let tables = probe.tables();
    assert_eq!(tables.packet_count.len(), 1024);
    assert!(tables.packet_count.entries().iter().all(|(_, count)| *count == 1));
    let last = coarse((0x0a00_0000u32 + 1024).to_be_bytes(), B);
    assert_eq!(tables.packet_count.get(&last), None);
    assert_eq!(tables.packet_count.overflows(), 1);
    assert_eq!(tables.byte_volume.overflows(), 1);
}

#[test]
fn test_invalid_frames_pass_without_mutation() {
    let probe = probe();
    let mut ipv6 = tcp(A, B, 1, 2, 60);
    ipv6[12..14].copy_from_slice(&0x86ddu16.to_be_bytes());
    let full = tcp(A, B, 1, 2, 54);

    assert_eq!(probe.process_at(&ipv6, 0), Verdict::Pass);
    assert_eq!(probe.process_at(&full[..13], 0), Verdict::Pass);
    assert_eq!(probe.process_at(&full[..30], 0), Verdict::Pass);
    assert_eq!(probe.process_at(&full[..53], 0), Verdict::Pass);

    let snapshot = probe.tables().snapshot();
    assert_eq!(snapshot.total_packets, 0);
    assert!(snapshot.flows.is_empty());
    assert_eq!(snapshot.pending_timestamps, 0);
}

#[test]
fn test_counts_and_bytes_per_key() {
    let probe = probe();
    let sizes = [60usize, 1500, 64, 900, 128];
    for (i, len) in sizes.iter().enumerate() {
        probe.process_at(&udp(A, B, 5000, 53, *len), i as u64 * 10);
    }
    probe.process_at(&udp(B, A, 53, 5000, 80), 100);

    let tables = probe.tables();
    assert_eq!(tables.packet_count.get(&coarse(A, B)), Some(5));
    assert_eq!(tables.byte_volume.get(&coarse(A, B)), Some(sizes.iter().sum::<usize>() as u64));
    assert_eq!(tables.packet_count.get(&coarse(B, A)), Some(1));
}

#[test]
fn test_protocol_slots_count_only_tcp_and_udp() {
    let probe = probe();
    probe.process_at(&tcp(A, B, 1, 2, 60), 0);
    probe.process_at(&tcp(A, B, 1, 2, 60), 0);
    probe.process_at(&udp(A, B, 1, 2, 60), 0);
    probe.process_at(&frame(A, B, 1, None, 60), 0);
    probe.process_at(&frame(A, B, 47, None, 60), 0);

    let slots = probe.tables().protocol_count.values();
    assert_eq!(slots, vec![2, 1]);
    assert_eq!(slots.iter().sum::<u64>(), 3);
}

#[test]
fn test_pending_timestamp_parity() {
    let probe = probe();
    let even = coarse(A, B);
    let odd = coarse(B, A);
    for t in 0..6 {
        probe.process_at(&tcp(A, B, 1, 2, 60), t * 100);
    }
    for t in 0..3 {
        probe.process_at(&udp(B, A, 2, 1, 60), t * 100);
    }

    let tables = probe.tables();
    assert_eq!(tables.pending_timestamp.get(&even), None);
    assert_eq!(tables.pending_timestamp.get(&odd), Some(200));
    assert_eq!(tables.pending_timestamp.len(), 1);
    // Gaps (0→100), (200→300), (400→500).
    assert_eq!(tables.latency.get(&even), Some(300));
    assert_eq!(tables.latency.get(&odd), Some(100));
}

#[test]
fn test_drop_table_stays_empty() {
    let probe = probe();
    for t in 0..50 {
        probe.process_at(&tcp(A, B, 1000, 80, 60), t);
        probe.process_at(&frame(A, B, 1, None, 60), t);
        probe.process_at(&[0u8; 8], t);
    }

    let tables = probe.tables();
    assert!(tables.drop_count.is_empty());
    assert_eq!(tables.drop_count.get(&DROP_REASON_GENERIC), None);
    assert!(tables.snapshot().drops.is_empty());
}

#[test]
fn test_replay_is_deterministic() {
    let packets: Vec<(Vec<u8>, u64)> = (0..40u16)
        .map(|i| {
            let src = [10, 0, 0, (i % 4) as u8];
            let pkt = if i % 3 == 0 {
                udp(src, B, 4000 + i, 53, 60 + i as usize)
            } else {
                tcp(src, B, 4000 + i % 2, 443, 100 + i as usize)
            };
            (pkt, u64::from(i) * 37)
        })
        .collect();

    let run = || {
        let probe = probe();
        for (pkt, at) in &packets {
            probe.process_at(pkt, *at);
        }
        let tables = probe.tables();
        let mut counts = tables.packet_count.entries();
        let mut bytes = tables.byte_volume.entries();
        let mut latency = tables.latency.entries();
        let mut pending = tables.pending_timestamp.entries();
        let mut conns = tables.connection_count.entries();
        counts.sort();
        bytes.sort();
        latency.sort();
        pending.sort();
        conns.sort();
        (counts, bytes, latency, pending, conns, tables.protocol_count.values())
    };

    assert_eq!(run(), run());
}

#[test]
fn test_concurrent_processing_loses_no_increments() {
    let probe = Arc::new(probe());
    let threads: Vec<_> = (0..8u16)
        .map(|t| {
            let probe = probe.clone();
            thread::spawn(move || {
                let pkt = tcp(A, B, 1000 + t, 80, 100);
                for _ in 0..500 {
                    assert_eq!(probe.process(&pkt), Verdict::Pass);
                }
            })
        })
        .collect();
    for handle in threads {
        handle.join().unwrap();
    }

    let tables = probe.tables();
    assert_eq!(tables.packet_count.get(&coarse(A, B)), Some(4000));
    assert_eq!(tables.byte_volume.get(&coarse(A, B)), Some(400_000));
    assert_eq!(tables.connection_count.len(), 8);
    assert!(tables
        .connection_count
        .entries()
        .iter()
        .all(|(_, count)| *count == 500));
    assert_eq!(tables.protocol_count.values(), vec![4000, 0]);
    // Racing first packets may overwrite each other's parked timestamp, but
    // one pair never parks more than one row.
    assert!(tables.pending_timestamp.len() <= 1);
}

#[test]
fn test_snapshot_after_traffic() {
    let probe = probe();
    probe.process_at(&tcp(A, B, 1000, 80, 100), 0);
    probe.process_at(&tcp(A, B, 1000, 80, 200), 1_000);
    probe.process_at(&udp(A, B, 1000, 53, 50), 2_000);

    let snapshot = probe.tables().snapshot();
    assert_eq!(snapshot.total_packets, 3);
    assert_eq!(snapshot.total_bytes, 350);
    assert_eq!(snapshot.flows.len(), 1);
    assert_eq!(snapshot.flows[0].src_ip, "10.0.0.1");
    assert_eq!(snapshot.flows[0].latency_sum_ns, 1_000);
    assert_eq!(snapshot.flows[0].mean_gap_ns, Some(1_000));
    assert_eq!(snapshot.connections.len(), 2);
    assert_eq!(snapshot.connections[0].packets, 2);
    assert_eq!(snapshot.protocols.tcp, 2);
    assert_eq!(snapshot.protocols.udp, 1);
    assert_eq!(snapshot.pending_timestamps, 1);
    assert_eq!(snapshot.total_overflows(), 0);
}

#[test]
fn test_mean_gap_ignores_untracked_packets() {
    let probe = probe();
    probe.process_at(&tcp(A, B, 1000, 80, 100), 0);
    probe.process_at(&frame(A, B, 1, None, 100), 200);
    probe.process_at(&tcp(A, B, 1000, 80, 100), 1_000);
    probe.process_at(&frame(A, B, 1, None, 100), 1_200);

    let snapshot = probe.tables().snapshot();
    let flow = &snapshot.flows[0];
    assert_eq!(flow.packets, 4);
    assert_eq!(flow.latency_sum_ns, 1_000);
    assert_eq!(flow.gaps, 1);
    assert_eq!(flow.mean_gap_ns, Some(1_000));
    assert_eq!(flow.avg_packet_bytes, Some(100));
}

#[test]
fn test_mean_gap_across_drain() {
    let probe = probe();
    // Parks a timestamp that survives the drain.
    probe.process_at(&tcp(A, B, 1000, 80, 60), 0);
    let first = probe.tables().drain();
    assert_eq!(first.pending_timestamps, 1);
    assert_eq!(first.flows[0].mean_gap_ns, None);

    probe.process_at(&tcp(A, B, 1000, 80, 60), 1_000);
    probe.process_at(&tcp(A, B, 1000, 80, 60), 2_000);
    probe.process_at(&tcp(A, B, 1000, 80, 60), 2_500);

    let window = probe.tables().drain();
    let flow = &window.flows[0];
    assert_eq!(flow.packets, 3);
    assert_eq!(flow.latency_sum_ns, 1_500);
    assert_eq!(flow.gaps, 2);
    assert_eq!(flow.mean_gap_ns, Some(750));
}
