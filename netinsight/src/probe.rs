use std::sync::Arc;
use std::time::Instant;

use crate::aggregator::Aggregator;
use crate::flow;
use crate::tables::AggregateTables;
use crate::verdict::{Outcome, Verdict, VerdictDispatcher};
use crate::walker;

/// Monotonic nanosecond clock read once per packet.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Nanoseconds since the clock was created.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Per-packet entry point of the host pipeline.
///
/// `Probe` is `Sync`: one instance can serve any number of threads, each
/// calling `process` for the frames it receives. The tables are the only
/// state shared between calls.
pub struct Probe<C = MonotonicClock> {
    aggregator: Aggregator,
    dispatcher: VerdictDispatcher,
    clock: C,
}

impl Probe<MonotonicClock> {
    pub fn new(tables: Arc<AggregateTables>) -> Self {
        Self::with_clock(tables, MonotonicClock::default())
    }
}

impl<C: Clock> Probe<C> {
    pub fn with_clock(tables: Arc<AggregateTables>, clock: C) -> Self {
        Self {
            aggregator: Aggregator::new(tables.clone()),
            dispatcher: VerdictDispatcher::new(tables),
            clock,
        }
    }

    pub fn tables(&self) -> &Arc<AggregateTables> {
        self.aggregator.tables()
    }

    pub fn process(&self, frame: &[u8]) -> Verdict {
        self.process_at(frame, self.clock.now_ns())
    }

    /// Run the pipeline as if the frame arrived at `now_ns`.
    pub fn process_at(&self, frame: &[u8], now_ns: u64) -> Verdict {
        let outcome = match walker::walk(frame) {
            None => Outcome::Uninteresting,
            Some(headers) => {
                let keys = flow::extract(&headers);
                Outcome::Aggregated(self.aggregator.record(&keys, headers.frame_len, now_ns))
            }
        };
        self.dispatcher.dispatch(self.dispatcher.decide(&outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct ManualClock(AtomicU64);

    impl Clock for ManualClock {
        fn now_ns(&self) -> u64 {
            self.0.fetch_add(100, Ordering::Relaxed)
        }
    }

    fn udp_frame() -> Vec<u8> {
        let mut buf = vec![0u8; 12];
        buf.extend_from_slice(&0x0800u16.to_be_bytes());
        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        ip[9] = 17;
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 2]);
        buf.extend_from_slice(&ip);
        buf.extend_from_slice(&[0x03, 0xe8, 0x00, 0x35, 0, 8, 0, 0]);
        buf
    }

    #[test]
    fn test_process_reads_clock_per_packet() {
        let tables = Arc::new(AggregateTables::new());
        let probe = Probe::with_clock(tables.clone(), ManualClock(AtomicU64::new(0)));

        assert_eq!(probe.process(&udp_frame()), Verdict::Pass);
        assert_eq!(probe.process(&udp_frame()), Verdict::Pass);

        let snapshot = tables.snapshot();
        assert_eq!(snapshot.flows[0].latency_sum_ns, 100);
        assert_eq!(snapshot.protocols.udp, 2);
    }

    #[test]
    fn test_garbage_passes_untouched() {
        let probe = Probe::new(Arc::new(AggregateTables::new()));

        assert_eq!(probe.process(&[0xff; 10]), Verdict::Pass);
        assert_eq!(probe.process(&udp_frame()[..20]), Verdict::Pass);
        assert!(probe.tables().packet_count.is_empty());
        assert!(probe.tables().byte_volume.is_empty());
    }

    #[test]
    fn test_monotonic_clock_does_not_go_backwards() {
        let clock = MonotonicClock::default();
        let first = clock.now_ns();
        let second = clock.now_ns();
        assert!(second >= first);
    }
}
