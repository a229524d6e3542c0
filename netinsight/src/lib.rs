//! Host side of the netinsight probe.
//!
//! The per-packet pipeline (header walk, flow keys, aggregation, verdict)
//! runs here over plain byte slices with the same semantics as the XDP
//! program, against tables injected by the caller. The agent binary uses the
//! loader to attach the kernel probe and read its maps into the same
//! [`snapshot::TableSnapshot`] shape.

pub mod aggregator;
pub mod flow;
pub mod loader;
pub mod probe;
pub mod snapshot;
pub mod table;
pub mod tables;
pub mod verdict;
pub mod walker;

pub use probe::{Clock, MonotonicClock, Probe};
pub use tables::AggregateTables;
pub use verdict::Verdict;
