use std::sync::Arc;

pub use netinsight_common::Verdict;
use netinsight_common::DROP_REASON_GENERIC;

use crate::aggregator::Update;
use crate::tables::AggregateTables;

/// How far the pipeline got with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The header walk stopped early.
    Uninteresting,
    Aggregated(Update),
}

/// Chooses the forwarding action and accounts for drops.
pub struct VerdictDispatcher {
    tables: Arc<AggregateTables>,
}

impl VerdictDispatcher {
    pub fn new(tables: Arc<AggregateTables>) -> Self {
        Self { tables }
    }

    /// Every outcome passes. The probe observes traffic, it never filters
    /// it, so `Verdict::Drop` is not produced here.
    pub fn decide(&self, outcome: &Outcome) -> Verdict {
        match outcome {
            Outcome::Uninteresting => Verdict::Pass,
            Outcome::Aggregated(_) => Verdict::Pass,
        }
    }

    /// Hand `verdict` back to the caller, counting it first when it drops.
    pub fn dispatch(&self, verdict: Verdict) -> Verdict {
        if verdict == Verdict::Drop {
            if let Err(err) = self.tables.drop_count.add(DROP_REASON_GENERIC, 1) {
                tracing::trace!(%err, "drop not counted");
            }
        }
        verdict
    }
}
