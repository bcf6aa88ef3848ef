//! Per-tick accounting

use crate::article::Stage;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// What one tick (or a run of ticks) did.
///
/// Every claimed item ends in exactly one of `committed`, `duplicates`,
/// `deferred`, `quarantined` or `lost`, unless the tick aborted on a store
/// error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub stage: Stage,
    pub worker_id: String,
    pub claimed: usize,
    pub committed: usize,
    /// Commits that found the downstream row already written
    pub duplicates: usize,
    pub deferred: usize,
    pub quarantined: usize,
    /// Items whose claim another worker took over before they were started
    pub lost: usize,
    #[serde(with = "millis")]
    pub elapsed: Duration,
}

impl TickReport {
    pub fn new(stage: Stage, worker_id: impl Into<String>) -> Self {
        Self {
            stage,
            worker_id: worker_id.into(),
            claimed: 0,
            committed: 0,
            duplicates: 0,
            deferred: 0,
            quarantined: 0,
            lost: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }

    /// Items that reached a final outcome this tick.
    pub fn settled(&self) -> usize {
        self.committed + self.duplicates + self.deferred + self.quarantined + self.lost
    }

    /// Fold another report into running totals.
    pub fn absorb(&mut self, other: &TickReport) {
        self.claimed += other.claimed;
        self.committed += other.committed;
        self.duplicates += other.duplicates;
        self.deferred += other.deferred;
        self.quarantined += other.quarantined;
        self.lost += other.lost;
        self.elapsed += other.elapsed;
    }
}

impl fmt::Display for TickReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}]: claimed {}, committed {}, duplicates {}, deferred {}, quarantined {}, lost {} in {:?}",
            self.stage,
            self.worker_id,
            self.claimed,
            self.committed,
            self.duplicates,
            self.deferred,
            self.quarantined,
            self.lost,
            self.elapsed
        )
    }
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
