/// Batch domain model and status state machine
///
/// A batch is one configured, repeatable test-execution slot on a station.
/// Progress and step events are scoped to one run by `execution_id`; events
/// from prior runs are discarded by the reconciler's identity guard.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable string identity of a batch
pub type BatchId = String;

/// Batch lifecycle status
///
/// `idle → starting → running → stopping → idle|completed|error`;
/// `completed`/`error` may re-enter `starting` on a re-run. No state is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Idle,
    Starting,
    Running,
    Stopping,
    Completed,
    Error,
}

impl BatchStatus {
    /// A run is in flight (push-derived fields take precedence over snapshots)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// The execution cursor is meaningful in this status
    pub fn has_cursor(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    /// Transition guard for push-derived status changes.
    ///
    /// The discard pairs encode races with optimistic local mutation and
    /// out-of-order delivery; everything else applies.
    pub fn accepts(&self, next: BatchStatus) -> bool {
        match (self, next) {
            (Self::Completed, n) if !matches!(n, Self::Completed | Self::Error | Self::Starting) => {
                false
            }
            (Self::Starting, Self::Idle) => false,
            (Self::Stopping, Self::Running) => false,
            _ => true,
        }
    }
}

/// Status of one sequence step within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
}

/// One sequence step, keyed by (name, order)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStep {
    pub order: u32,
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// One line of the per-batch run log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level: level.into(),
            message: message.into(),
        }
    }
}

/// One execution slot as observed by the dashboard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub status: BatchStatus,
    /// Fraction of the current run in [0, 1]; non-decreasing within one run
    pub progress: f64,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub step_index: Option<u32>,
    #[serde(default)]
    pub total_steps: Option<u32>,
    /// Opaque token for one run; scopes progress/step events to that run
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub steps: Vec<BatchStep>,
    /// Verdict of the last completed run, independent of the current run
    #[serde(default)]
    pub last_run_passed: Option<bool>,
    /// Seconds elapsed in the current run
    #[serde(default)]
    pub elapsed: f64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub station: Option<String>,
    #[serde(default)]
    pub sequence: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<LogEntry>,
}

impl Batch {
    /// Placeholder created on first observation of an unseen id
    pub fn placeholder(id: impl Into<BatchId>) -> Self {
        Self {
            id: id.into(),
            status: BatchStatus::Idle,
            progress: 0.0,
            current_step: None,
            step_index: None,
            total_steps: None,
            execution_id: None,
            steps: Vec::new(),
            last_run_passed: None,
            elapsed: 0.0,
            name: None,
            station: None,
            sequence: None,
            log: Vec::new(),
        }
    }

    /// Apply an admitted status transition.
    ///
    /// Entering starting/running from outside a run resets the run-scoped
    /// fields; completion forces progress to 1.
    pub fn apply_status(&mut self, next: BatchStatus) {
        let entering_run = matches!(next, BatchStatus::Starting | BatchStatus::Running)
            && !matches!(self.status, BatchStatus::Starting | BatchStatus::Running);
        if entering_run {
            self.progress = 0.0;
            self.elapsed = 0.0;
        }

        self.status = next;

        if next == BatchStatus::Completed {
            self.progress = 1.0;
        }
    }

    /// Record push-derived progress; never regresses within the current run
    pub fn record_progress(&mut self, incoming: f64) {
        if incoming > self.progress {
            self.progress = incoming.min(1.0);
        }
    }

    /// Update or insert a step by its (name, order) key, keeping order sorted
    pub fn upsert_step(&mut self, order: u32, name: &str, update: impl FnOnce(&mut BatchStep)) {
        if let Some(step) = self
            .steps
            .iter_mut()
            .find(|s| s.order == order && s.name == name)
        {
            update(step);
            return;
        }

        let mut step = BatchStep {
            order,
            name: name.to_string(),
            status: StepStatus::Pending,
            pass: None,
            duration: None,
            result: None,
        };
        update(&mut step);
        self.steps.push(step);
        self.steps.sort_by_key(|s| s.order);
    }

    /// Append a log entry, bounded by `capacity`
    pub fn push_log(&mut self, entry: LogEntry, capacity: usize) {
        self.log.push(entry);
        if self.log.len() > capacity {
            let overflow = self.log.len() - capacity;
            self.log.drain(..overflow);
        }
    }

    /// Merge an authoritative snapshot under the push-precedence policy.
    ///
    /// While a run is in flight the push-derived fields (status, cursor,
    /// progress, execution id) win and only snapshot metadata is adopted.
    /// Once settled, the snapshot is authoritative. The local run log is
    /// retained either way; snapshots carry no log history.
    pub fn merge_snapshot(&mut self, snapshot: Batch) {
        if self.status.is_active() {
            if snapshot.name.is_some() {
                self.name = snapshot.name;
            }
            if snapshot.station.is_some() {
                self.station = snapshot.station;
            }
            if snapshot.sequence.is_some() {
                self.sequence = snapshot.sequence;
            }
            if snapshot.last_run_passed.is_some() {
                self.last_run_passed = snapshot.last_run_passed;
            }
        } else {
            let log = std::mem::take(&mut self.log);
            *self = snapshot;
            if self.log.is_empty() {
                self.log = log;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_accepts_normal_lifecycle() {
        assert!(BatchStatus::Idle.accepts(BatchStatus::Starting));
        assert!(BatchStatus::Starting.accepts(BatchStatus::Running));
        assert!(BatchStatus::Running.accepts(BatchStatus::Stopping));
        assert!(BatchStatus::Stopping.accepts(BatchStatus::Idle));
        assert!(BatchStatus::Running.accepts(BatchStatus::Completed));
        assert!(BatchStatus::Running.accepts(BatchStatus::Error));
    }

    #[test]
    fn test_status_rerun_from_settled_states() {
        assert!(BatchStatus::Completed.accepts(BatchStatus::Starting));
        assert!(BatchStatus::Error.accepts(BatchStatus::Starting));
    }

    #[test]
    fn test_status_discard_pairs() {
        assert!(!BatchStatus::Completed.accepts(BatchStatus::Running));
        assert!(!BatchStatus::Completed.accepts(BatchStatus::Idle));
        assert!(!BatchStatus::Completed.accepts(BatchStatus::Stopping));
        assert!(BatchStatus::Completed.accepts(BatchStatus::Error));
        assert!(!BatchStatus::Starting.accepts(BatchStatus::Idle));
        assert!(!BatchStatus::Stopping.accepts(BatchStatus::Running));
    }

    #[test]
    fn test_apply_status_resets_run_fields_on_entry() {
        let mut batch = Batch::placeholder("b1");
        batch.progress = 0.8;
        batch.elapsed = 42.0;
        batch.status = BatchStatus::Completed;

        batch.apply_status(BatchStatus::Starting);

        assert_eq!(batch.status, BatchStatus::Starting);
        assert_eq!(batch.progress, 0.0);
        assert_eq!(batch.elapsed, 0.0);
    }

    #[test]
    fn test_apply_status_no_reset_within_run() {
        let mut batch = Batch::placeholder("b1");
        batch.apply_status(BatchStatus::Starting);
        batch.record_progress(0.4);

        batch.apply_status(BatchStatus::Running);

        assert_eq!(batch.progress, 0.4);
    }

    #[test]
    fn test_completed_forces_full_progress() {
        let mut batch = Batch::placeholder("b1");
        batch.apply_status(BatchStatus::Running);
        batch.record_progress(0.6);

        batch.apply_status(BatchStatus::Completed);

        assert_eq!(batch.progress, 1.0);
    }

    #[test]
    fn test_record_progress_is_monotonic() {
        let mut batch = Batch::placeholder("b1");
        batch.record_progress(0.5);
        batch.record_progress(0.3);
        assert_eq!(batch.progress, 0.5);

        batch.record_progress(0.9);
        assert_eq!(batch.progress, 0.9);
    }

    #[test]
    fn test_record_progress_clamps_to_one() {
        let mut batch = Batch::placeholder("b1");
        batch.record_progress(1.5);
        assert_eq!(batch.progress, 1.0);
    }

    #[test]
    fn test_upsert_step_updates_by_name_and_order() {
        let mut batch = Batch::placeholder("b1");
        batch.upsert_step(1, "Power-On", |s| s.status = StepStatus::Running);
        batch.upsert_step(2, "Self-Test", |s| s.status = StepStatus::Running);
        batch.upsert_step(1, "Power-On", |s| {
            s.status = StepStatus::Completed;
            s.pass = Some(true);
        });

        assert_eq!(batch.steps.len(), 2);
        assert_eq!(batch.steps[0].name, "Power-On");
        assert_eq!(batch.steps[0].status, StepStatus::Completed);
        assert_eq!(batch.steps[0].pass, Some(true));
        assert_eq!(batch.steps[1].name, "Self-Test");
    }

    #[test]
    fn test_push_log_respects_capacity() {
        let mut batch = Batch::placeholder("b1");
        for i in 0..10 {
            batch.push_log(LogEntry::new("info", format!("line {}", i)), 4);
        }

        assert_eq!(batch.log.len(), 4);
        assert_eq!(batch.log[0].message, "line 6");
        assert_eq!(batch.log[3].message, "line 9");
    }

    #[test]
    fn test_merge_snapshot_push_precedence_while_active() {
        let mut batch = Batch::placeholder("b1");
        batch.apply_status(BatchStatus::Running);
        batch.execution_id = Some("e2".to_string());
        batch.record_progress(0.5);
        batch.step_index = Some(2);

        let mut snapshot = Batch::placeholder("b1");
        snapshot.status = BatchStatus::Idle;
        snapshot.progress = 0.1;
        snapshot.execution_id = Some("e1".to_string());
        snapshot.step_index = Some(0);
        snapshot.name = Some("Radio board".to_string());
        snapshot.last_run_passed = Some(false);

        batch.merge_snapshot(snapshot);

        // Push-derived fields untouched
        assert_eq!(batch.status, BatchStatus::Running);
        assert_eq!(batch.progress, 0.5);
        assert_eq!(batch.execution_id.as_deref(), Some("e2"));
        assert_eq!(batch.step_index, Some(2));
        // Metadata adopted
        assert_eq!(batch.name.as_deref(), Some("Radio board"));
        assert_eq!(batch.last_run_passed, Some(false));
    }

    #[test]
    fn test_merge_snapshot_authoritative_when_settled() {
        let mut batch = Batch::placeholder("b1");
        batch.status = BatchStatus::Completed;
        batch.progress = 1.0;
        batch.push_log(LogEntry::new("info", "run finished"), 100);

        let mut snapshot = Batch::placeholder("b1");
        snapshot.status = BatchStatus::Idle;
        snapshot.progress = 0.0;
        snapshot.name = Some("Radio board".to_string());

        batch.merge_snapshot(snapshot);

        assert_eq!(batch.status, BatchStatus::Idle);
        assert_eq!(batch.progress, 0.0);
        assert_eq!(batch.name.as_deref(), Some("Radio board"));
        // Local log survives the settled merge
        assert_eq!(batch.log.len(), 1);
    }
}
