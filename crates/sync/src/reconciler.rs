/// Event reconciler: pure fold of inbound events into the batch store
///
/// Every handler is total over (state, event): semantic conflicts (stale
/// execution ids, disallowed status transitions, regressing cursors) are
/// expected races and are discarded at debug level, never surfaced as errors.
/// The match over `ServerMessage` is exhaustive, so a new wire type without a
/// handler fails to compile.
use crate::batch::{Batch, BatchId, BatchStatus, LogEntry, StepStatus};
use crate::protocol::ServerMessage;
use crate::store::BatchStore;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

/// User-facing notice for a server-reported error event
#[derive(Debug, Clone)]
pub struct Notification {
    pub batch_id: Option<BatchId>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Folds inbound events into the store under identity and monotonicity guards
pub struct Reconciler {
    store: Arc<BatchStore>,
    /// Batches holding a one-shot "initial push after subscribe" exemption.
    /// Armed by the `subscribed` ack, consumed by the first guard evaluation.
    exemptions: HashSet<BatchId>,
    log_capacity: usize,
}

impl Reconciler {
    pub fn new(store: Arc<BatchStore>, log_capacity: usize) -> Self {
        Self {
            store,
            exemptions: HashSet::new(),
            log_capacity,
        }
    }

    /// Fold one event into the store.
    ///
    /// Returns a notification when the event warrants surfacing to the
    /// operator (server-reported errors only).
    pub fn apply(&mut self, message: ServerMessage) -> Option<Notification> {
        match message {
            ServerMessage::Subscribed { batch_ids } => {
                tracing::debug!(?batch_ids, "subscription acknowledged");
                for id in batch_ids {
                    self.exemptions.insert(id);
                }
                None
            }
            ServerMessage::Unsubscribed { batch_ids } => {
                tracing::debug!(?batch_ids, "unsubscription acknowledged");
                None
            }
            ServerMessage::BatchCreated { batch_id, name } => {
                self.store.ensure(&batch_id);
                if let Some(name) = name {
                    self.store.update(&batch_id, |batch| batch.name = Some(name));
                }
                None
            }
            ServerMessage::BatchDeleted { batch_id } => {
                self.exemptions.remove(&batch_id);
                self.store.remove(&batch_id);
                None
            }
            ServerMessage::BatchStatus {
                batch_id,
                status,
                progress,
                current_step,
                step_index,
                total_steps,
                execution_id,
                last_run_passed,
            } => {
                self.apply_status(
                    batch_id,
                    status,
                    progress,
                    current_step,
                    step_index,
                    total_steps,
                    execution_id,
                    last_run_passed,
                );
                None
            }
            ServerMessage::StepStart {
                batch_id,
                step,
                index,
                total,
                execution_id,
            } => {
                self.apply_step_start(batch_id, step, index, total, execution_id);
                None
            }
            ServerMessage::StepComplete {
                batch_id,
                step,
                index,
                pass,
                duration,
                result,
                execution_id,
            } => {
                self.apply_step_complete(batch_id, step, index, pass, duration, result, execution_id);
                None
            }
            ServerMessage::SequenceComplete {
                batch_id,
                passed,
                duration,
                execution_id,
            } => {
                self.apply_sequence_complete(batch_id, passed, duration, execution_id);
                None
            }
            ServerMessage::Log {
                batch_id,
                message,
                level,
                execution_id,
            } => {
                self.apply_log(batch_id, message, level, execution_id);
                None
            }
            ServerMessage::Error {
                batch_id,
                message,
                execution_id,
            } => self.apply_error(batch_id, message, execution_id),
        }
    }

    /// Identity guard over execution ids.
    ///
    /// An event without an execution id applies unconditionally. Otherwise the
    /// one-shot exemption, if armed, is consumed here by the first guarded
    /// event for the batch, whether or not the ids actually differ.
    fn admit(&mut self, id: &str, current: Option<&str>, incoming: Option<&str>) -> bool {
        let Some(incoming) = incoming else {
            return true;
        };

        if self.exemptions.remove(id) {
            return true;
        }

        match current {
            Some(current) if !current.is_empty() && !incoming.is_empty() && current != incoming => {
                false
            }
            _ => true,
        }
    }

    /// Current view of a batch, creating the placeholder on first observation
    fn observe(&self, id: &str) -> Batch {
        self.store.ensure(id);
        self.store
            .get(id)
            .unwrap_or_else(|| Batch::placeholder(id.to_string()))
    }

    fn same_run(current: Option<&str>, incoming: Option<&str>) -> bool {
        matches!((current, incoming), (Some(a), Some(b)) if a == b)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_status(
        &mut self,
        batch_id: BatchId,
        status: BatchStatus,
        progress: Option<f64>,
        current_step: Option<String>,
        step_index: Option<u32>,
        total_steps: Option<u32>,
        execution_id: Option<String>,
        last_run_passed: Option<bool>,
    ) {
        let current = self.observe(&batch_id);
        if !self.admit(
            &batch_id,
            current.execution_id.as_deref(),
            execution_id.as_deref(),
        ) {
            tracing::debug!(batch = %batch_id, "discarding status event from a stale run");
            return;
        }
        if !current.status.accepts(status) {
            tracing::debug!(
                batch = %batch_id,
                from = ?current.status,
                to = ?status,
                "discarding disallowed status transition"
            );
            return;
        }

        let same_run = Self::same_run(current.execution_id.as_deref(), execution_id.as_deref());
        self.store.update(&batch_id, move |batch| {
            batch.apply_status(status);
            if execution_id.is_some() {
                batch.execution_id = execution_id;
            }
            if let Some(progress) = progress {
                batch.record_progress(progress);
            }
            if let Some(index) = step_index {
                if !same_run || batch.step_index.map_or(true, |cur| index >= cur) {
                    batch.step_index = Some(index);
                    if current_step.is_some() {
                        batch.current_step = current_step;
                    }
                }
            } else if current_step.is_some() {
                batch.current_step = current_step;
            }
            if total_steps.is_some() {
                batch.total_steps = total_steps;
            }
            if last_run_passed.is_some() {
                batch.last_run_passed = last_run_passed;
            }
        });
    }

    fn apply_step_start(
        &mut self,
        batch_id: BatchId,
        step: String,
        index: u32,
        total: Option<u32>,
        execution_id: Option<String>,
    ) {
        let current = self.observe(&batch_id);
        if !self.admit(
            &batch_id,
            current.execution_id.as_deref(),
            execution_id.as_deref(),
        ) {
            tracing::debug!(batch = %batch_id, step = %step, "discarding step start from a stale run");
            return;
        }
        if !current.status.accepts(BatchStatus::Running) {
            tracing::debug!(
                batch = %batch_id,
                from = ?current.status,
                "discarding step start in a non-runnable status"
            );
            return;
        }

        let same_run = Self::same_run(current.execution_id.as_deref(), execution_id.as_deref());
        let order = index.saturating_add(1);
        self.store.update(&batch_id, move |batch| {
            batch.apply_status(BatchStatus::Running);
            if execution_id.is_some() {
                batch.execution_id = execution_id;
            }
            if total.is_some() {
                batch.total_steps = total;
            }
            // Cursor never regresses within one run
            if !same_run || batch.step_index.map_or(true, |cur| index >= cur) {
                batch.step_index = Some(index);
                batch.current_step = Some(step.clone());
            }
            batch.upsert_step(order, &step, |s| s.status = StepStatus::Running);
        });
    }

    fn apply_step_complete(
        &mut self,
        batch_id: BatchId,
        step: String,
        index: u32,
        pass: bool,
        duration: Option<f64>,
        result: Option<String>,
        execution_id: Option<String>,
    ) {
        let current = self.observe(&batch_id);
        if !self.admit(
            &batch_id,
            current.execution_id.as_deref(),
            execution_id.as_deref(),
        ) {
            tracing::debug!(batch = %batch_id, step = %step, "discarding step completion from a stale run");
            return;
        }

        let order = index.saturating_add(1);
        self.store.update(&batch_id, move |batch| {
            if execution_id.is_some() {
                batch.execution_id = execution_id;
            }
            batch.upsert_step(order, &step, |s| {
                s.status = StepStatus::Completed;
                s.pass = Some(pass);
                s.duration = duration;
                s.result = result;
            });
            if let Some(total) = batch.total_steps.filter(|t| *t > 0) {
                batch.record_progress(f64::from(order) / f64::from(total));
            }
        });
    }

    fn apply_sequence_complete(
        &mut self,
        batch_id: BatchId,
        passed: bool,
        duration: Option<f64>,
        execution_id: Option<String>,
    ) {
        let current = self.observe(&batch_id);
        if !self.admit(
            &batch_id,
            current.execution_id.as_deref(),
            execution_id.as_deref(),
        ) {
            tracing::debug!(batch = %batch_id, "discarding sequence completion from a stale run");
            return;
        }
        if !current.status.accepts(BatchStatus::Completed) {
            tracing::debug!(
                batch = %batch_id,
                from = ?current.status,
                "discarding sequence completion in a non-completable status"
            );
            return;
        }

        self.store.update(&batch_id, move |batch| {
            batch.apply_status(BatchStatus::Completed);
            if execution_id.is_some() {
                batch.execution_id = execution_id;
            }
            batch.last_run_passed = Some(passed);
            if let Some(duration) = duration {
                batch.elapsed = duration;
            }
        });
    }

    fn apply_log(
        &mut self,
        batch_id: BatchId,
        message: String,
        level: String,
        execution_id: Option<String>,
    ) {
        let current = self.observe(&batch_id);
        if !self.admit(
            &batch_id,
            current.execution_id.as_deref(),
            execution_id.as_deref(),
        ) {
            tracing::debug!(batch = %batch_id, "discarding log line from a stale run");
            return;
        }

        let capacity = self.log_capacity;
        self.store.update(&batch_id, move |batch| {
            batch.push_log(LogEntry::new(level, message), capacity);
        });
    }

    /// Server-reported errors surface as notifications and append to the
    /// batch log; they never change `status` on their own.
    fn apply_error(
        &mut self,
        batch_id: Option<BatchId>,
        message: String,
        execution_id: Option<String>,
    ) -> Option<Notification> {
        if let Some(id) = &batch_id {
            let current = self.observe(id);
            if self.admit(id, current.execution_id.as_deref(), execution_id.as_deref()) {
                let capacity = self.log_capacity;
                let line = message.clone();
                self.store.update(id, move |batch| {
                    batch.push_log(LogEntry::new("error", line), capacity);
                });
            } else {
                tracing::debug!(batch = %id, "error event from a stale run; log line dropped");
            }
        }

        Some(Notification {
            batch_id,
            message,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Reconciler, Arc<BatchStore>) {
        let store = Arc::new(BatchStore::new());
        let reconciler = Reconciler::new(Arc::clone(&store), 100);
        (reconciler, store)
    }

    fn status_event(
        batch_id: &str,
        status: BatchStatus,
        progress: Option<f64>,
        execution_id: Option<&str>,
    ) -> ServerMessage {
        ServerMessage::BatchStatus {
            batch_id: batch_id.to_string(),
            status,
            progress,
            current_step: None,
            step_index: None,
            total_steps: None,
            execution_id: execution_id.map(|s| s.to_string()),
            last_run_passed: None,
        }
    }

    fn step_start(batch_id: &str, step: &str, index: u32, total: u32, exec: &str) -> ServerMessage {
        ServerMessage::StepStart {
            batch_id: batch_id.to_string(),
            step: step.to_string(),
            index,
            total: Some(total),
            execution_id: Some(exec.to_string()),
        }
    }

    fn step_complete(batch_id: &str, step: &str, index: u32, pass: bool, exec: &str) -> ServerMessage {
        ServerMessage::StepComplete {
            batch_id: batch_id.to_string(),
            step: step.to_string(),
            index,
            pass,
            duration: Some(1.2),
            result: None,
            execution_id: Some(exec.to_string()),
        }
    }

    #[test]
    fn test_first_observation_creates_placeholder() {
        let (mut reconciler, store) = setup();

        reconciler.apply(step_start("b9", "Power-On", 0, 3, "e1"));

        let batch = store.get("b9").unwrap();
        assert_eq!(batch.status, BatchStatus::Running);
        assert_eq!(batch.steps.len(), 1);
    }

    #[test]
    fn test_stale_run_rejection() {
        let (mut reconciler, store) = setup();

        reconciler.apply(status_event("b1", BatchStatus::Running, Some(0.5), Some("e1")));

        // Event from a prior run must leave state unchanged
        reconciler.apply(status_event("b1", BatchStatus::Running, Some(0.9), Some("e0")));

        let batch = store.get("b1").unwrap();
        assert_eq!(batch.status, BatchStatus::Running);
        assert_eq!(batch.progress, 0.5);
        assert_eq!(batch.execution_id.as_deref(), Some("e1"));
    }

    #[test]
    fn test_completed_state_protection() {
        let (mut reconciler, store) = setup();

        reconciler.apply(status_event("b1", BatchStatus::Running, None, Some("e1")));
        reconciler.apply(status_event("b1", BatchStatus::Completed, None, Some("e1")));

        // running is discarded on a completed batch
        reconciler.apply(status_event("b1", BatchStatus::Running, None, Some("e1")));
        assert_eq!(store.get("b1").unwrap().status, BatchStatus::Completed);

        // starting (a re-run) is applied
        reconciler.apply(status_event("b1", BatchStatus::Starting, None, Some("e1")));
        assert_eq!(store.get("b1").unwrap().status, BatchStatus::Starting);
    }

    #[test]
    fn test_starting_ignores_idle_and_stopping_ignores_running() {
        let (mut reconciler, store) = setup();

        reconciler.apply(status_event("b1", BatchStatus::Starting, None, Some("e1")));
        reconciler.apply(status_event("b1", BatchStatus::Idle, None, Some("e1")));
        assert_eq!(store.get("b1").unwrap().status, BatchStatus::Starting);

        reconciler.apply(status_event("b1", BatchStatus::Running, None, Some("e1")));
        reconciler.apply(status_event("b1", BatchStatus::Stopping, None, Some("e1")));
        reconciler.apply(status_event("b1", BatchStatus::Running, None, Some("e1")));
        assert_eq!(store.get("b1").unwrap().status, BatchStatus::Stopping);
    }

    #[test]
    fn test_progress_monotonic_within_run() {
        let (mut reconciler, store) = setup();

        reconciler.apply(status_event("b1", BatchStatus::Running, Some(0.6), Some("e1")));
        reconciler.apply(status_event("b1", BatchStatus::Running, Some(0.4), Some("e1")));
        assert_eq!(store.get("b1").unwrap().progress, 0.6);

        reconciler.apply(status_event("b1", BatchStatus::Running, Some(0.8), Some("e1")));
        assert_eq!(store.get("b1").unwrap().progress, 0.8);
    }

    #[test]
    fn test_completed_forces_progress_one() {
        let (mut reconciler, store) = setup();

        reconciler.apply(status_event("b1", BatchStatus::Running, Some(0.7), Some("e1")));
        reconciler.apply(status_event("b1", BatchStatus::Completed, None, Some("e1")));

        assert_eq!(store.get("b1").unwrap().progress, 1.0);
    }

    #[test]
    fn test_end_to_end_step_sequence() {
        let (mut reconciler, store) = setup();

        reconciler.apply(status_event("b1", BatchStatus::Starting, None, Some("e1")));
        let batch = store.get("b1").unwrap();
        assert_eq!(batch.status, BatchStatus::Starting);
        assert_eq!(batch.progress, 0.0);

        reconciler.apply(step_start("b1", "Power-On", 0, 3, "e1"));
        let batch = store.get("b1").unwrap();
        assert_eq!(batch.status, BatchStatus::Running);
        assert_eq!(batch.steps.len(), 1);
        assert_eq!(batch.steps[0].order, 1);
        assert_eq!(batch.steps[0].name, "Power-On");
        assert_eq!(batch.steps[0].status, StepStatus::Running);

        reconciler.apply(step_complete("b1", "Power-On", 0, true, "e1"));
        let batch = store.get("b1").unwrap();
        assert_eq!(batch.steps[0].status, StepStatus::Completed);
        assert_eq!(batch.steps[0].pass, Some(true));
        assert!((batch.progress - 1.0 / 3.0).abs() < 1e-9);

        // Duplicate re-delivery of the same step_start must not regress progress
        reconciler.apply(step_start("b1", "Power-On", 0, 3, "e1"));
        let batch = store.get("b1").unwrap();
        assert!(batch.progress >= 1.0 / 3.0 - 1e-9);
    }

    #[test]
    fn test_initial_push_exemption_applies_once() {
        let (mut reconciler, store) = setup();

        reconciler.apply(status_event("b1", BatchStatus::Running, Some(0.5), Some("e1")));

        // Subscribe ack arms the exemption; the next guarded event bypasses
        // the mismatch check even though its run id differs.
        reconciler.apply(ServerMessage::Subscribed {
            batch_ids: vec!["b1".to_string()],
        });
        reconciler.apply(status_event("b1", BatchStatus::Running, Some(0.2), Some("e2")));
        let batch = store.get("b1").unwrap();
        assert_eq!(batch.execution_id.as_deref(), Some("e2"));

        // Exemption is consumed; a stale event is discarded again.
        reconciler.apply(status_event("b1", BatchStatus::Running, Some(0.9), Some("e1")));
        assert_eq!(store.get("b1").unwrap().execution_id.as_deref(), Some("e2"));
    }

    #[test]
    fn test_exemption_consumed_even_when_ids_match() {
        let (mut reconciler, store) = setup();

        reconciler.apply(status_event("b1", BatchStatus::Running, Some(0.5), Some("e1")));
        reconciler.apply(ServerMessage::Subscribed {
            batch_ids: vec!["b1".to_string()],
        });

        // First guarded event matches the current run; it still burns the flag.
        reconciler.apply(status_event("b1", BatchStatus::Running, Some(0.6), Some("e1")));

        reconciler.apply(status_event("b1", BatchStatus::Running, Some(0.9), Some("e0")));
        let batch = store.get("b1").unwrap();
        assert_eq!(batch.progress, 0.6);
        assert_eq!(batch.execution_id.as_deref(), Some("e1"));
    }

    #[test]
    fn test_rearmed_exemption_last_subscribe_wins() {
        let (mut reconciler, store) = setup();

        reconciler.apply(status_event("b1", BatchStatus::Running, None, Some("e1")));

        // Two rapid re-subscriptions: the flag is a set entry, armed once.
        reconciler.apply(ServerMessage::Subscribed {
            batch_ids: vec!["b1".to_string()],
        });
        reconciler.apply(ServerMessage::Subscribed {
            batch_ids: vec!["b1".to_string()],
        });

        reconciler.apply(status_event("b1", BatchStatus::Running, None, Some("e2")));
        assert_eq!(store.get("b1").unwrap().execution_id.as_deref(), Some("e2"));

        // Consumed once: no second exemption survives.
        reconciler.apply(status_event("b1", BatchStatus::Running, None, Some("e1")));
        assert_eq!(store.get("b1").unwrap().execution_id.as_deref(), Some("e2"));
    }

    #[test]
    fn test_event_without_execution_id_applies_unconditionally() {
        let (mut reconciler, store) = setup();

        reconciler.apply(status_event("b1", BatchStatus::Running, Some(0.5), Some("e1")));
        reconciler.apply(status_event("b1", BatchStatus::Stopping, None, None));

        assert_eq!(store.get("b1").unwrap().status, BatchStatus::Stopping);
    }

    #[test]
    fn test_sequence_complete_records_verdict() {
        let (mut reconciler, store) = setup();

        reconciler.apply(status_event("b1", BatchStatus::Running, Some(0.8), Some("e1")));
        reconciler.apply(ServerMessage::SequenceComplete {
            batch_id: "b1".to_string(),
            passed: true,
            duration: Some(12.5),
            execution_id: Some("e1".to_string()),
        });

        let batch = store.get("b1").unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.progress, 1.0);
        assert_eq!(batch.last_run_passed, Some(true));
        assert_eq!(batch.elapsed, 12.5);
    }

    #[test]
    fn test_error_event_notifies_without_status_change() {
        let (mut reconciler, store) = setup();

        reconciler.apply(status_event("b1", BatchStatus::Running, Some(0.5), Some("e1")));

        let notification = reconciler.apply(ServerMessage::Error {
            batch_id: Some("b1".to_string()),
            message: "DUT over-temperature".to_string(),
            execution_id: Some("e1".to_string()),
        });

        let notification = notification.expect("error events must surface");
        assert_eq!(notification.batch_id.as_deref(), Some("b1"));
        assert_eq!(notification.message, "DUT over-temperature");

        let batch = store.get("b1").unwrap();
        assert_eq!(batch.status, BatchStatus::Running);
        assert_eq!(batch.log.len(), 1);
        assert_eq!(batch.log[0].level, "error");
    }

    #[test]
    fn test_log_event_appends_and_respects_identity_guard() {
        let (mut reconciler, store) = setup();

        reconciler.apply(status_event("b1", BatchStatus::Running, None, Some("e1")));
        reconciler.apply(ServerMessage::Log {
            batch_id: "b1".to_string(),
            message: "voltage nominal".to_string(),
            level: "info".to_string(),
            execution_id: Some("e1".to_string()),
        });
        reconciler.apply(ServerMessage::Log {
            batch_id: "b1".to_string(),
            message: "stale line".to_string(),
            level: "info".to_string(),
            execution_id: Some("e0".to_string()),
        });

        let batch = store.get("b1").unwrap();
        assert_eq!(batch.log.len(), 1);
        assert_eq!(batch.log[0].message, "voltage nominal");
    }

    #[test]
    fn test_batch_created_and_deleted() {
        let (mut reconciler, store) = setup();

        reconciler.apply(ServerMessage::BatchCreated {
            batch_id: "b1".to_string(),
            name: Some("Radio board".to_string()),
        });
        assert_eq!(store.get("b1").unwrap().name.as_deref(), Some("Radio board"));

        reconciler.apply(ServerMessage::BatchDeleted {
            batch_id: "b1".to_string(),
        });
        assert!(store.get("b1").is_none());
    }

    #[test]
    fn test_duplicate_sequence_complete_is_idempotent() {
        let (mut reconciler, store) = setup();

        reconciler.apply(status_event("b1", BatchStatus::Running, None, Some("e1")));
        let done = ServerMessage::SequenceComplete {
            batch_id: "b1".to_string(),
            passed: false,
            duration: None,
            execution_id: Some("e1".to_string()),
        };
        reconciler.apply(done.clone());
        reconciler.apply(done);

        let batch = store.get("b1").unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.last_run_passed, Some(false));
    }
}
