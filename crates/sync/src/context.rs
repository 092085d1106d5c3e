/// Sync context: the explicit wiring point of the synchronization core
///
/// Constructed once at startup and injected into consumers; there are no
/// global singletons. `run` drives one cooperative event loop, so
/// reconciliation and snapshot merging never execute concurrently and the
/// store's guards need no locking beyond the table itself.
use crate::fallback::{FallbackAction, PollingFallbackController};
use crate::reconciler::{Notification, Reconciler};
use crate::registry::SubscriptionRegistry;
use crate::snapshot::SnapshotClient;
use crate::state::{ConnectionState, ConnectionStateHandle};
use crate::store::BatchStore;
use crate::supervisor::{ConnectionSupervisor, SupervisorEvent, SupervisorHandle};
use crate::transport::Transport;
use stationhub_core::backoff::BackoffPolicy;
use stationhub_core::config::SyncConfig;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};

/// Cloneable teardown handle
///
/// Shutting down cancels pending reconnect timers and stops the event loop;
/// in-flight snapshot fetches are abandoned best-effort.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// The synchronization core, wired and ready to run
pub struct SyncContext {
    config: SyncConfig,
    store: Arc<BatchStore>,
    registry: Arc<SubscriptionRegistry>,
    snapshot: Arc<dyn SnapshotClient>,
    state: ConnectionStateHandle,
    supervisor: ConnectionSupervisor,
    supervisor_handle: SupervisorHandle,
    events: mpsc::UnboundedReceiver<SupervisorEvent>,
    notifications: broadcast::Sender<Notification>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SyncContext {
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        snapshot: Arc<dyn SnapshotClient>,
    ) -> Self {
        let store = Arc::new(BatchStore::new());
        let (state, _) = ConnectionStateHandle::new();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(SubscriptionRegistry::new(outbound_tx));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let policy = BackoffPolicy::new(config.backoff_base, config.backoff_max);
        let (supervisor, supervisor_handle) = ConnectionSupervisor::new(
            transport,
            Arc::clone(&registry),
            state.clone(),
            policy,
            outbound_rx,
            events_tx,
        );

        let (notifications, _) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            store,
            registry,
            snapshot,
            state,
            supervisor,
            supervisor_handle,
            events: events_rx,
            notifications,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    /// Canonical batch table (clone before `run`)
    pub fn store(&self) -> Arc<BatchStore> {
        Arc::clone(&self.store)
    }

    /// Subscription interest registry (clone before `run`)
    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Reactive view of the connection state
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Server-reported error notifications
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Drop every batch (logout / station switch)
    pub fn reset_store(&self) {
        self.store.reset();
    }

    /// Drive the core until shut down.
    ///
    /// Spawns the connection supervisor, requests the first connection, and
    /// runs the reconcile/poll loop. Initial data arrives via the immediate
    /// first snapshot poll whether or not the push channel ever comes up.
    pub async fn run(self) {
        let SyncContext {
            config,
            store,
            registry: _registry,
            snapshot,
            state,
            supervisor,
            supervisor_handle,
            mut events,
            notifications,
            shutdown_tx: _shutdown_tx,
            mut shutdown_rx,
        } = self;

        tokio::spawn(supervisor.run());
        supervisor_handle.connect();

        let mut fallback = PollingFallbackController::new(
            config.fallback_grace,
            config.poll_interval,
            config.fallback_poll_interval,
        );
        let mut reconciler = Reconciler::new(Arc::clone(&store), config.log_capacity);

        let (snapshot_tx, mut snapshot_rx) = mpsc::unbounded_channel();
        let mut fetch_in_flight = false;
        let mut refresh_queued = false;
        let mut poll_due = tokio::time::Instant::now();

        loop {
            let grace_deadline = fallback.grace_deadline().map(tokio::time::Instant::from_std);

            tokio::select! {
                event = events.recv() => match event {
                    Some(SupervisorEvent::Connected) => {
                        if fallback.on_connected() == Some(FallbackAction::ForceRefresh) {
                            state.set_fallback(false);
                            poll_due = tokio::time::Instant::now();
                        }
                    }
                    Some(SupervisorEvent::Disconnected) => {
                        fallback.on_disconnected(Instant::now());
                    }
                    Some(SupervisorEvent::Message(message)) => {
                        if let Some(notification) = reconciler.apply(message) {
                            let _ = notifications.send(notification);
                        }
                    }
                    None => {
                        tracing::debug!("supervisor gone, stopping sync context");
                        break;
                    }
                },

                _ = tokio::time::sleep_until(poll_due) => {
                    if fetch_in_flight {
                        refresh_queued = true;
                    } else {
                        fetch_in_flight = true;
                        let snapshot = Arc::clone(&snapshot);
                        let snapshot_tx = snapshot_tx.clone();
                        tokio::spawn(async move {
                            let _ = snapshot_tx.send(snapshot.fetch_batch_list().await);
                        });
                    }
                    poll_due = tokio::time::Instant::now() + fallback.polling_interval();
                },

                outcome = snapshot_rx.recv() => {
                    fetch_in_flight = false;
                    match outcome {
                        Some(Ok(batches)) => store.merge_snapshot_list(batches),
                        Some(Err(e)) => tracing::warn!(error = %e, "snapshot fetch failed"),
                        None => {}
                    }
                    if refresh_queued {
                        refresh_queued = false;
                        poll_due = tokio::time::Instant::now();
                    }
                },

                _ = async {
                    match grace_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    if fallback.tick(Instant::now()) {
                        state.set_fallback(true);
                        let raised = tokio::time::Instant::now() + fallback.polling_interval();
                        if raised < poll_due {
                            poll_due = raised;
                        }
                    }
                },

                _ = shutdown_rx.changed() => {
                    tracing::info!("sync context shutting down");
                    supervisor_handle.close();
                    break;
                },
            }
        }
    }
}
