/// Station Hub Sync Core
///
/// Client-side real-time synchronization for the test-station dashboard.
/// Reconciles the push channel and the snapshot API into one consistent,
/// monotonic view per batch despite message loss, reordering, reconnects, and
/// concurrent snapshot refreshes.
///
/// Components:
/// - Transport: one physical connection, no business logic
/// - Connection supervisor: backoff reconnection, heartbeat bookkeeping,
///   subscription re-announcement
/// - Subscription registry: ref-counted per-batch interest
/// - Event reconciler: guarded fold of events into the batch store
/// - Batch store: canonical observable table, single writer of truth
/// - Polling fallback controller: degraded snapshot polling while the push
///   channel is down
pub mod batch;
pub mod context;
pub mod fallback;
pub mod protocol;
pub mod reconciler;
pub mod registry;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod transport;

pub use batch::{Batch, BatchId, BatchStatus, BatchStep, LogEntry, StepStatus};
pub use context::{ShutdownHandle, SyncContext};
pub use fallback::{FallbackAction, FallbackPhase, PollingFallbackController};
pub use protocol::{ClientMessage, ServerMessage};
pub use reconciler::{Notification, Reconciler};
pub use registry::SubscriptionRegistry;
pub use snapshot::{HttpSnapshotClient, SnapshotClient, SnapshotClientError};
pub use state::{ConnectionState, TransportStatus};
pub use store::BatchStore;
pub use supervisor::{ConnectionSupervisor, SupervisorEvent, SupervisorHandle};
pub use transport::{
    HttpChannelTransport, InMemoryServer, InMemoryTransport, ServerLink, Transport, TransportError,
    TransportLink,
};

/// Initialize tracing for the sync core
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stationhub_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
