/// Connection supervisor for the realtime channel
///
/// Wraps a transport with reconnection, heartbeat bookkeeping, and
/// subscription re-announcement. The supervisor owns the only live link;
/// everything downstream consumes decoded messages from its event channel.
///
/// Reconnect delays follow the explicit backoff state machine:
/// `min(base * 2^attempts, max)`, attempts unbounded, reset on success.
/// Outbound sends are best-effort: frames submitted while disconnected are
/// dropped, and the post-reconnect re-announce restores delivery instead.
use crate::protocol::{self, ClientMessage};
use crate::registry::SubscriptionRegistry;
use crate::state::{ConnectionStateHandle, TransportStatus};
use crate::transport::{Transport, TransportLink};
use stationhub_core::backoff::{BackoffPolicy, ReconnectBackoff};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Control commands accepted by the supervisor
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Idempotently ensure one outstanding connection attempt
    Connect,
    /// Tear down and suppress further attempts
    Close,
}

/// Events emitted to the sole downstream consumer
#[derive(Debug)]
pub enum SupervisorEvent {
    Connected,
    Disconnected,
    Message(protocol::ServerMessage),
}

/// Cloneable control handle
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<SupervisorCommand>,
}

impl SupervisorHandle {
    pub fn connect(&self) {
        let _ = self.commands.send(SupervisorCommand::Connect);
    }

    pub fn close(&self) {
        let _ = self.commands.send(SupervisorCommand::Close);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

/// Supervisor task state
pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    registry: Arc<SubscriptionRegistry>,
    state: ConnectionStateHandle,
    backoff: ReconnectBackoff,
    commands: mpsc::UnboundedReceiver<SupervisorCommand>,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<SubscriptionRegistry>,
        state: ConnectionStateHandle,
        policy: BackoffPolicy,
        outbound: mpsc::UnboundedReceiver<ClientMessage>,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> (Self, SupervisorHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            transport,
            registry,
            state,
            backoff: ReconnectBackoff::new(policy),
            commands: commands_rx,
            outbound,
            events,
        };
        (
            supervisor,
            SupervisorHandle {
                commands: commands_tx,
            },
        )
    }

    /// Drive the connection until closed
    pub async fn run(mut self) {
        if self.wait_for_connect().await == Flow::Shutdown {
            return;
        }

        self.drive().await;
        tracing::debug!("connection supervisor stopped");
    }

    /// Idle until the first connect request, dropping any outbound frames
    async fn wait_for_connect(&mut self) -> Flow {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(SupervisorCommand::Connect) => return Flow::Continue,
                    Some(SupervisorCommand::Close) | None => return Flow::Shutdown,
                },
                frame = self.outbound.recv() => match frame {
                    Some(_) => tracing::debug!("dropping outbound frame while disconnected"),
                    None => return Flow::Shutdown,
                },
            }
        }
    }

    /// Connect/reconnect loop; returns on explicit close
    async fn drive(&mut self) {
        loop {
            self.state.set_status(TransportStatus::Connecting);

            match self.transport.connect().await {
                Ok(link) => {
                    self.backoff.succeeded();
                    self.state.set_attempts(0);
                    self.state.set_status(TransportStatus::Connected);
                    tracing::info!("channel connected");

                    // Frames submitted while disconnected are stale by
                    // definition; the re-announce below supersedes them.
                    self.drain_outbound();
                    let _ = self.events.send(SupervisorEvent::Connected);
                    self.registry.reannounce();

                    if self.serve(link).await == Flow::Shutdown {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "channel connect failed");
                    self.state.set_status(TransportStatus::Error);
                }
            }

            let deadline = self.backoff.schedule(Instant::now());
            self.state.set_attempts(self.backoff.attempts());
            self.state.set_status(TransportStatus::Disconnected);

            if self.wait_for_deadline(deadline).await == Flow::Shutdown {
                self.backoff.cancel();
                self.state.set_status(TransportStatus::Disconnected);
                return;
            }
            self.backoff.begin_connect();
        }
    }

    /// Serve one live link until it drops or the supervisor is closed
    async fn serve(&mut self, mut link: Box<dyn TransportLink>) -> Flow {
        loop {
            tokio::select! {
                frame = link.recv() => match frame {
                    Some(text) => {
                        self.state.heartbeat();
                        match protocol::decode(&text) {
                            Ok(message) => {
                                let _ = self.events.send(SupervisorEvent::Message(message));
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "dropping undecodable frame");
                            }
                        }
                    }
                    None => {
                        tracing::warn!("channel connection lost");
                        self.state.set_status(TransportStatus::Disconnected);
                        let _ = self.events.send(SupervisorEvent::Disconnected);
                        return Flow::Continue;
                    }
                },
                message = self.outbound.recv() => match message {
                    Some(message) => match message.to_json() {
                        Ok(frame) => {
                            if let Err(e) = link.send(frame).await {
                                tracing::warn!(error = %e, "channel send failed, dropping connection");
                                link.close().await;
                                self.state.set_status(TransportStatus::Disconnected);
                                let _ = self.events.send(SupervisorEvent::Disconnected);
                                return Flow::Continue;
                            }
                        }
                        Err(e) => tracing::error!(error = %e, "failed to encode outbound message"),
                    },
                    None => return Flow::Shutdown,
                },
                cmd = self.commands.recv() => match cmd {
                    // Already connected; connect is idempotent
                    Some(SupervisorCommand::Connect) => {}
                    Some(SupervisorCommand::Close) | None => {
                        link.close().await;
                        self.state.set_status(TransportStatus::Disconnected);
                        let _ = self.events.send(SupervisorEvent::Disconnected);
                        return Flow::Shutdown;
                    }
                },
            }
        }
    }

    /// Sleep out a scheduled reconnect, dropping outbound frames meanwhile.
    /// Duplicate connect requests are no-ops: the attempt is already pending.
    async fn wait_for_deadline(&mut self, deadline: Instant) -> Flow {
        let deadline = tokio::time::Instant::from_std(deadline);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Flow::Continue,
                cmd = self.commands.recv() => match cmd {
                    Some(SupervisorCommand::Connect) => {}
                    Some(SupervisorCommand::Close) | None => return Flow::Shutdown,
                },
                frame = self.outbound.recv() => match frame {
                    Some(_) => tracing::debug!("dropping outbound frame while disconnected"),
                    None => return Flow::Shutdown,
                },
            }
        }
    }

    fn drain_outbound(&mut self) {
        while let Ok(message) = self.outbound.try_recv() {
            tracing::debug!(?message, "dropping frame sent while disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Harness {
        registry: Arc<SubscriptionRegistry>,
        handle: SupervisorHandle,
        events: mpsc::UnboundedReceiver<SupervisorEvent>,
        state_rx: tokio::sync::watch::Receiver<crate::state::ConnectionState>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(transport: Arc<dyn Transport>, policy: BackoffPolicy) -> Harness {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = ConnectionStateHandle::new();
        let registry = Arc::new(SubscriptionRegistry::new(outbound_tx));

        let (supervisor, handle) = ConnectionSupervisor::new(
            transport,
            Arc::clone(&registry),
            state,
            policy,
            outbound_rx,
            events_tx,
        );
        let task = tokio::spawn(supervisor.run());

        Harness {
            registry,
            handle,
            events: events_rx,
            state_rx,
            task,
        }
    }

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_connect_reannounces_current_interest() {
        let (transport, mut server) = InMemoryTransport::new();
        let mut harness = start(Arc::new(transport), fast_policy());

        harness.registry.subscribe(&["a".to_string(), "b".to_string()]);
        harness.handle.connect();

        let mut server_link = timeout(Duration::from_secs(1), server.accept())
            .await
            .unwrap()
            .unwrap();

        match timeout(Duration::from_secs(1), server_link.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ClientMessage::Subscribe { batch_ids } => {
                assert_eq!(batch_ids, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("Wrong message: {:?}", other),
        }

        harness.handle.close();
        timeout(Duration::from_secs(1), harness.task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_after_link_loss() {
        let (transport, mut server) = InMemoryTransport::new();
        let mut harness = start(Arc::new(transport), fast_policy());

        harness.registry.subscribe(&["a".to_string()]);
        harness.handle.connect();

        let first = timeout(Duration::from_secs(1), server.accept())
            .await
            .unwrap()
            .unwrap();
        drop(first);

        // Backoff is short; a second connection must appear on its own.
        let mut second = timeout(Duration::from_secs(1), server.accept())
            .await
            .unwrap()
            .unwrap();

        match timeout(Duration::from_secs(1), second.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ClientMessage::Subscribe { batch_ids } => {
                assert_eq!(batch_ids, vec!["a".to_string()]);
            }
            other => panic!("Wrong message: {:?}", other),
        }

        harness.handle.close();
        timeout(Duration::from_secs(1), harness.task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_cancels_pending_reconnect() {
        let (transport, _server) = InMemoryTransport::new();
        transport.set_connect_failing(true);

        // Long base delay so close must race a pending reconnect timer
        let policy = BackoffPolicy::new(Duration::from_secs(30), Duration::from_secs(60));
        let harness = start(Arc::new(transport), policy);

        harness.handle.connect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.handle.close();

        timeout(Duration::from_secs(1), harness.task)
            .await
            .expect("close must cancel the pending reconnect")
            .unwrap();
    }

    #[tokio::test]
    async fn test_inbound_frames_update_heartbeat_and_emit_events() {
        let (transport, mut server) = InMemoryTransport::new();
        let mut harness = start(Arc::new(transport), fast_policy());

        harness.handle.connect();
        let server_link = timeout(Duration::from_secs(1), server.accept())
            .await
            .unwrap()
            .unwrap();

        match timeout(Duration::from_secs(1), harness.events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            SupervisorEvent::Connected => {}
            other => panic!("Expected Connected, got {:?}", other),
        }

        server_link.send_raw(r#"{"type":"subscribed","batch_ids":["b1"]}"#);
        match timeout(Duration::from_secs(1), harness.events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            SupervisorEvent::Message(protocol::ServerMessage::Subscribed { batch_ids }) => {
                assert_eq!(batch_ids, vec!["b1".to_string()]);
            }
            other => panic!("Expected Subscribed, got {:?}", other),
        }

        assert!(harness.state_rx.borrow().last_heartbeat.is_some());
        assert!(harness.state_rx.borrow().is_connected());

        harness.handle.close();
        timeout(Duration::from_secs(1), harness.task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_dropped_without_disconnect() {
        let (transport, mut server) = InMemoryTransport::new();
        let mut harness = start(Arc::new(transport), fast_policy());

        harness.handle.connect();
        let server_link = timeout(Duration::from_secs(1), server.accept())
            .await
            .unwrap()
            .unwrap();

        server_link.send_raw("garbage frame");
        server_link.send_raw(r#"{"type":"subscribed","batch_ids":["b1"]}"#);

        // Connected, then the decodable message; the garbage never surfaces
        let mut messages = Vec::new();
        for _ in 0..2 {
            messages.push(
                timeout(Duration::from_secs(1), harness.events.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        assert!(matches!(messages[0], SupervisorEvent::Connected));
        assert!(matches!(
            messages[1],
            SupervisorEvent::Message(protocol::ServerMessage::Subscribed { .. })
        ));

        harness.handle.close();
        timeout(Duration::from_secs(1), harness.task)
            .await
            .unwrap()
            .unwrap();
    }
}
