//! Subscriber fan-out
//!
//! The [`Broadcaster`] owns the connection registry: user identity to live
//! connections, one user possibly holding several (one per browser tab).
//! Every connection gets a bounded [`OutboundQueue`] and its own writer task,
//! so delivery never blocks on a slow peer:
//!
//! - The registry lock is held only for map reads and mutations. Targets are
//!   snapshotted under the lock and batches are enqueued after it is released.
//! - Enqueueing never waits. A full queue drops its oldest batch.
//! - Overflows and failed or timed-out writes count as consecutive failures;
//!   a connection reaching the configured limit is unregistered.

use crate::config::BroadcastConfig;
use crate::error::DeliveryError;
use crate::types::{OutboundMessage, UserId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};

pub mod queue;

pub use queue::{OutboundQueue, Pushed};

/// Identifier handed out by [`Broadcaster::register`]
pub type ConnectionId = u64;

/// Transport side of one subscriber connection
///
/// The broadcaster does not own the transport; it only writes to it. A sink
/// reporting [`DeliveryError::Closed`] is unregistered immediately.
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    /// Write one batch to the peer
    async fn send(&self, message: Arc<OutboundMessage>) -> Result<(), DeliveryError>;
}

/// Sink backed by a bounded channel, drained by an SSE response stream
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Arc<OutboundMessage>>,
}

impl ChannelSink {
    /// Create a sink and the receiver the transport reads from
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Arc<OutboundMessage>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send(&self, message: Arc<OutboundMessage>) -> Result<(), DeliveryError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| DeliveryError::Closed)
    }
}

struct Connection {
    user: UserId,
    queue: Arc<OutboundQueue>,
    failures: Arc<AtomicU32>,
}

type Registry = Arc<RwLock<HashMap<ConnectionId, Connection>>>;

/// Connection registry and fan-out
pub struct Broadcaster {
    config: BroadcastConfig,
    connections: Registry,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Broadcaster {
    /// Create an empty broadcaster
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            config,
            connections: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a connection for `user` and start its writer task
    pub async fn register(&self, user: UserId, sink: impl MessageSink) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(OutboundQueue::new(self.config.queue_capacity));
        let failures = Arc::new(AtomicU32::new(0));

        self.connections.write().await.insert(
            id,
            Connection {
                user: user.clone(),
                queue: queue.clone(),
                failures: failures.clone(),
            },
        );

        tokio::spawn(run_writer(
            id,
            queue,
            failures,
            Arc::new(sink),
            self.connections.clone(),
            self.config.clone(),
        ));

        tracing::info!(connection_id = id, user_id = %user, "Subscriber connected");
        id
    }

    /// Remove a connection; returns false if it was already gone
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        detach(&self.connections, id).await.is_some()
    }

    /// Deliver a batch to every connection; returns how many it was queued for
    pub async fn broadcast_all(&self, message: OutboundMessage) -> usize {
        let targets = self.targets(|_| true).await;
        self.enqueue(targets, message).await
    }

    /// Deliver a batch to every connection of one user
    pub async fn send_to_user(&self, user: &UserId, message: OutboundMessage) -> usize {
        let targets = self.targets(|conn| &conn.user == user).await;
        self.enqueue(targets, message).await
    }

    /// Live connections across all users
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Distinct users with at least one live connection
    pub async fn user_count(&self) -> usize {
        let connections = self.connections.read().await;
        connections
            .values()
            .map(|c| &c.user)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Live connections held by one user
    pub async fn connections_for(&self, user: &UserId) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| &c.user == user)
            .count()
    }

    /// Drop every connection; used on shutdown
    pub async fn close_all(&self) {
        let drained: Vec<Connection> = self
            .connections
            .write()
            .await
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in &drained {
            conn.queue.close();
        }
        if !drained.is_empty() {
            tracing::info!(connections = drained.len(), "Closed all subscriber connections");
        }
    }

    async fn targets<F>(&self, filter: F) -> Vec<(ConnectionId, Arc<OutboundQueue>, Arc<AtomicU32>)>
    where
        F: Fn(&Connection) -> bool,
    {
        self.connections
            .read()
            .await
            .iter()
            .filter(|(_, conn)| filter(conn))
            .map(|(id, conn)| (*id, conn.queue.clone(), conn.failures.clone()))
            .collect()
    }

    async fn enqueue(
        &self,
        targets: Vec<(ConnectionId, Arc<OutboundQueue>, Arc<AtomicU32>)>,
        message: OutboundMessage,
    ) -> usize {
        if targets.is_empty() {
            return 0;
        }

        let message = Arc::new(message);
        let mut queued = 0;
        let mut overflowed = Vec::new();

        for (id, queue, failures) in targets {
            match queue.push(message.clone()) {
                Pushed::Queued => queued += 1,
                Pushed::DroppedOldest => {
                    queued += 1;
                    let count = failures.fetch_add(1, Ordering::AcqRel) + 1;
                    tracing::warn!(
                        connection_id = id,
                        error = %DeliveryError::Overflow,
                        consecutive_failures = count,
                        "Subscriber queue full, dropped oldest batch"
                    );
                    if count >= self.config.max_consecutive_failures {
                        overflowed.push(id);
                    }
                }
                Pushed::Closed => {}
            }
        }

        for id in overflowed {
            if detach(&self.connections, id).await.is_some() {
                tracing::warn!(connection_id = id, "Subscriber cannot keep up, disconnected");
            }
        }

        tracing::debug!(
            connections = queued,
            records = message.len(),
            "Queued batch for subscribers"
        );
        queued
    }
}

async fn detach(connections: &Registry, id: ConnectionId) -> Option<Connection> {
    let removed = connections.write().await.remove(&id);
    if let Some(conn) = &removed {
        conn.queue.close();
        tracing::info!(connection_id = id, user_id = %conn.user, "Subscriber disconnected");
    }
    removed
}

async fn run_writer(
    id: ConnectionId,
    queue: Arc<OutboundQueue>,
    failures: Arc<AtomicU32>,
    sink: Arc<dyn MessageSink>,
    connections: Registry,
    config: BroadcastConfig,
) {
    while let Some(message) = queue.pop().await {
        let result = match tokio::time::timeout(config.send_timeout, sink.send(message)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::TimedOut(config.send_timeout)),
        };

        match result {
            Ok(()) => failures.store(0, Ordering::Release),
            Err(DeliveryError::Closed) => {
                tracing::debug!(connection_id = id, "Subscriber went away");
                detach(&connections, id).await;
                break;
            }
            Err(e) => {
                let count = failures.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::warn!(
                    connection_id = id,
                    error = %e,
                    consecutive_failures = count,
                    "Failed to deliver batch"
                );
                if count >= config.max_consecutive_failures {
                    detach(&connections, id).await;
                    break;
                }
            }
        }
    }
}
