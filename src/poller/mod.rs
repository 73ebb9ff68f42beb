//! Periodic polling of every configured download client
//!
//! Each tick fans out one fetch per instance, all running concurrently and
//! each bounded by the fetch timeout. Results are merged into the
//! [`Snapshot`], and the records that changed enough to matter are handed to
//! the [`Broadcaster`] as one batch.
//!
//! Failures stay with their instance:
//! - transient errors and timeouts: the instance's last records are carried
//!   forward and the fetch is retried next tick
//! - decode errors: the payload is dropped for this tick only
//! - rejected credentials, TLS, bad configuration: the instance is marked
//!   degraded and stops being fetched. On an exponential backoff the adapter's
//!   `health_check` re-validates it, or the registry builds one if the
//!   instance never connected

use crate::broadcast::Broadcaster;
use crate::clients::{AdapterRegistry, ClientAdapter};
use crate::config::{ClientConfig, PollerConfig, RetryConfig};
use crate::error::ClientError;
use crate::retry::{Backoff, IsRetryable};
use crate::types::{DownloadRecord, OutboundMessage};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

pub mod snapshot;

pub use snapshot::Snapshot;

/// Connection state of one client instance
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InstanceHealth {
    /// Last fetch succeeded
    Healthy,
    /// Not connected yet, or the last fetch failed transiently
    Disconnected {
        /// Last failure
        reason: String,
    },
    /// Credentials or configuration rejected; reconnecting on a backoff
    Degraded {
        /// Last failure
        reason: String,
        /// Earliest next reconnect attempt
        retry_at: DateTime<Utc>,
        /// Reconnect attempts so far
        attempts: u32,
    },
}

impl InstanceHealth {
    /// Whether the instance is serving fresh data
    pub fn is_healthy(&self) -> bool {
        matches!(self, InstanceHealth::Healthy)
    }
}

/// Read-only view of one instance
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct InstanceStatus {
    /// Instance name (record `source`)
    pub name: String,
    /// Backend type
    pub kind: String,
    /// Current health
    pub health: InstanceHealth,
}

struct Instance {
    name: String,
    config: ClientConfig,
    adapter: Option<Arc<dyn ClientAdapter>>,
    health: InstanceHealth,
    backoff: Backoff,
    next_attempt: Option<Instant>,
}

/// What one instance does this tick
enum Plan {
    Fetch(Arc<dyn ClientAdapter>),
    Recheck(Arc<dyn ClientAdapter>),
    Connect(ClientConfig),
    Wait,
}

enum Outcome {
    Records(Vec<DownloadRecord>),
    Connected(Arc<dyn ClientAdapter>),
    Rechecked(Result<(), ClientError>),
    Failed(ClientError),
    TimedOut,
    Skipped,
}

impl Instance {
    fn plan(&self, now: Instant) -> Plan {
        if let Some(at) = self.next_attempt
            && at > now
        {
            return Plan::Wait;
        }
        match (&self.adapter, &self.health) {
            (Some(adapter), InstanceHealth::Degraded { .. }) => Plan::Recheck(adapter.clone()),
            (Some(adapter), _) => Plan::Fetch(adapter.clone()),
            (None, _) => Plan::Connect(self.config.clone()),
        }
    }

    /// Record the outcome; returns fresh records, or `None` to carry forward
    fn settle(
        &mut self,
        outcome: Outcome,
        fetch_timeout: std::time::Duration,
    ) -> Option<Vec<DownloadRecord>> {
        match outcome {
            Outcome::Records(records) => {
                if !self.health.is_healthy() {
                    tracing::info!(instance = %self.name, "Client instance recovered");
                }
                self.mark_healthy();
                Some(records)
            }
            Outcome::Connected(adapter) => {
                tracing::info!(instance = %self.name, kind = adapter.kind(), "Client instance connected");
                self.adapter = Some(adapter);
                self.mark_healthy();
                None
            }
            Outcome::Rechecked(Ok(())) => {
                tracing::info!(instance = %self.name, "Client instance credentials accepted again");
                self.mark_healthy();
                None
            }
            Outcome::Rechecked(Err(e)) if e.is_retryable() => {
                self.disconnected(e.to_string());
                None
            }
            Outcome::Rechecked(Err(e)) => {
                self.degrade(e.to_string());
                None
            }
            Outcome::Failed(ClientError::Decode { reason, .. }) if self.adapter.is_some() => {
                // Payload already logged with its excerpt by the adapter
                tracing::warn!(
                    instance = %self.name,
                    error = %reason,
                    "Dropping undecodable client response for this tick"
                );
                None
            }
            Outcome::Failed(e) if e.is_retryable() => {
                self.disconnected(e.to_string());
                None
            }
            Outcome::Failed(e) => {
                self.degrade(e.to_string());
                None
            }
            Outcome::TimedOut => {
                self.disconnected(format!("no response within {:?}", fetch_timeout));
                None
            }
            Outcome::Skipped => None,
        }
    }

    fn mark_healthy(&mut self) {
        self.health = InstanceHealth::Healthy;
        self.backoff.reset();
        self.next_attempt = None;
    }

    fn disconnected(&mut self, reason: String) {
        tracing::warn!(instance = %self.name, error = %reason, "Client instance unreachable");
        // A live adapter is simply retried next tick; reconnects back off
        self.next_attempt = match self.adapter {
            Some(_) => None,
            None => Some(Instant::now() + self.backoff.next_delay()),
        };
        self.health = InstanceHealth::Disconnected { reason };
    }

    fn degrade(&mut self, reason: String) {
        let delay = self.backoff.next_delay();
        let retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        tracing::warn!(
            instance = %self.name,
            error = %reason,
            attempts = self.backoff.attempts(),
            retry_in_secs = delay.as_secs(),
            "Client instance degraded"
        );

        // The adapter stays parked; the retry re-validates it with a health check
        self.next_attempt = Some(Instant::now() + delay);
        self.health = InstanceHealth::Degraded {
            reason,
            retry_at,
            attempts: self.backoff.attempts(),
        };
    }

    fn status(&self) -> InstanceStatus {
        InstanceStatus {
            name: self.name.clone(),
            kind: self.config.kind.clone(),
            health: self.health.clone(),
        }
    }
}

/// Timer-driven poller over all configured client instances
pub struct DownloadPoller {
    config: PollerConfig,
    registry: Arc<AdapterRegistry>,
    broadcaster: Arc<Broadcaster>,
    instances: Mutex<Vec<Instance>>,
    snapshot: Mutex<Snapshot>,
    snapshot_tx: watch::Sender<Arc<Vec<DownloadRecord>>>,
}

impl DownloadPoller {
    /// Create a poller; instances start disconnected until [`connect_all`](Self::connect_all)
    /// or the first tick
    pub fn new(
        config: PollerConfig,
        retry: RetryConfig,
        clients: Vec<ClientConfig>,
        registry: Arc<AdapterRegistry>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        let instances = clients
            .into_iter()
            .map(|mut client| {
                if client.timeout.is_none() {
                    client.timeout = Some(config.fetch_timeout);
                }
                Instance {
                    name: client.instance_name(),
                    config: client,
                    adapter: None,
                    health: InstanceHealth::Disconnected {
                        reason: "not connected yet".to_string(),
                    },
                    backoff: Backoff::new(retry.clone()),
                    next_attempt: None,
                }
            })
            .collect();

        let (snapshot_tx, _) = watch::channel(Arc::new(Vec::new()));

        Self {
            snapshot: Mutex::new(Snapshot::new(config.progress_threshold, config.grace_ticks)),
            config,
            registry,
            broadcaster,
            instances: Mutex::new(instances),
            snapshot_tx,
        }
    }

    /// Attach an already-connected adapter, bypassing the registry
    pub async fn attach(&self, adapter: Arc<dyn ClientAdapter>) {
        let mut instances = self.instances.lock().await;
        let name = adapter.source().to_string();
        if let Some(instance) = instances.iter_mut().find(|i| i.name == name) {
            instance.adapter = Some(adapter);
            instance.mark_healthy();
            return;
        }

        let config = ClientConfig {
            name: Some(name.clone()),
            kind: adapter.kind().to_string(),
            base_url: String::new(),
            api_key: None,
            username: None,
            password: None,
            tls_verify: true,
            timeout: Some(self.config.fetch_timeout),
        };
        instances.push(Instance {
            name,
            config,
            adapter: Some(adapter),
            health: InstanceHealth::Healthy,
            backoff: Backoff::new(RetryConfig::default()),
            next_attempt: None,
        });
    }

    /// One connect attempt per unconnected instance, all concurrently
    ///
    /// Failures never abort startup; they put the instance on the backoff
    /// schedule for later ticks.
    pub async fn connect_all(&self) {
        let plans = self.plans(Instant::now(), true).await;
        let outcomes = join_all(plans.into_iter().map(|(idx, plan)| async move {
            (idx, self.execute(plan).await)
        }))
        .await;

        let mut instances = self.instances.lock().await;
        for (idx, outcome) in outcomes {
            if let Some(instance) = instances.get_mut(idx) {
                instance.settle(outcome, self.config.fetch_timeout);
            }
        }

        let healthy = instances.iter().filter(|i| i.health.is_healthy()).count();
        tracing::info!(
            healthy,
            total = instances.len(),
            "Client instances connected"
        );
    }

    /// Run one poll cycle and return the records that were broadcast
    pub async fn tick(&self) -> Vec<DownloadRecord> {
        let plans = self.plans(Instant::now(), false).await;
        let outcomes = join_all(plans.into_iter().map(|(idx, plan)| async move {
            (idx, self.execute(plan).await)
        }))
        .await;

        let mut fresh = Vec::new();
        let mut carried = HashSet::new();
        {
            let mut instances = self.instances.lock().await;
            for (idx, outcome) in outcomes {
                let Some(instance) = instances.get_mut(idx) else {
                    continue;
                };
                match instance.settle(outcome, self.config.fetch_timeout) {
                    Some(records) => fresh.extend(records),
                    None => {
                        carried.insert(instance.name.clone());
                    }
                }
            }
        }

        let changes = {
            let mut snapshot = self.snapshot.lock().await;
            let changes = snapshot.apply(fresh, &carried);
            self.snapshot_tx.send_replace(Arc::new(snapshot.records()));
            changes
        };

        if !changes.is_empty() {
            let delivered = self
                .broadcaster
                .broadcast_all(OutboundMessage::progress_batch(changes.clone()))
                .await;
            tracing::debug!(
                changed = changes.len(),
                connections = delivered,
                "Broadcast download changes"
            );
        }

        changes
    }

    /// Poll until cancelled
    ///
    /// Cancellation abandons the tick in flight, dropping its fetches, and
    /// nothing further is broadcast.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            "Download poller started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::debug!("Abandoning poll tick on shutdown");
                            break;
                        }
                        _ = self.tick() => {}
                    }
                }
            }
        }

        tracing::info!("Download poller stopped");
    }

    /// Spawn [`run`](Self::run) on the runtime
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(cancel))
    }

    /// Current merged snapshot
    pub fn snapshot(&self) -> Arc<Vec<DownloadRecord>> {
        self.snapshot_tx.borrow().clone()
    }

    /// Receiver that observes every snapshot update
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<DownloadRecord>>> {
        self.snapshot_tx.subscribe()
    }

    /// Health of every configured instance
    pub async fn instance_health(&self) -> Vec<InstanceStatus> {
        self.instances
            .lock()
            .await
            .iter()
            .map(Instance::status)
            .collect()
    }

    async fn plans(&self, now: Instant, connect_only: bool) -> Vec<(usize, Plan)> {
        self.instances
            .lock()
            .await
            .iter()
            .enumerate()
            .map(|(idx, instance)| {
                let plan = match instance.plan(now) {
                    Plan::Fetch(_) if connect_only => Plan::Wait,
                    plan => plan,
                };
                (idx, plan)
            })
            .collect()
    }

    async fn execute(&self, plan: Plan) -> Outcome {
        let limit = self.config.fetch_timeout;
        match plan {
            Plan::Fetch(adapter) => match tokio::time::timeout(limit, adapter.list_active()).await {
                Ok(Ok(records)) => Outcome::Records(records),
                Ok(Err(e)) => Outcome::Failed(e),
                Err(_) => Outcome::TimedOut,
            },
            Plan::Recheck(adapter) => {
                match tokio::time::timeout(limit, adapter.health_check()).await {
                    Ok(result) => Outcome::Rechecked(result),
                    Err(_) => Outcome::TimedOut,
                }
            }
            Plan::Connect(config) => {
                match tokio::time::timeout(limit, self.registry.instantiate(config)).await {
                    Ok(Ok(adapter)) => Outcome::Connected(adapter),
                    Ok(Err(e)) => Outcome::Failed(e),
                    Err(_) => Outcome::TimedOut,
                }
            }
            Plan::Wait => Outcome::Skipped,
        }
    }
}
