//! The gateway pool: one broker per registered upstream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};
use warden_audit::Ledger;
use warden_core::GatewayId;
use warden_policy::GatewayPolicy;

use crate::approval::PendingMap;
use crate::broker::ToolBroker;
use crate::error::BrokerResult;
use crate::types::{BrokerStats, ServerSpec};

/// Status row for one pooled gateway.
#[derive(Debug, Clone)]
pub struct GatewayStatus {
    /// The gateway id.
    pub gateway_id: GatewayId,
    /// Whether its subprocess is running.
    pub connected: bool,
    /// Broker statistics.
    pub stats: BrokerStats,
}

/// Maps gateway ids to live brokers.
///
/// Registration is idempotent: registering an id that already exists
/// tears the prior broker down and replaces it. Pending approvals are
/// keyed per gateway id *outside* the brokers, so they survive
/// re-registration.
pub struct GatewayPool {
    ledger: Arc<Ledger>,
    brokers: Mutex<HashMap<String, Arc<ToolBroker>>>,
    approvals: std::sync::Mutex<HashMap<String, Arc<PendingMap>>>,
    request_timeout: Option<Duration>,
}

impl GatewayPool {
    /// Create an empty pool writing to the given ledger.
    #[must_use]
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            brokers: Mutex::new(HashMap::new()),
            approvals: std::sync::Mutex::new(HashMap::new()),
            request_timeout: None,
        }
    }

    /// Override the per-request timeout for brokers created later.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Register (or replace) a gateway and connect its broker.
    ///
    /// # Errors
    ///
    /// Propagates connect errors; on failure any prior broker under
    /// the id is left in place.
    pub async fn register(
        &self,
        gateway_id: GatewayId,
        spec: &ServerSpec,
        policy: GatewayPolicy,
    ) -> BrokerResult<Arc<ToolBroker>> {
        let pending = self.approval_map(&gateway_id);

        let broker = Arc::new(
            ToolBroker::connect(
                gateway_id.clone(),
                spec,
                policy,
                Arc::clone(&self.ledger),
                pending,
                self.request_timeout,
            )
            .await?,
        );

        let previous = self
            .brokers
            .lock()
            .await
            .insert(gateway_id.as_str().to_string(), Arc::clone(&broker));

        if let Some(previous) = previous {
            info!(gateway = %gateway_id, "replacing existing broker");
            if let Err(e) = previous.shutdown() {
                warn!(gateway = %gateway_id, error = %e, "failed to log teardown of replaced broker");
            }
        }

        Ok(broker)
    }

    /// Disconnect and evict a gateway. Returns `false` if it was not
    /// registered.
    pub async fn deregister(&self, gateway_id: &GatewayId) -> bool {
        let removed = self.brokers.lock().await.remove(gateway_id.as_str());
        match removed {
            Some(broker) => {
                if let Err(e) = broker.shutdown() {
                    warn!(gateway = %gateway_id, error = %e, "failed to log gateway disconnect");
                }
                true
            },
            None => false,
        }
    }

    /// Fetch a registered broker.
    pub async fn get(&self, gateway_id: &GatewayId) -> Option<Arc<ToolBroker>> {
        self.brokers.lock().await.get(gateway_id.as_str()).cloned()
    }

    /// Status of every registered gateway.
    pub async fn list(&self) -> Vec<GatewayStatus> {
        let brokers = self.brokers.lock().await;
        let mut statuses: Vec<GatewayStatus> = brokers
            .values()
            .map(|broker| GatewayStatus {
                gateway_id: broker.gateway_id().clone(),
                connected: broker.is_connected(),
                stats: broker.stats(),
            })
            .collect();
        statuses.sort_by(|a, b| a.gateway_id.as_str().cmp(b.gateway_id.as_str()));
        statuses
    }

    /// Number of registered gateways.
    pub async fn gateway_count(&self) -> usize {
        self.brokers.lock().await.len()
    }

    /// Disconnect every gateway (process shutdown).
    pub async fn shutdown_all(&self) {
        let mut brokers = self.brokers.lock().await;
        for (id, broker) in brokers.drain() {
            if let Err(e) = broker.shutdown() {
                warn!(gateway = %id, error = %e, "failed to log gateway disconnect");
            }
        }
    }

    fn approval_map(&self, gateway_id: &GatewayId) -> Arc<PendingMap> {
        match self.approvals.lock() {
            Ok(mut approvals) => Arc::clone(
                approvals
                    .entry(gateway_id.as_str().to_string())
                    .or_default(),
            ),
            Err(_) => Arc::new(PendingMap::new()),
        }
    }
}

impl std::fmt::Debug for GatewayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayPool").finish_non_exhaustive()
    }
}
