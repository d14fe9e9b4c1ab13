//! Periodic reconciliation of the route table against running workloads
//!
//! Each cycle lists workloads, inspects them with bounded concurrency, and
//! `put`s the routes the naming policy derives for them. A failed listing skips
//! the cycle; a failed inspection skips only that workload. Existing routes are
//! never cleared by a failure.

use crate::config::{DiscoveryConfig, EvictionPolicy};
use crate::docker::{DiscoveryClient, DiscoveryError, Workload};
use crate::naming::NamingPolicy;
use crate::routes::{PutOutcome, RoutingKey, SharedRouteTable};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Where the reconciler is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerPhase {
    /// Waiting for the next tick
    Idle,
    /// Listing and inspecting workloads
    Polling,
    /// Applying derived routes to the table
    Reconciling,
}

/// Summary of one reconciliation cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Workloads returned by the listing
    pub listed: usize,
    /// Workloads successfully inspected
    pub inspected: usize,
    /// Workloads that vanished or had no routable address
    pub absent: usize,
    /// Inspections that failed
    pub failed: usize,
    /// Routes inserted or pointed at a new endpoint
    pub registered: usize,
    /// Routes that already matched
    pub unchanged: usize,
    /// Routes removed by the eviction policy
    pub evicted: usize,
}

impl CycleReport {
    /// Whether the cycle altered the route table
    pub fn changed(&self) -> bool {
        self.registered > 0 || self.evicted > 0
    }
}

/// Keeps the route table in sync with the discovery source
pub struct Reconciler<C, P> {
    client: C,
    policy: P,
    table: SharedRouteTable,
    interval: Duration,
    inspect_concurrency: usize,
    eviction: EvictionPolicy,
    phase: Mutex<ReconcilerPhase>,
    /// Routing keys registered per workload id in the last cycle
    owned: Mutex<HashMap<String, Vec<RoutingKey>>>,
}

impl<C, P> Reconciler<C, P>
where
    C: DiscoveryClient,
    P: NamingPolicy,
{
    pub fn new(client: C, policy: P, table: SharedRouteTable, config: &DiscoveryConfig) -> Self {
        Self {
            client,
            policy,
            table,
            interval: config.poll_interval(),
            inspect_concurrency: config.inspect_concurrency.max(1),
            eviction: config.eviction,
            phase: Mutex::new(ReconcilerPhase::Idle),
            owned: Mutex::new(HashMap::new()),
        }
    }

    pub fn phase(&self) -> ReconcilerPhase {
        *self.phase.lock()
    }

    pub fn table(&self) -> &SharedRouteTable {
        &self.table
    }

    /// Reconcile on a fixed interval until shutdown is signalled.
    ///
    /// The first cycle runs immediately so routes exist as soon as possible.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.interval.as_millis() as u64,
            eviction = ?self.eviction,
            "Discovery loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        info!("Discovery loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run one cycle, logging instead of returning failures
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        let result = self.reconcile_once().await;
        let reached = self.phase();
        self.set_phase(ReconcilerPhase::Idle);

        match result {
            Ok(report) => {
                if report.changed() {
                    info!(
                        listed = report.listed,
                        inspected = report.inspected,
                        registered = report.registered,
                        evicted = report.evicted,
                        routes = self.table.len(),
                        "Route table updated"
                    );
                } else {
                    debug!(
                        listed = report.listed,
                        inspected = report.inspected,
                        routes = self.table.len(),
                        "Route table unchanged"
                    );
                }
                if tracing::enabled!(tracing::Level::DEBUG) {
                    for entry in self.table.snapshot() {
                        debug!(key = %entry.key, target = %entry.target, "Route");
                    }
                }
                Some(report)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    phase = ?reached,
                    routes = self.table.len(),
                    "Discovery cycle failed, keeping existing routes"
                );
                None
            }
        }
    }

    /// List, inspect and apply. Fails only if the listing fails.
    pub async fn reconcile_once(&self) -> Result<CycleReport, DiscoveryError> {
        self.set_phase(ReconcilerPhase::Polling);
        let summaries = self.client.list_workloads().await?;

        let mut report = CycleReport {
            listed: summaries.len(),
            ..Default::default()
        };

        let client = &self.client;
        let inspections: Vec<(String, Result<Option<Workload>, DiscoveryError>)> =
            stream::iter(summaries)
                .map(|summary| async move {
                    let result = client.inspect_workload(&summary.id).await;
                    (summary.id, result)
                })
                .buffer_unordered(self.inspect_concurrency)
                .collect()
                .await;

        self.set_phase(ReconcilerPhase::Reconciling);
        let previous = std::mem::take(&mut *self.owned.lock());
        let mut owned_now: HashMap<String, Vec<RoutingKey>> = HashMap::new();

        for (id, result) in inspections {
            match result {
                Ok(Some(workload)) => {
                    report.inspected += 1;
                    let mut keys = Vec::new();
                    for entry in self.policy.routes_for(&workload) {
                        keys.push(entry.key.clone());
                        let (key, target) = (entry.key.to_string(), entry.target.to_string());
                        match self.table.put_entry(entry) {
                            PutOutcome::Inserted | PutOutcome::Updated => {
                                report.registered += 1;
                                debug!(container = %workload.name, key, target, "Registered route");
                            }
                            PutOutcome::Unchanged => report.unchanged += 1,
                            PutOutcome::Rejected => {
                                debug!(
                                    container = %workload.name,
                                    key,
                                    target,
                                    "Rejected invalid route"
                                );
                            }
                        }
                    }
                    owned_now.insert(id, keys);
                }
                Ok(None) => {
                    report.absent += 1;
                    debug!(id, "Workload not routable, skipping");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(id, error = %e, "Failed to inspect workload, skipping");
                    // Unknown state: keep whatever it owned before
                    if let Some(keys) = previous.get(&id) {
                        owned_now.insert(id, keys.clone());
                    }
                }
            }
        }

        if self.eviction == EvictionPolicy::Absent {
            let live: HashSet<&RoutingKey> = owned_now.values().flatten().collect();
            for key in previous.values().flatten() {
                if !live.contains(key) && self.table.remove(key).is_some() {
                    report.evicted += 1;
                    debug!(key = %key, "Evicted route of vanished workload");
                }
            }
        }

        *self.owned.lock() = owned_now;
        Ok(report)
    }

    fn set_phase(&self, phase: ReconcilerPhase) {
        *self.phase.lock() = phase;
    }
}
