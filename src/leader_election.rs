// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Leader election support.
//!
//! At most one operator replica may be "active" (permitted to run
//! write-causing reconciliation) at any instant. A cluster-wide Lease
//! object arbitrates which one: the holder renews it periodically, and
//! a crashed holder's lease expires and becomes acquirable by any
//! contender.
//!
//! There is no fencing token: between lease expiry and the new holder's
//! first write there is a window in which a demoted former leader can
//! complete an in-flight write. Known limitation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{ConfigError, LeaderElectionConfig};
use crate::gateway::{GatewayError, LeaseGateway, LeaseRecord};

/// Callbacks for leader election events.
pub trait LeaderCallbacks: Send + Sync + 'static {
    /// Called when this instance becomes the leader.
    fn on_started_leading(&self);

    /// Called when this instance stops being the leader.
    fn on_stopped_leading(&self);
}

/// Function-based leader callbacks.
pub struct FunctionLeaderCallbacks {
    /// Called when leadership is acquired.
    pub on_started_leading: Arc<dyn Fn() + Send + Sync>,

    /// Called when leadership is lost.
    pub on_stopped_leading: Arc<dyn Fn() + Send + Sync>,
}

impl LeaderCallbacks for FunctionLeaderCallbacks {
    fn on_started_leading(&self) {
        (self.on_started_leading)();
    }

    fn on_stopped_leading(&self) {
        (self.on_stopped_leading)();
    }
}

/// A cheap, cloneable view of the current leadership state.
///
/// Every watch loop consults its gate before write-causing work; the
/// elector flips the shared flag as leadership changes hands.
#[derive(Debug, Clone)]
pub struct LeaderGate {
    flag: Arc<AtomicBool>,
}

impl LeaderGate {
    /// A gate that is always open. Used when leader election is
    /// disabled and every replica acts as the leader.
    pub fn always_leader() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    /// Returns true while this replica holds leadership.
    pub fn is_leader(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Leader election interface.
///
/// Implementations provide different arbitration backends.
#[async_trait::async_trait]
pub trait LeaderElection: Send + Sync + 'static {
    /// Runs the leader election loop.
    ///
    /// This method will:
    /// 1. Attempt to acquire leadership
    /// 2. Call `on_started_leading` if successful
    /// 3. Continuously renew the lease
    /// 4. Call `on_stopped_leading` if leadership is lost
    /// 5. Retry if the lease cannot be acquired/renewed
    async fn run(&self, callbacks: Arc<dyn LeaderCallbacks>) -> anyhow::Result<()>;

    /// Returns true while this instance is the leader.
    fn is_leader(&self) -> bool;

    /// Returns a gate sharing this elector's leadership flag.
    fn gate(&self) -> LeaderGate;

    /// Stops the leader election.
    fn stop(&self);
}

/// Lease-backed leader election.
///
/// The lease object is the only durable cross-replica state: it records
/// the holder identity, its last renewal, and how many times leadership
/// has changed hands. Any transport error during acquire or renew is
/// treated like a lost lease: the elector demotes itself and retries;
/// it never crashes the process.
pub struct LeaseLeaderElection {
    config: LeaderElectionConfig,
    identity: String,
    gateway: Arc<dyn LeaseGateway>,
    is_leader: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl LeaseLeaderElection {
    /// Creates a lease-backed elector.
    ///
    /// Fails fast on inconsistent election intervals.
    pub fn new(
        config: LeaderElectionConfig,
        identity: impl Into<String>,
        gateway: Arc<dyn LeaseGateway>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            identity: identity.into(),
            gateway,
            is_leader: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        })
    }

    /// The identity this elector competes with.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Makes one acquisition (or renewal) attempt.
    ///
    /// Creates the lease outright when it does not exist; otherwise
    /// reads it and takes over only when it is expired or already held
    /// by this identity. `lease_transitions` is incremented exactly
    /// once per holder change. A replace conflict means another
    /// contender raced the takeover and won; that is a clean "not
    /// leader", not an error.
    async fn try_acquire(&self) -> Result<bool, GatewayError> {
        let now = Utc::now();

        let fresh = LeaseRecord::held_by(&self.identity, self.config.lease_duration, now);
        match self.gateway.create(&fresh).await {
            Ok(_) => return Ok(true),
            Err(GatewayError::Conflict) => {}
            Err(e) => return Err(e),
        }

        let current = match self.gateway.get().await {
            Ok(lease) => lease,
            // Deleted between the create and the read; retry next tick.
            Err(GatewayError::NotFound) => return Ok(false),
            Err(e) => return Err(e),
        };

        let held_by_self = current.is_held_by(&self.identity);
        if !current.is_expired(now) && !held_by_self {
            trace!(
                holder = ?current.holder_identity,
                "lease held by another candidate"
            );
            return Ok(false);
        }

        let mut next = current.clone();
        next.holder_identity = Some(self.identity.clone());
        next.lease_duration = self.config.lease_duration;
        next.renew_time = Some(now);
        if !held_by_self {
            next.acquire_time = Some(now);
            if current.holder_identity.is_some() {
                next.lease_transitions = current.lease_transitions + 1;
            }
        }

        match self.gateway.replace(&next).await {
            Ok(_) => Ok(true),
            Err(GatewayError::Conflict) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Renews the lease until a renewal fails or the elector is
    /// stopped. Any failure, conflict or transport, forfeits
    /// leadership.
    async fn hold_lease(&self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.renew_interval) => {}
            }

            match self.try_acquire().await {
                Ok(true) => {
                    trace!(identity = %self.identity, "lease renewed");
                }
                Ok(false) => {
                    warn!(identity = %self.identity, "lease taken over by another candidate");
                    return;
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "lease renewal failed");
                    return;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl LeaderElection for LeaseLeaderElection {
    async fn run(&self, callbacks: Arc<dyn LeaderCallbacks>) -> anyhow::Result<()> {
        info!(
            identity = %self.identity,
            lease = %self.config.lease_name,
            "starting leader election"
        );

        loop {
            if self.cancel.is_cancelled() {
                info!("leader election cancelled");
                return Ok(());
            }

            match self.try_acquire().await {
                Ok(true) => {
                    self.is_leader.store(true, Ordering::SeqCst);
                    info!(identity = %self.identity, "acquired leadership");
                    callbacks.on_started_leading();

                    self.hold_lease().await;

                    self.is_leader.store(false, Ordering::SeqCst);
                    callbacks.on_stopped_leading();

                    if self.cancel.is_cancelled() {
                        info!("leader election cancelled");
                        return Ok(());
                    }
                    warn!(identity = %self.identity, "lost leadership");
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "not leader, will retry");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "leader election attempt failed");
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("leader election cancelled");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    fn gate(&self) -> LeaderGate {
        LeaderGate::from_flag(self.is_leader.clone())
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Creates a default identity for leader election.
///
/// Uses the hostname plus a random component.
pub fn create_identity() -> anyhow::Result<String> {
    let hostname = gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "unknown".to_string());

    let random: String = std::iter::repeat_with(rand::random::<u8>)
        .take(4)
        .map(|b| format!("{:02x}", b))
        .collect();

    Ok(format!("{}_{}", hostname, random))
}
