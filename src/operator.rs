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

//! The operator supervisor.
//!
//! Owns the root cancellation token, starts one watch-loop task per
//! registered resource type plus the leader elector, and aggregates
//! their lifetimes. Shutdown cancels everything and drains with a
//! bounded timeout.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::OperatorConfig;
use crate::leader_election::{
    FunctionLeaderCallbacks, LeaderElection, LeaderGate,
};
use crate::registration::{ControllerDescriptor, ControllerRegistry};

/// The operator runtime.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use kube_operator_rust::config::OperatorConfig;
/// use kube_operator_rust::operator::Operator;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let mut operator = Operator::new(OperatorConfig::default());
///     // operator.register(descriptor);
///     operator.run().await?;
///     Ok(())
/// }
/// ```
pub struct Operator {
    /// Configuration for this instance.
    config: Arc<OperatorConfig>,

    /// Registry of all registered controllers.
    registry: ControllerRegistry,

    /// Leader elector, when election is enabled.
    elector: Option<Arc<dyn LeaderElection>>,

    /// Leadership gate handed to every watch loop.
    gate: LeaderGate,

    /// Root cancellation token for shutdown.
    shutdown_token: CancellationToken,

    /// Controllers that are currently running.
    running_controllers: Arc<tokio::sync::RwLock<HashSet<String>>>,
}

impl Operator {
    /// Creates an operator without leader election; every replica acts
    /// as the leader.
    pub fn new(config: OperatorConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: ControllerRegistry::new(),
            elector: None,
            gate: LeaderGate::always_leader(),
            shutdown_token: CancellationToken::new(),
            running_controllers: Arc::new(tokio::sync::RwLock::new(HashSet::new())),
        }
    }

    /// Creates an operator gated by the given leader elector.
    ///
    /// Watch loops keep watching while not leader (so the local view
    /// stays warm for a fast takeover) but suppress all write-causing
    /// work until the elector's gate opens.
    pub fn with_leader_election(config: OperatorConfig, elector: Arc<dyn LeaderElection>) -> Self {
        let gate = elector.gate();
        Self {
            config: Arc::new(config),
            registry: ControllerRegistry::new(),
            elector: Some(elector),
            gate,
            shutdown_token: CancellationToken::new(),
            running_controllers: Arc::new(tokio::sync::RwLock::new(HashSet::new())),
        }
    }

    /// Registers a controller.
    pub fn register(&mut self, descriptor: ControllerDescriptor) -> &mut Self {
        self.registry.register(descriptor);
        self
    }

    /// Returns the controller registry.
    pub fn registry(&self) -> &ControllerRegistry {
        &self.registry
    }

    /// Returns the shutdown cancellation token.
    ///
    /// Watch loops and user callbacks observe this token; external
    /// signal handlers cancel it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Returns the leadership gate.
    pub fn gate(&self) -> LeaderGate {
        self.gate.clone()
    }

    /// Initiates a graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("initiating graceful shutdown");
        self.shutdown_token.cancel();
    }

    /// Runs the operator.
    ///
    /// Starts the elector (when configured) and one watch loop per
    /// registered resource type, then waits until every loop finished
    /// or the shutdown token fires. A loop that fails is logged and
    /// isolated; its siblings keep running.
    pub async fn run(&self) -> anyhow::Result<()> {
        tracing::info!(
            operator = %self.config.generic.operator_name,
            controllers = self.registry.len(),
            "starting operator"
        );

        if self.registry.is_empty() {
            tracing::warn!("no controllers registered, exiting");
            return Ok(());
        }

        if let Some(elector) = &self.elector {
            self.spawn_elector(elector.clone());
        }

        let mut join_set = self.spawn_controllers();

        // Wait for all loops to finish or for the shutdown signal.
        tokio::select! {
            _ = async {
                while let Some(result) = join_set.join_next().await {
                    self.log_controller_exit(result);
                }
            } => {
                tracing::info!("all controllers finished");
            }

            _ = self.shutdown_token.cancelled() => {
                tracing::info!("shutdown signal received, waiting for controllers to stop");
            }
        }

        self.drain(join_set).await;

        if let Some(elector) = &self.elector {
            elector.stop();
        }

        Ok(())
    }

    /// Spawns the elector task and a watcher that stops it on shutdown.
    fn spawn_elector(&self, elector: Arc<dyn LeaderElection>) {
        let callbacks = Arc::new(FunctionLeaderCallbacks {
            on_started_leading: Arc::new(|| {
                tracing::info!("promoted to leader, reconciliation writes enabled");
            }),
            on_stopped_leading: Arc::new(|| {
                tracing::warn!("demoted from leader, reconciliation writes suspended");
            }),
        });

        tokio::spawn({
            let elector = elector.clone();
            async move {
                if let Err(e) = elector.run(callbacks).await {
                    tracing::error!(error = format!("{e:#}"), "leader election task failed");
                }
            }
        });

        tokio::spawn({
            let shutdown = self.shutdown_token.clone();
            async move {
                shutdown.cancelled().await;
                elector.stop();
            }
        });
    }

    /// Spawns every registered controller with a jittered start delay.
    fn spawn_controllers(&self) -> JoinSet<(String, anyhow::Result<()>)> {
        let start_interval = self.config.generic.controller_start_interval;
        let mut join_set = JoinSet::new();

        for descriptor in self.registry.descriptors() {
            let key = descriptor.config().key();
            let cancel = self.shutdown_token.clone();
            let running = self.running_controllers.clone();
            let loop_future = descriptor.start(self.gate.clone(), cancel);

            // Spread controller starts so the loops do not relist
            // against the API server in lockstep.
            let jitter = rand::random::<f64>();
            let delay = Duration::from_secs_f64(start_interval.as_secs_f64() * (1.0 + jitter));

            join_set.spawn(async move {
                tokio::time::sleep(delay).await;

                tracing::info!(controller = %key, "starting controller");
                {
                    let mut running = running.write().await;
                    running.insert(key.clone());
                }

                let result = loop_future.await;

                {
                    let mut running = running.write().await;
                    running.remove(&key);
                }

                (key, result)
            });
        }

        join_set
    }

    /// Logs one finished controller task. A failed loop never takes its
    /// siblings down.
    fn log_controller_exit(
        &self,
        result: Result<(String, anyhow::Result<()>), tokio::task::JoinError>,
    ) {
        match result {
            Ok((key, Ok(()))) => {
                tracing::info!(controller = %key, "controller stopped");
            }
            Ok((key, Err(e))) => {
                tracing::error!(
                    controller = %key,
                    error = format!("{e:#}"),
                    "controller failed, remaining controllers keep running"
                );
            }
            Err(e) => {
                if e.is_panic() {
                    tracing::error!("controller task panicked");
                } else {
                    tracing::warn!(error = %e, "controller task failed");
                }
            }
        }
    }

    /// Waits for remaining controllers with the configured timeout.
    async fn drain(&self, mut join_set: JoinSet<(String, anyhow::Result<()>)>) {
        let deadline = tokio::time::Instant::now() + self.config.generic.shutdown_timeout;

        while !join_set.is_empty() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());

            if remaining.is_zero() {
                let running = self.running_controllers.read().await;
                if !running.is_empty() {
                    tracing::warn!(
                        controllers = ?running.iter().collect::<Vec<_>>(),
                        "shutdown timeout reached, controllers still running"
                    );
                }
                break;
            }

            tokio::select! {
                result = join_set.join_next() => {
                    match result {
                        Some(finished) => self.log_controller_exit(finished),
                        None => break,
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    let running = self.running_controllers.read().await;
                    if !running.is_empty() {
                        tracing::debug!(
                            controllers = ?running.iter().collect::<Vec<_>>(),
                            "still waiting for controllers"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_with_empty_registry_exits() {
        let operator = Operator::new(OperatorConfig::default());
        operator.run().await.unwrap();
    }

    #[test]
    fn test_gate_defaults_to_leader_without_election() {
        let operator = Operator::new(OperatorConfig::default());
        assert!(operator.gate().is_leader());
    }

    #[test]
    fn test_shutdown_cancels_token() {
        let operator = Operator::new(OperatorConfig::default());
        let token = operator.shutdown_token();

        assert!(!token.is_cancelled());
        operator.shutdown();
        assert!(token.is_cancelled());
    }
}
