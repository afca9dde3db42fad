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

//! Configuration structures for the operator.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registration::ResourceConfig;

/// Errors found while validating the configuration.
///
/// These are fatal at startup, before any watch is opened.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("renew interval ({renew_interval:?}) must be materially shorter than the lease duration ({lease_duration:?})")]
    RenewIntervalTooLong {
        renew_interval: Duration,
        lease_duration: Duration,
    },

    #[error("lease name cannot be empty")]
    EmptyLeaseName,
}

/// Main configuration for the operator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    /// Generic configuration applicable to the whole process.
    #[serde(default)]
    pub generic: GenericOperatorConfig,

    /// Leader election configuration.
    #[serde(default)]
    pub leader_election: LeaderElectionConfig,

    /// Resource types to watch, each registered with its own controller.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

impl OperatorConfig {
    /// Validates process-level settings.
    ///
    /// Per-resource settings are validated when the resource is
    /// registered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.leader_election.validate()
    }
}

/// Generic configuration applicable to the whole process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericOperatorConfig {
    /// Kubeconfig file for talking to the apiserver.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,

    /// Name of this operator, used for logging and election identity.
    #[serde(default = "default_operator_name")]
    pub operator_name: String,

    /// Namespace the operator itself runs in; the default home for the
    /// election lease.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Server-side timeout for each watch request. The server closes
    /// the stream when it elapses and the loop resubscribes.
    #[serde(default = "default_watch_timeout", with = "humantime_serde")]
    pub watch_timeout: Duration,

    /// The base interval between each controller starting.
    #[serde(
        default = "default_controller_start_interval",
        with = "humantime_serde"
    )]
    pub controller_start_interval: Duration,

    /// The maximum time to wait for controllers to stop on shutdown.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// The address to serve health checks.
    #[serde(default = "default_healthz_address")]
    pub healthz_bind_address: String,

    /// The port to serve health checks.
    #[serde(default = "default_healthz_port")]
    pub healthz_bind_port: u16,
}

impl Default for GenericOperatorConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            master: None,
            operator_name: default_operator_name(),
            namespace: default_namespace(),
            watch_timeout: default_watch_timeout(),
            controller_start_interval: default_controller_start_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            healthz_bind_address: default_healthz_address(),
            healthz_bind_port: default_healthz_port(),
        }
    }
}

fn default_operator_name() -> String {
    "kube-operator".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_watch_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_controller_start_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_healthz_address() -> String {
    "0.0.0.0".to_string()
}

fn default_healthz_port() -> u16 {
    10257
}

/// Leader election configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderElectionConfig {
    /// Whether leader election is enabled. When disabled, every replica
    /// acts as the leader.
    #[serde(default = "default_leader_election")]
    pub enabled: bool,

    /// Name of the lease object used as the mutual-exclusion token.
    #[serde(default = "default_lease_name")]
    pub lease_name: String,

    /// Namespace of the lease object. Defaults to the operator's own
    /// namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_namespace: Option<String>,

    /// How long a renewal keeps the lease valid.
    #[serde(default = "default_lease_duration", with = "humantime_serde")]
    pub lease_duration: Duration,

    /// How often the current leader renews.
    ///
    /// Must be materially shorter than the lease duration so a missed
    /// renewal or two does not immediately forfeit leadership.
    #[serde(default = "default_renew_interval", with = "humantime_serde")]
    pub renew_interval: Duration,

    /// How long a non-leader waits before retrying acquisition.
    #[serde(default = "default_retry_period", with = "humantime_serde")]
    pub retry_period: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: default_leader_election(),
            lease_name: default_lease_name(),
            lease_namespace: None,
            lease_duration: default_lease_duration(),
            renew_interval: default_renew_interval(),
            retry_period: default_retry_period(),
        }
    }
}

impl LeaderElectionConfig {
    /// Sets the lease name.
    pub fn with_lease_name(mut self, name: impl Into<String>) -> Self {
        self.lease_name = name.into();
        self
    }

    /// Sets the lease duration.
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    /// Sets the renew interval.
    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = interval;
        self
    }

    /// Sets the retry period.
    pub fn with_retry_period(mut self, period: Duration) -> Self {
        self.retry_period = period;
        self
    }

    /// Checks the election settings for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_name.is_empty() {
            return Err(ConfigError::EmptyLeaseName);
        }
        if self.renew_interval >= self.lease_duration {
            return Err(ConfigError::RenewIntervalTooLong {
                renew_interval: self.renew_interval,
                lease_duration: self.lease_duration,
            });
        }
        Ok(())
    }
}

fn default_leader_election() -> bool {
    true
}

fn default_lease_name() -> String {
    "kube-operator-leader".to_string()
}

fn default_lease_duration() -> Duration {
    Duration::from_secs(15)
}

fn default_renew_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_retry_period() -> Duration {
    Duration::from_secs(2)
}
