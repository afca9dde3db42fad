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

//! Controller registration.
//!
//! Each watched resource type is described by an explicit
//! [`ResourceConfig`] and registered as a [`ControllerDescriptor`]
//! pairing that metadata with a concrete, compile-time-typed watch
//! pipeline. The [`ControllerRegistry`] is built once at startup; the
//! registered metadata stays queryable afterwards for manifest
//! generation (CRDs, RBAC, Deployments).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::ResourceGateway;
use crate::leader_election::LeaderGate;
use crate::reconciler::{BoxFuture, CancellationToken, Reconciler};
use crate::resource::WatchedResource;
use crate::watcher::ResourceWatcher;

/// Errors raised while registering a controller.
///
/// These are fatal at registration time, before any watch starts.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("resource config is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("resource {0} is cluster-scoped but a namespace was configured")]
    NamespaceOnClusterScoped(String),
}

/// Explicit metadata for one watched resource type.
///
/// Everything the framework needs to know about a resource type is
/// supplied here at registration time: the group/version/kind triple,
/// the plural name used in API paths, the scope, the finalizer string
/// this controller owns, and watch tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    /// API group, empty for the core group.
    #[serde(default)]
    pub group: String,

    /// API version, e.g. `v1` or `v1alpha1`.
    pub version: String,

    /// Kind, e.g. `Demo`.
    pub kind: String,

    /// Plural name used in API paths, e.g. `demos`.
    pub plural: String,

    /// Whether the resource kind is cluster-scoped.
    #[serde(default)]
    pub cluster_scoped: bool,

    /// Restricts the watch to one namespace. `None` watches all
    /// namespaces (or the cluster, for cluster-scoped kinds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Label selector applied to list and watch requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,

    /// The finalizer string this controller owns. Derived from plural
    /// and group when not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalizer: Option<String>,

    /// How long the watch loop waits before resubscribing after the
    /// stream ends or fails.
    #[serde(default = "default_resubscribe_delay", with = "humantime_serde")]
    pub resubscribe_delay: Duration,
}

fn default_resubscribe_delay() -> Duration {
    Duration::from_secs(2)
}

impl ResourceConfig {
    /// Creates a config for the given group/version/kind/plural.
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        plural: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            plural: plural.into(),
            cluster_scoped: false,
            namespace: None,
            label_selector: None,
            finalizer: None,
            resubscribe_delay: default_resubscribe_delay(),
        }
    }

    /// Restricts the watch to one namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Marks the resource kind as cluster-scoped.
    pub fn cluster_scoped(mut self) -> Self {
        self.cluster_scoped = true;
        self
    }

    /// Applies a label selector to list and watch requests.
    pub fn with_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    /// Overrides the derived finalizer string.
    pub fn with_finalizer(mut self, finalizer: impl Into<String>) -> Self {
        self.finalizer = Some(finalizer.into());
        self
    }

    /// Sets the resubscribe delay.
    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// The `group/version` string, or just the version for the core
    /// group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// The finalizer string this controller owns.
    pub fn finalizer_name(&self) -> String {
        if let Some(finalizer) = &self.finalizer {
            return finalizer.clone();
        }
        if self.group.is_empty() {
            format!("{}/finalizer", self.plural)
        } else {
            format!("{}.{}/finalizer", self.plural, self.group)
        }
    }

    /// Unique registry key for this resource type: `plural.group`, or
    /// the plural alone for the core group.
    pub fn key(&self) -> String {
        if self.group.is_empty() {
            self.plural.clone()
        } else {
            format!("{}.{}", self.plural, self.group)
        }
    }

    /// Validates the config.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if self.version.is_empty() {
            return Err(RegistrationError::MissingField("version"));
        }
        if self.kind.is_empty() {
            return Err(RegistrationError::MissingField("kind"));
        }
        if self.plural.is_empty() {
            return Err(RegistrationError::MissingField("plural"));
        }
        if self.cluster_scoped && self.namespace.is_some() {
            return Err(RegistrationError::NamespaceOnClusterScoped(self.key()));
        }
        Ok(())
    }
}

/// A type-erased function that runs one controller's watch loop to
/// completion.
pub type ControllerRunner = Arc<
    dyn Fn(LeaderGate, CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync,
>;

/// Pairs a resource's metadata with its reconciliation pipeline.
///
/// The pipeline is fully typed at construction; the descriptor erases
/// the resource type so the registry and supervisor stay homogeneous.
#[derive(Clone)]
pub struct ControllerDescriptor {
    config: ResourceConfig,
    runner: ControllerRunner,
}

impl ControllerDescriptor {
    /// Builds a descriptor for `K` from its config, gateway and
    /// reconciler.
    ///
    /// Fails fast on invalid configuration, before any watch starts.
    pub fn new<K>(
        config: ResourceConfig,
        gateway: Arc<dyn ResourceGateway<K>>,
        reconciler: Arc<dyn Reconciler<K>>,
    ) -> Result<Self, RegistrationError>
    where
        K: WatchedResource,
    {
        config.validate()?;

        let watcher_config = config.clone();
        let runner: ControllerRunner = Arc::new(move |gate, cancel| {
            let watcher = ResourceWatcher::new(
                watcher_config.clone(),
                gateway.clone(),
                reconciler.clone(),
                gate,
            );
            Box::pin(async move { watcher.run(cancel).await })
        });

        Ok(Self { config, runner })
    }

    /// The resource metadata this controller was registered with.
    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// Starts the watch loop.
    pub(crate) fn start(
        &self,
        gate: LeaderGate,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.runner)(gate, cancel)
    }
}

impl fmt::Debug for ControllerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerDescriptor")
            .field("config", &self.config)
            .finish()
    }
}

/// Registry of all registered controllers, keyed by resource type.
#[derive(Debug, Clone, Default)]
pub struct ControllerRegistry {
    controllers: HashMap<String, ControllerDescriptor>,
}

impl ControllerRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a controller descriptor.
    ///
    /// # Panics
    ///
    /// Panics if a controller for the same resource type is already
    /// registered. Registration happens once at startup; a duplicate is
    /// a programming error, not a runtime condition.
    pub fn register(&mut self, descriptor: ControllerDescriptor) -> &mut Self {
        let key = descriptor.config().key();

        if self.controllers.contains_key(&key) {
            panic!("controller for {:?} is already registered", key);
        }

        self.controllers.insert(key, descriptor);
        self
    }

    /// Returns the descriptor for the given resource key.
    pub fn get(&self, key: &str) -> Option<&ControllerDescriptor> {
        self.controllers.get(key)
    }

    /// Returns all registered descriptors.
    pub fn descriptors(&self) -> impl Iterator<Item = &ControllerDescriptor> {
        self.controllers.values()
    }

    /// Returns the metadata of every registered resource type.
    ///
    /// Manifest generation (CRDs, RBAC rules, Deployments) reads this
    /// to learn what the operator watches and which finalizers it owns.
    pub fn resource_configs(&self) -> Vec<ResourceConfig> {
        self.controllers
            .values()
            .map(|d| d.config().clone())
            .collect()
    }

    /// Returns all registered resource keys.
    pub fn controller_keys(&self) -> Vec<String> {
        self.controllers.keys().cloned().collect()
    }

    /// Number of registered controllers.
    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}
