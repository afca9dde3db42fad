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

//! kube-operator-rust - A framework for building Kubernetes operators
//!
//! This library provides the core components of an operator:
//! - A per-resource-type watch/reconcile loop with finalizer handling
//! - Generation-based idempotency tracking
//! - Lease-based leader election
//! - Explicit, queryable controller registration
//! - Configuration management
//! - Health checks

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

pub mod config;
pub mod finalizer;
pub mod gateway;
pub mod health;
pub mod kube_gateway;
pub mod leader_election;
pub mod operator;
pub mod reconciler;
pub mod registration;
pub mod resource;
pub mod tracker;
pub mod watcher;

// Re-export commonly used types
pub use config::{LeaderElectionConfig, OperatorConfig};
pub use finalizer::FinalizerGuard;
pub use gateway::{GatewayError, LeaseGateway, ResourceEvent, ResourceGateway};
pub use leader_election::{LeaderElection, LeaderGate, LeaseLeaderElection};
pub use operator::Operator;
pub use reconciler::{FunctionReconciler, Reconciler};
pub use registration::{ControllerDescriptor, ControllerRegistry, ResourceConfig};
pub use resource::{ResourceId, WatchedResource};
pub use tracker::ChangeTracker;
pub use watcher::ResourceWatcher;

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default name for the operator.
pub const OPERATOR_NAME: &str = "kube-operator";
