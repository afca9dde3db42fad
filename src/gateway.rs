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

//! The API-server boundary.
//!
//! The reconciliation core talks to the cluster exclusively through the
//! traits in this module: [`ResourceGateway`] for list/watch/replace on
//! one resource type, and [`LeaseGateway`] for the coordination lease
//! used by leader election. Gateways reconnect on demand but never
//! retry internally; retry policy lives in the callers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use thiserror::Error;

/// Errors surfaced by gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The server rejected a write because the object's resource version
    /// is stale, or a create raced an existing object.
    #[error("resource version conflict")]
    Conflict,

    /// The object does not exist.
    #[error("object not found")]
    NotFound,

    /// Any transport-level failure: timeouts, disconnects, TLS errors.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl GatewayError {
    /// Wraps an arbitrary error as a transport failure.
    pub fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        GatewayError::Transport(Box::new(err))
    }
}

/// A typed delta delivered over the watch stream.
#[derive(Debug, Clone)]
pub enum ResourceEvent<K> {
    /// A resource became visible to the watch.
    Added(K),

    /// An existing resource changed.
    Modified(K),

    /// A resource was removed.
    Deleted(K),

    /// A resume-token checkpoint; carries no object.
    Bookmark {
        /// The resource version the stream can be resumed from.
        resource_version: String,
    },

    /// The server reported a stream-level error (e.g. the requested
    /// resource version is too old).
    Error {
        /// Human-readable error description from the server.
        message: String,
    },
}

/// A list result: the items plus the collection resource version a
/// subsequent watch can start from.
#[derive(Debug, Clone)]
pub struct ResourceListing<K> {
    /// All objects currently visible to this gateway's scope.
    pub items: Vec<K>,

    /// The collection resource version at list time.
    pub resource_version: Option<String>,
}

/// The stream of watch events for one resource type.
pub type WatchStream<K> = BoxStream<'static, Result<ResourceEvent<K>, GatewayError>>;

/// List, watch and replace operations for one resource type, scoped to
/// a namespace or the whole cluster at construction time.
#[async_trait]
pub trait ResourceGateway<K>: Send + Sync {
    /// Lists all objects in scope.
    async fn list(&self) -> Result<ResourceListing<K>, GatewayError>;

    /// Opens a watch stream starting at the given resource version, or
    /// from the beginning of the server's cache when `None`.
    ///
    /// The stream ends when the server closes the connection or the
    /// watch timeout elapses; the caller resubscribes by relisting.
    async fn watch(&self, resource_version: Option<String>) -> Result<WatchStream<K>, GatewayError>;

    /// Replaces an object, subject to the server-side
    /// optimistic-concurrency check on its resource version.
    async fn replace(&self, resource: &K) -> Result<K, GatewayError>;
}

/// A coordination lease, the only durable cross-replica state.
///
/// A holder is valid only while `now <= renew_time + lease_duration`;
/// an expired lease is acquirable by any contender regardless of the
/// recorded holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Identity of the current holder, if any.
    pub holder_identity: Option<String>,

    /// How long a renewal keeps the lease valid.
    pub lease_duration: Duration,

    /// When the current holder took the lease over.
    pub acquire_time: Option<DateTime<Utc>>,

    /// The holder's most recent renewal.
    pub renew_time: Option<DateTime<Utc>>,

    /// Incremented once per holder change.
    pub lease_transitions: i32,

    /// Optimistic-concurrency token for [`LeaseGateway::replace`].
    pub resource_version: Option<String>,
}

impl LeaseRecord {
    /// Creates a fresh record held by `identity` as of `now`.
    pub fn held_by(identity: impl Into<String>, lease_duration: Duration, now: DateTime<Utc>) -> Self {
        Self {
            holder_identity: Some(identity.into()),
            lease_duration,
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: 0,
            resource_version: None,
        }
    }

    /// Returns true if the lease is no longer protected by a renewal.
    ///
    /// A lease that was never renewed counts as expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.renew_time {
            Some(renewed) => {
                let valid_until = renewed
                    + chrono::Duration::from_std(self.lease_duration)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                now > valid_until
            }
            None => true,
        }
    }

    /// Returns true if the lease is held by the given identity.
    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder_identity.as_deref() == Some(identity)
    }
}

/// Create, read and replace operations for one named lease object.
#[async_trait]
pub trait LeaseGateway: Send + Sync {
    /// Creates the lease. Fails with [`GatewayError::Conflict`] if it
    /// already exists.
    async fn create(&self, lease: &LeaseRecord) -> Result<LeaseRecord, GatewayError>;

    /// Reads the lease. Fails with [`GatewayError::NotFound`] if it
    /// does not exist.
    async fn get(&self) -> Result<LeaseRecord, GatewayError>;

    /// Replaces the lease, subject to the resource version carried in
    /// the record.
    async fn replace(&self, lease: &LeaseRecord) -> Result<LeaseRecord, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_expiry() {
        let now = Utc::now();
        let lease = LeaseRecord::held_by("a", Duration::from_secs(15), now);

        assert!(!lease.is_expired(now));
        assert!(!lease.is_expired(now + chrono::Duration::seconds(15)));
        assert!(lease.is_expired(now + chrono::Duration::seconds(16)));
    }

    #[test]
    fn test_lease_without_renewal_is_expired() {
        let mut lease = LeaseRecord::held_by("a", Duration::from_secs(15), Utc::now());
        lease.renew_time = None;

        assert!(lease.is_expired(Utc::now()));
    }

    #[test]
    fn test_holder_identity() {
        let lease = LeaseRecord::held_by("a", Duration::from_secs(15), Utc::now());

        assert!(lease.is_held_by("a"));
        assert!(!lease.is_held_by("b"));
    }
}
