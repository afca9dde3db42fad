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

//! Resource metadata access for watched objects.
//!
//! The reconciliation core only needs a narrow slice of a resource's
//! metadata: identity, generation, and the finalizer list. This module
//! defines that slice as a trait so the core stays independent of any
//! concrete object representation.

use std::fmt;

/// Metadata access required by the reconciliation core.
///
/// Implemented for [`kube::api::DynamicObject`] in the kube gateway
/// module; custom typed resources can implement it directly.
pub trait WatchedResource: Clone + Send + Sync + fmt::Debug + 'static {
    /// The cluster-assigned stable identifier.
    ///
    /// Unlike `(namespace, name)`, a uid is never reused across
    /// deletions. All idempotency tracking keys by uid.
    fn uid(&self) -> Option<&str>;

    /// The server-incremented counter bumped only on spec changes.
    ///
    /// Some resource kinds never set it; those are reconciled on every
    /// delivery.
    fn generation(&self) -> Option<i64>;

    /// The resource name. Empty for objects that have not been named yet.
    fn name(&self) -> &str;

    /// The namespace, or `None` for cluster-scoped resources.
    fn namespace(&self) -> Option<&str>;

    /// The opaque version used by the server's optimistic-concurrency
    /// check on replace.
    fn resource_version(&self) -> Option<&str>;

    /// The finalizer strings currently present on the resource.
    fn finalizers(&self) -> &[String];

    /// Replaces the finalizer list on this (local) copy.
    fn set_finalizers(&mut self, finalizers: Vec<String>);
}

/// The `(namespace?, name, uid)` identity of a resource, used in every
/// log line so the reconciliation timeline can be reconstructed from
/// logs alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    /// Namespace, if the resource is namespaced.
    pub namespace: Option<String>,

    /// Resource name.
    pub name: String,

    /// Cluster-assigned uid, if the server has assigned one.
    pub uid: Option<String>,
}

impl ResourceId {
    /// Extracts the identity of a resource.
    pub fn of<K: WatchedResource>(resource: &K) -> Self {
        Self {
            namespace: resource.namespace().map(str::to_string),
            name: resource.name().to_string(),
            uid: resource.uid().map(str::to_string),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name)?,
            None => write!(f, "{}", self.name)?,
        }
        if let Some(uid) = &self.uid {
            write!(f, " ({})", uid)?;
        }
        Ok(())
    }
}
