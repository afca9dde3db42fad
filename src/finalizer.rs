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

//! Finalizer lifecycle management.
//!
//! A finalizer is a string marker on resource metadata that blocks the
//! API server from completing physical deletion until its owner removes
//! it. The guard ensures our finalizer is present before business logic
//! ever observes a delete, and removes it after cleanup completes.

use std::sync::Arc;

use crate::gateway::{GatewayError, ResourceGateway};
use crate::resource::WatchedResource;

/// Adds and removes this controller's finalizer on watched resources,
/// persisting each change through the gateway's replace.
pub struct FinalizerGuard<K> {
    gateway: Arc<dyn ResourceGateway<K>>,
    finalizer: String,
}

impl<K: WatchedResource> FinalizerGuard<K> {
    /// Creates a guard for the given finalizer string.
    pub fn new(gateway: Arc<dyn ResourceGateway<K>>, finalizer: impl Into<String>) -> Self {
        Self {
            gateway,
            finalizer: finalizer.into(),
        }
    }

    /// The finalizer string this guard owns.
    pub fn finalizer(&self) -> &str {
        &self.finalizer
    }

    /// Returns true if the resource carries our finalizer.
    pub fn has_own_finalizer(&self, resource: &K) -> bool {
        resource.finalizers().iter().any(|f| f == &self.finalizer)
    }

    /// Appends our finalizer and writes the resource back.
    ///
    /// Idempotent: a resource that already carries the finalizer is
    /// returned unchanged without a write. The replace is subject to
    /// the server's optimistic-concurrency check; a conflict means a
    /// fresher copy of the object is already on its way to us.
    pub async fn add(&self, resource: &K) -> Result<K, GatewayError> {
        if self.has_own_finalizer(resource) {
            return Ok(resource.clone());
        }

        let mut updated = resource.clone();
        let mut finalizers = updated.finalizers().to_vec();
        finalizers.push(self.finalizer.clone());
        updated.set_finalizers(finalizers);

        self.gateway.replace(&updated).await
    }

    /// Removes our finalizer and writes the resource back, allowing the
    /// API server to complete deletion.
    ///
    /// Idempotent: a resource without the finalizer is returned
    /// unchanged without a write.
    pub async fn remove(&self, resource: &K) -> Result<K, GatewayError> {
        if !self.has_own_finalizer(resource) {
            return Ok(resource.clone());
        }

        let mut updated = resource.clone();
        let finalizers = updated
            .finalizers()
            .iter()
            .filter(|f| *f != &self.finalizer)
            .cloned()
            .collect();
        updated.set_finalizers(finalizers);

        self.gateway.replace(&updated).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::gateway::{ResourceListing, WatchStream};

    #[derive(Clone, Debug, PartialEq)]
    struct Stub {
        finalizers: Vec<String>,
    }

    impl WatchedResource for Stub {
        fn uid(&self) -> Option<&str> {
            Some("u-1")
        }

        fn generation(&self) -> Option<i64> {
            Some(1)
        }

        fn name(&self) -> &str {
            "stub"
        }

        fn namespace(&self) -> Option<&str> {
            None
        }

        fn resource_version(&self) -> Option<&str> {
            None
        }

        fn finalizers(&self) -> &[String] {
            &self.finalizers
        }

        fn set_finalizers(&mut self, finalizers: Vec<String>) {
            self.finalizers = finalizers;
        }
    }

    /// Records every replace; the watch stream is never opened.
    #[derive(Default)]
    struct RecordingGateway {
        replaced: Mutex<Vec<Stub>>,
    }

    #[async_trait]
    impl ResourceGateway<Stub> for RecordingGateway {
        async fn list(&self) -> Result<ResourceListing<Stub>, GatewayError> {
            Ok(ResourceListing {
                items: vec![],
                resource_version: None,
            })
        }

        async fn watch(
            &self,
            _resource_version: Option<String>,
        ) -> Result<WatchStream<Stub>, GatewayError> {
            unimplemented!("not used by finalizer tests")
        }

        async fn replace(&self, resource: &Stub) -> Result<Stub, GatewayError> {
            self.replaced.lock().unwrap().push(resource.clone());
            Ok(resource.clone())
        }
    }

    fn guard(gateway: Arc<RecordingGateway>) -> FinalizerGuard<Stub> {
        FinalizerGuard::new(
            gateway as Arc<dyn ResourceGateway<Stub>>,
            "demos.example.com/finalizer",
        )
    }

    #[tokio::test]
    async fn test_add_writes_back() {
        let gateway = Arc::new(RecordingGateway::default());
        let guard = guard(gateway.clone());
        let resource = Stub {
            finalizers: vec!["other/finalizer".to_string()],
        };

        let updated = guard.add(&resource).await.unwrap();

        assert!(guard.has_own_finalizer(&updated));
        assert_eq!(updated.finalizers.len(), 2);
        assert_eq!(gateway.replaced.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let gateway = Arc::new(RecordingGateway::default());
        let guard = guard(gateway.clone());
        let resource = Stub {
            finalizers: vec!["demos.example.com/finalizer".to_string()],
        };

        let updated = guard.add(&resource).await.unwrap();

        assert_eq!(updated, resource);
        assert!(gateway.replaced.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_writes_back() {
        let gateway = Arc::new(RecordingGateway::default());
        let guard = guard(gateway.clone());
        let resource = Stub {
            finalizers: vec![
                "demos.example.com/finalizer".to_string(),
                "other/finalizer".to_string(),
            ],
        };

        let updated = guard.remove(&resource).await.unwrap();

        assert!(!guard.has_own_finalizer(&updated));
        assert_eq!(updated.finalizers, vec!["other/finalizer".to_string()]);
        assert_eq!(gateway.replaced.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let gateway = Arc::new(RecordingGateway::default());
        let guard = guard(gateway.clone());
        let resource = Stub { finalizers: vec![] };

        let updated = guard.remove(&resource).await.unwrap();

        assert_eq!(updated, resource);
        assert!(gateway.replaced.lock().unwrap().is_empty());
    }
}
