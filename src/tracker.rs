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

//! Generation-based idempotency tracking.
//!
//! The watch stream delivers at-least-once: duplicates, resyncs and
//! relists all replay events the process has already handled. The
//! tracker remembers the last handled generation per uid so redundant
//! deliveries are skipped without calling user logic.
//!
//! All state is process-local and rebuilt from scratch by relist after
//! a restart; it caches server-observed truth and is never the source
//! of truth itself.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::resource::WatchedResource;

/// Per-resource-type map from uid to the last handled generation.
///
/// Safe for concurrent get/set per uid; each resource type's loop owns
/// its own instance, so there is no cross-loop sharing.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    handled: RwLock<HashMap<String, i64>>,
}

impl ChangeTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the resource's current generation has already
    /// been handled.
    ///
    /// A resource without a uid or without a generation is always
    /// unhandled: kinds that never set `generation` are reconciled on
    /// every delivery on purpose.
    pub fn is_already_handled<K: WatchedResource>(&self, resource: &K) -> bool {
        let (Some(uid), Some(generation)) = (resource.uid(), resource.generation()) else {
            return false;
        };

        self.handled
            .read()
            .unwrap()
            .get(uid)
            .is_some_and(|last| *last >= generation)
    }

    /// Records the resource's current generation as handled.
    ///
    /// Resources without a uid or generation are not tracked.
    pub fn track_handled<K: WatchedResource>(&self, resource: &K) {
        let (Some(uid), Some(generation)) = (resource.uid(), resource.generation()) else {
            return;
        };

        self.handled
            .write()
            .unwrap()
            .insert(uid.to_string(), generation);
    }

    /// Drops the entry for a deleted resource.
    ///
    /// Called exactly once, after a Delete event completes processing.
    /// The uid is never reused, but dropping the entry keeps the map
    /// bounded by the number of live resources.
    pub fn track_deleted<K: WatchedResource>(&self, resource: &K) {
        if let Some(uid) = resource.uid() {
            self.handled.write().unwrap().remove(uid);
        }
    }

    /// Number of tracked resources.
    pub fn len(&self) -> usize {
        self.handled.read().unwrap().len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.handled.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug)]
    struct Stub {
        uid: Option<String>,
        generation: Option<i64>,
    }

    impl Stub {
        fn new(uid: &str, generation: i64) -> Self {
            Self {
                uid: Some(uid.to_string()),
                generation: Some(generation),
            }
        }
    }

    impl WatchedResource for Stub {
        fn uid(&self) -> Option<&str> {
            self.uid.as_deref()
        }

        fn generation(&self) -> Option<i64> {
            self.generation
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
            &[]
        }

        fn set_finalizers(&mut self, _finalizers: Vec<String>) {}
    }

    #[test]
    fn test_untracked_is_unhandled() {
        let tracker = ChangeTracker::new();
        assert!(!tracker.is_already_handled(&Stub::new("u-1", 1)));
    }

    #[test]
    fn test_monotonicity() {
        let tracker = ChangeTracker::new();
        tracker.track_handled(&Stub::new("u-1", 3));

        assert!(tracker.is_already_handled(&Stub::new("u-1", 1)));
        assert!(tracker.is_already_handled(&Stub::new("u-1", 3)));
        assert!(!tracker.is_already_handled(&Stub::new("u-1", 4)));
    }

    #[test]
    fn test_eviction() {
        let tracker = ChangeTracker::new();
        let resource = Stub::new("u-1", 42);

        tracker.track_handled(&resource);
        assert!(tracker.is_already_handled(&resource));

        tracker.track_deleted(&resource);
        assert!(!tracker.is_already_handled(&resource));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_missing_generation_always_unhandled() {
        let tracker = ChangeTracker::new();
        let resource = Stub {
            uid: Some("u-1".to_string()),
            generation: None,
        };

        tracker.track_handled(&resource);
        assert!(!tracker.is_already_handled(&resource));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_missing_uid_never_tracked() {
        let tracker = ChangeTracker::new();
        let resource = Stub {
            uid: None,
            generation: Some(1),
        };

        tracker.track_handled(&resource);
        assert!(!tracker.is_already_handled(&resource));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_uids_are_independent() {
        let tracker = ChangeTracker::new();
        tracker.track_handled(&Stub::new("u-1", 5));

        assert!(!tracker.is_already_handled(&Stub::new("u-2", 1)));
        assert_eq!(tracker.len(), 1);
    }
}
