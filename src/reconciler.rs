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

//! The user-logic boundary.
//!
//! Operator authors supply a [`Reconciler`] per registered resource
//! type. The watch loop guarantees that `add_or_modify` only ever sees
//! resources already carrying the controller's finalizer, and that a
//! generation is reconciled at most once unless the callback fails.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

// Re-export cancellation token for use in reconciler signatures
pub use tokio_util::sync::CancellationToken;

use crate::resource::WatchedResource;

/// Boxed future for closure-based reconcilers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// User-supplied reconciliation callbacks for one resource type.
///
/// All callbacks are fallible and asynchronous. A returned error is
/// logged by the watch loop and the event is retried on its next
/// delivery (or on a relist); it never terminates the loop. Callbacks
/// should observe the cancellation token cooperatively during long
/// operations.
#[async_trait]
pub trait Reconciler<K: WatchedResource>: Send + Sync + 'static {
    /// Drives the cluster toward the state declared by a live resource.
    ///
    /// Invoked once per spec generation: redeliveries of an
    /// already-handled generation are skipped before this is called.
    async fn add_or_modify(&self, resource: &K, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// Called after [`Reconciler::finalize`] when a resource carrying
    /// the controller's finalizer is deleted.
    async fn delete(&self, resource: &K, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// Cleans up external state owned on behalf of a deleted resource.
    ///
    /// Runs before [`Reconciler::delete`]; the controller's finalizer
    /// is only removed (unblocking physical deletion) after both have
    /// succeeded.
    async fn finalize(&self, resource: &K, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// Resume-token housekeeping. Must not mutate reconciled state.
    ///
    /// The default does nothing.
    async fn bookmark(&self, _resource_version: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when the server reports a stream-level error, before the
    /// loop resubscribes via a full relist.
    ///
    /// The default does nothing.
    async fn error(&self, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Shared closure type used by [`FunctionReconciler`].
pub type ReconcileFn<K> =
    Arc<dyn Fn(K, CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A [`Reconciler`] assembled from closures.
///
/// Useful for simple operators that don't need to maintain state
/// between calls. Only `add_or_modify` is required; the delete and
/// finalize callbacks default to no-ops.
///
/// # Example
///
/// ```ignore
/// let reconciler = FunctionReconciler::new(|resource, _cancel| async move {
///     tracing::info!(?resource, "observed");
///     Ok(())
/// })
/// .with_finalize(|resource, _cancel| async move {
///     cleanup(resource).await
/// });
/// ```
pub struct FunctionReconciler<K> {
    apply_fn: ReconcileFn<K>,
    delete_fn: Option<ReconcileFn<K>>,
    finalize_fn: Option<ReconcileFn<K>>,
}

impl<K: WatchedResource> FunctionReconciler<K> {
    /// Creates a reconciler from an `add_or_modify` closure.
    pub fn new<F, Fut>(apply_fn: F) -> Self
    where
        F: Fn(K, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            apply_fn: box_fn(apply_fn),
            delete_fn: None,
            finalize_fn: None,
        }
    }

    /// Sets the `delete` closure.
    pub fn with_delete<F, Fut>(mut self, delete_fn: F) -> Self
    where
        F: Fn(K, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.delete_fn = Some(box_fn(delete_fn));
        self
    }

    /// Sets the `finalize` closure.
    pub fn with_finalize<F, Fut>(mut self, finalize_fn: F) -> Self
    where
        F: Fn(K, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.finalize_fn = Some(box_fn(finalize_fn));
        self
    }
}

fn box_fn<K, F, Fut>(f: F) -> ReconcileFn<K>
where
    F: Fn(K, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |resource, cancel| Box::pin(f(resource, cancel)))
}

#[async_trait]
impl<K: WatchedResource> Reconciler<K> for FunctionReconciler<K> {
    async fn add_or_modify(&self, resource: &K, cancel: &CancellationToken) -> anyhow::Result<()> {
        (self.apply_fn)(resource.clone(), cancel.clone()).await
    }

    async fn delete(&self, resource: &K, cancel: &CancellationToken) -> anyhow::Result<()> {
        match &self.delete_fn {
            Some(f) => f(resource.clone(), cancel.clone()).await,
            None => Ok(()),
        }
    }

    async fn finalize(&self, resource: &K, cancel: &CancellationToken) -> anyhow::Result<()> {
        match &self.finalize_fn {
            Some(f) => f(resource.clone(), cancel.clone()).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Debug)]
    struct Stub;

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
            &[]
        }

        fn set_finalizers(&mut self, _finalizers: Vec<String>) {}
    }

    #[tokio::test]
    async fn test_function_reconciler_apply() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let reconciler = FunctionReconciler::new(move |_: Stub, _| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let cancel = CancellationToken::new();
        reconciler.add_or_modify(&Stub, &cancel).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_callbacks_are_noops() {
        let reconciler = FunctionReconciler::new(|_: Stub, _| async { Ok(()) });
        let cancel = CancellationToken::new();

        reconciler.delete(&Stub, &cancel).await.unwrap();
        reconciler.finalize(&Stub, &cancel).await.unwrap();
        reconciler.bookmark("42").await.unwrap();
        reconciler.error("gone").await.unwrap();
    }
}
