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

//! The per-resource-type reconcile loop.
//!
//! A [`ResourceWatcher`] owns one long-lived watch subscription,
//! classifies the incoming events, consults the change tracker and
//! finalizer guard, and dispatches to the user's [`Reconciler`].
//!
//! The watch stream delivers at-least-once and in per-object order.
//! The loop preserves that order: events for one resource type are
//! processed strictly sequentially, so two events for the same uid are
//! never in flight at once. Idempotency across duplicate deliveries
//! comes from the generation tracker, not from the stream.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::gateway::{GatewayError, ResourceEvent, ResourceGateway};
use crate::leader_election::LeaderGate;
use crate::reconciler::Reconciler;
use crate::registration::ResourceConfig;
use crate::resource::{ResourceId, WatchedResource};
use crate::tracker::ChangeTracker;
use crate::finalizer::FinalizerGuard;

/// What the dispatcher wants the stream loop to do next.
enum Flow {
    Continue,
    Resubscribe,
}

/// The reconcile loop for one registered resource type.
pub struct ResourceWatcher<K> {
    config: ResourceConfig,
    gateway: Arc<dyn ResourceGateway<K>>,
    reconciler: Arc<dyn Reconciler<K>>,
    tracker: ChangeTracker,
    finalizers: FinalizerGuard<K>,
    gate: LeaderGate,
}

impl<K: WatchedResource> ResourceWatcher<K> {
    /// Creates a watcher for the given resource type.
    pub fn new(
        config: ResourceConfig,
        gateway: Arc<dyn ResourceGateway<K>>,
        reconciler: Arc<dyn Reconciler<K>>,
        gate: LeaderGate,
    ) -> Self {
        let finalizers = FinalizerGuard::new(gateway.clone(), config.finalizer_name());
        Self {
            config,
            gateway,
            reconciler,
            tracker: ChangeTracker::new(),
            finalizers,
            gate,
        }
    }

    /// Runs the loop until the cancellation token fires.
    ///
    /// Each cycle relists (replaying the items as upserts, which doubles
    /// as the resync that retries previously failed generations), then
    /// watches from the listing's resource version until the stream ends
    /// or fails, then pauses for the configured resubscribe delay. A
    /// closed or broken stream is not an error; only cancellation ends
    /// the loop.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        info!(
            kind = %self.config.kind,
            api_version = %self.config.api_version(),
            "starting watch loop"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let listing = match self.gateway.list().await {
                Ok(listing) => listing,
                Err(e) => {
                    warn!(kind = %self.config.kind, error = %e, "list failed, retrying");
                    if !self.pause(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            debug!(
                kind = %self.config.kind,
                count = listing.items.len(),
                "relisted"
            );

            for resource in &listing.items {
                if cancel.is_cancelled() {
                    break;
                }
                self.handle_upsert(resource, &cancel, "resync").await;
            }

            let mut stream = match self.gateway.watch(listing.resource_version.clone()).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(kind = %self.config.kind, error = %e, "watch subscription failed, retrying");
                    if !self.pause(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(kind = %self.config.kind, "watch loop cancelled");
                        return Ok(());
                    }
                    event = stream.next() => event,
                };

                match event {
                    None => {
                        debug!(kind = %self.config.kind, "watch stream closed, resubscribing");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(kind = %self.config.kind, error = %e, "watch stream failed, resubscribing");
                        break;
                    }
                    Some(Ok(event)) => {
                        if let Flow::Resubscribe = self.dispatch(event, &cancel).await {
                            break;
                        }
                    }
                }
            }

            if !self.pause(&cancel).await {
                break;
            }
        }

        info!(kind = %self.config.kind, "watch loop stopped");
        Ok(())
    }

    /// Sleeps for the resubscribe delay; returns false when cancelled.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.resubscribe_delay) => true,
        }
    }

    /// Routes one watch event. Callback errors are contained here; only
    /// a server-reported stream error asks for a resubscribe.
    async fn dispatch(&self, event: ResourceEvent<K>, cancel: &CancellationToken) -> Flow {
        match event {
            ResourceEvent::Added(resource) => {
                self.handle_upsert(&resource, cancel, "added").await;
                Flow::Continue
            }
            ResourceEvent::Modified(resource) => {
                self.handle_upsert(&resource, cancel, "modified").await;
                Flow::Continue
            }
            ResourceEvent::Deleted(resource) => {
                self.handle_delete(&resource, cancel).await;
                Flow::Continue
            }
            ResourceEvent::Bookmark { resource_version } => {
                trace!(
                    kind = %self.config.kind,
                    resource_version = %resource_version,
                    "bookmark"
                );
                if let Err(e) = self.reconciler.bookmark(&resource_version).await {
                    warn!(kind = %self.config.kind, error = format!("{e:#}"), "bookmark callback failed");
                }
                Flow::Continue
            }
            ResourceEvent::Error { message } => {
                warn!(
                    kind = %self.config.kind,
                    message = %message,
                    "server reported watch error, resubscribing"
                );
                if let Err(e) = self.reconciler.error(&message).await {
                    warn!(kind = %self.config.kind, error = format!("{e:#}"), "error callback failed");
                }
                Flow::Resubscribe
            }
        }
    }

    /// Handles an Added/Modified delivery (or a relist replay).
    ///
    /// A live resource must carry our finalizer before user logic runs:
    /// the first delivery only writes the finalizer back, and the write
    /// itself re-triggers a Modified event with the finalizer present.
    /// From then on the tracker admits each generation once; tracking
    /// happens only after the reconciler succeeded, so a failed
    /// generation stays untracked and is retried on its next delivery.
    async fn handle_upsert(&self, resource: &K, cancel: &CancellationToken, trigger: &'static str) {
        let id = ResourceId::of(resource);

        if !self.gate.is_leader() {
            trace!(kind = %self.config.kind, resource = %id, trigger, "skipping upsert while not leader");
            return;
        }

        if !self.finalizers.has_own_finalizer(resource) {
            debug!(kind = %self.config.kind, resource = %id, "attaching finalizer");
            match self.finalizers.add(resource).await {
                Ok(_) => {
                    debug!(kind = %self.config.kind, resource = %id, "finalizer attached, awaiting redelivery");
                }
                Err(GatewayError::Conflict) => {
                    debug!(kind = %self.config.kind, resource = %id, "finalizer attach conflicted with a newer version");
                }
                Err(e) => {
                    warn!(kind = %self.config.kind, resource = %id, error = %e, "failed to attach finalizer");
                }
            }
            return;
        }

        if self.tracker.is_already_handled(resource) {
            debug!(
                kind = %self.config.kind,
                resource = %id,
                generation = ?resource.generation(),
                trigger,
                "skipping already handled generation"
            );
            return;
        }

        info!(
            kind = %self.config.kind,
            resource = %id,
            generation = ?resource.generation(),
            trigger,
            "reconciling"
        );

        match self.reconciler.add_or_modify(resource, cancel).await {
            Ok(()) => {
                self.tracker.track_handled(resource);
                info!(kind = %self.config.kind, resource = %id, "reconciled");
            }
            Err(e) => {
                error!(
                    kind = %self.config.kind,
                    resource = %id,
                    error = format!("{e:#}"),
                    "reconciler failed, generation left untracked for retry"
                );
            }
        }
    }

    /// Handles a Deleted delivery.
    ///
    /// Cleanup runs only for resources carrying our finalizer. Both the
    /// finalize and delete callbacks must succeed before the tracker
    /// entry is dropped and the finalizer is released; a failure leaves
    /// everything in place for the redelivery to retry.
    async fn handle_delete(&self, resource: &K, cancel: &CancellationToken) {
        let id = ResourceId::of(resource);

        if !self.gate.is_leader() {
            trace!(kind = %self.config.kind, resource = %id, "skipping delete while not leader");
            return;
        }

        if !self.finalizers.has_own_finalizer(resource) {
            debug!(
                kind = %self.config.kind,
                resource = %id,
                "deleted resource carried no finalizer of ours, nothing to clean up"
            );
            return;
        }

        info!(kind = %self.config.kind, resource = %id, "finalizing deleted resource");

        if let Err(e) = self.reconciler.finalize(resource, cancel).await {
            error!(
                kind = %self.config.kind,
                resource = %id,
                error = format!("{e:#}"),
                "finalize failed, keeping finalizer for retry"
            );
            return;
        }

        if let Err(e) = self.reconciler.delete(resource, cancel).await {
            error!(
                kind = %self.config.kind,
                resource = %id,
                error = format!("{e:#}"),
                "delete callback failed, keeping finalizer for retry"
            );
            return;
        }

        self.tracker.track_deleted(resource);

        match self.finalizers.remove(resource).await {
            Ok(_) => {
                info!(kind = %self.config.kind, resource = %id, "released finalizer");
            }
            Err(GatewayError::NotFound) => {
                debug!(kind = %self.config.kind, resource = %id, "resource already gone");
            }
            Err(GatewayError::Conflict) => {
                debug!(kind = %self.config.kind, resource = %id, "finalizer release conflicted, awaiting redelivery");
            }
            Err(e) => {
                warn!(kind = %self.config.kind, resource = %id, error = %e, "failed to release finalizer");
            }
        }
    }
}
