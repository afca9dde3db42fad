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

//! kube-backed gateway implementations.
//!
//! Resources are accessed through the dynamic API: an [`ApiResource`]
//! built from the registered [`ResourceConfig`] selects the API path,
//! and objects travel as [`DynamicObject`]. The election lease is the
//! typed `coordination.k8s.io/v1` object.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, DynamicObject, ListParams, PostParams, WatchEvent, WatchParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;

use crate::gateway::{
    GatewayError, LeaseGateway, LeaseRecord, ResourceEvent, ResourceGateway, ResourceListing,
    WatchStream,
};
use crate::registration::ResourceConfig;
use crate::resource::WatchedResource;

impl WatchedResource for DynamicObject {
    fn uid(&self) -> Option<&str> {
        self.metadata.uid.as_deref()
    }

    fn generation(&self) -> Option<i64> {
        self.metadata.generation
    }

    fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    fn finalizers(&self) -> &[String] {
        self.metadata.finalizers.as_deref().unwrap_or(&[])
    }

    fn set_finalizers(&mut self, finalizers: Vec<String>) {
        self.metadata.finalizers = Some(finalizers);
    }
}

/// Maps a kube client error onto the gateway taxonomy.
fn map_kube_err(err: kube::Error) -> GatewayError {
    match err {
        kube::Error::Api(response) if response.code == 409 => GatewayError::Conflict,
        kube::Error::Api(response) if response.code == 404 => GatewayError::NotFound,
        other => GatewayError::transport(other),
    }
}

/// [`ResourceGateway`] over the kube dynamic API for one resource type.
pub struct KubeResourceGateway {
    api: Api<DynamicObject>,
    label_selector: Option<String>,
    watch_timeout: Duration,
}

impl KubeResourceGateway {
    /// Creates a gateway scoped according to the resource config.
    pub fn new(client: Client, config: &ResourceConfig, watch_timeout: Duration) -> Self {
        let gvk = GroupVersionKind::gvk(&config.group, &config.version, &config.kind);
        let resource = ApiResource::from_gvk_with_plural(&gvk, &config.plural);

        let api = match &config.namespace {
            Some(namespace) => Api::namespaced_with(client, namespace, &resource),
            None => Api::all_with(client, &resource),
        };

        Self {
            api,
            label_selector: config.label_selector.clone(),
            watch_timeout,
        }
    }
}

#[async_trait]
impl ResourceGateway<DynamicObject> for KubeResourceGateway {
    async fn list(&self) -> Result<ResourceListing<DynamicObject>, GatewayError> {
        let mut params = ListParams::default();
        if let Some(selector) = &self.label_selector {
            params = params.labels(selector);
        }

        let list = self.api.list(&params).await.map_err(map_kube_err)?;

        Ok(ResourceListing {
            resource_version: list.metadata.resource_version,
            items: list.items,
        })
    }

    async fn watch(
        &self,
        resource_version: Option<String>,
    ) -> Result<WatchStream<DynamicObject>, GatewayError> {
        let mut params = WatchParams::default().timeout(self.watch_timeout.as_secs() as u32);
        if let Some(selector) = &self.label_selector {
            params = params.labels(selector);
        }

        let version = resource_version.unwrap_or_else(|| "0".to_string());
        let stream = self
            .api
            .watch(&params, &version)
            .await
            .map_err(map_kube_err)?;

        Ok(stream
            .map(|result| match result {
                Ok(WatchEvent::Added(object)) => Ok(ResourceEvent::Added(object)),
                Ok(WatchEvent::Modified(object)) => Ok(ResourceEvent::Modified(object)),
                Ok(WatchEvent::Deleted(object)) => Ok(ResourceEvent::Deleted(object)),
                Ok(WatchEvent::Bookmark(bookmark)) => Ok(ResourceEvent::Bookmark {
                    resource_version: bookmark.metadata.resource_version,
                }),
                Ok(WatchEvent::Error(status)) => Ok(ResourceEvent::Error {
                    message: status.message,
                }),
                Err(e) => Err(map_kube_err(e)),
            })
            .boxed())
    }

    async fn replace(&self, resource: &DynamicObject) -> Result<DynamicObject, GatewayError> {
        self.api
            .replace(resource.name(), &PostParams::default(), resource)
            .await
            .map_err(map_kube_err)
    }
}

/// [`LeaseGateway`] over the typed coordination/v1 Lease API.
pub struct KubeLeaseGateway {
    api: Api<Lease>,
    name: String,
    namespace: String,
}

impl KubeLeaseGateway {
    /// Creates a gateway for one named lease.
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            api: Api::namespaced(client, &namespace),
            name: name.into(),
            namespace,
        }
    }
}

fn lease_to_record(lease: Lease) -> LeaseRecord {
    let spec = lease.spec.unwrap_or_default();
    LeaseRecord {
        holder_identity: spec.holder_identity,
        lease_duration: Duration::from_secs(spec.lease_duration_seconds.unwrap_or(0).max(0) as u64),
        acquire_time: spec.acquire_time.map(|t| t.0),
        renew_time: spec.renew_time.map(|t| t.0),
        lease_transitions: spec.lease_transitions.unwrap_or(0),
        resource_version: lease.metadata.resource_version,
    }
}

fn record_to_lease(name: &str, namespace: &str, record: &LeaseRecord) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version: record.resource_version.clone(),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: record.holder_identity.clone(),
            lease_duration_seconds: Some(record.lease_duration.as_secs() as i32),
            acquire_time: record.acquire_time.map(MicroTime),
            renew_time: record.renew_time.map(MicroTime),
            lease_transitions: Some(record.lease_transitions),
            ..Default::default()
        }),
    }
}

#[async_trait]
impl LeaseGateway for KubeLeaseGateway {
    async fn create(&self, lease: &LeaseRecord) -> Result<LeaseRecord, GatewayError> {
        let object = record_to_lease(&self.name, &self.namespace, lease);
        let created = self
            .api
            .create(&PostParams::default(), &object)
            .await
            .map_err(map_kube_err)?;
        Ok(lease_to_record(created))
    }

    async fn get(&self) -> Result<LeaseRecord, GatewayError> {
        let lease = self.api.get(&self.name).await.map_err(map_kube_err)?;
        Ok(lease_to_record(lease))
    }

    async fn replace(&self, lease: &LeaseRecord) -> Result<LeaseRecord, GatewayError> {
        let object = record_to_lease(&self.name, &self.namespace, lease);
        let replaced = self
            .api
            .replace(&self.name, &PostParams::default(), &object)
            .await
            .map_err(map_kube_err)?;
        Ok(lease_to_record(replaced))
    }
}
