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

//! Health check support.
//!
//! Serves the liveness and readiness endpoints a Deployment probes:
//! `/healthz` and `/healthz/live` always answer `ok` while the process
//! runs, `/healthz/ready` aggregates the registered checkers, and
//! `/healthz/deep` reports each checker individually as JSON.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::http::StatusCode as HttpStatusCode;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Boxed future for health checks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Health check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The component is healthy.
    Healthy,
    /// The component is unhealthy.
    Unhealthy,
}

/// Aggregated health check result.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// The overall health status.
    pub status: HealthStatus,

    /// Individual component health.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub checks: HashMap<String, HealthStatus>,
}

/// Health checker trait.
///
/// Components implement this to contribute to readiness.
pub trait HealthChecker: Send + Sync + 'static {
    /// Performs a health check. Returns `true` if healthy.
    fn check(&self) -> BoxFuture<'_, bool>;

    /// Returns the name of this checker.
    fn name(&self) -> &str;
}

/// Adapter for implementing [`HealthChecker`] with a function.
pub struct FunctionHealthChecker<F, Fut>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    name: String,
    check_fn: F,
}

impl<F, Fut> FunctionHealthChecker<F, Fut>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    /// Creates a new function-based health checker.
    pub fn new(name: impl Into<String>, check_fn: F) -> Self {
        Self {
            name: name.into(),
            check_fn,
        }
    }
}

impl<F, Fut> HealthChecker for FunctionHealthChecker<F, Fut>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    fn check(&self) -> BoxFuture<'_, bool> {
        Box::pin((self.check_fn)())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Registry of health checkers.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    checkers: Arc<RwLock<Vec<Arc<dyn HealthChecker>>>>,
}

impl HealthRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a health checker.
    pub async fn register(&self, checker: Arc<dyn HealthChecker>) {
        self.checkers.write().await.push(checker);
    }

    /// Removes a health checker by name. Returns true if one was
    /// removed.
    pub async fn unregister(&self, name: &str) -> bool {
        let mut checkers = self.checkers.write().await;
        let original_len = checkers.len();
        checkers.retain(|c| c.name() != name);
        checkers.len() < original_len
    }

    /// Runs all health checks and aggregates the results.
    pub async fn check_all(&self) -> HealthCheck {
        let checkers = self.checkers.read().await;
        let mut checks = HashMap::new();
        let mut overall_healthy = true;

        for checker in checkers.iter() {
            let healthy = checker.check().await;
            overall_healthy &= healthy;
            checks.insert(
                checker.name().to_string(),
                if healthy {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Unhealthy
                },
            );
        }

        HealthCheck {
            status: if overall_healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            checks,
        }
    }

    /// Returns the number of registered checkers.
    pub async fn len(&self) -> usize {
        self.checkers.read().await.len()
    }

    /// Returns true if there are no registered checkers.
    pub async fn is_empty(&self) -> bool {
        self.checkers.read().await.is_empty()
    }
}

/// HTTP server exposing the health endpoints.
pub struct HealthServer {
    registry: HealthRegistry,
    bind_address: String,
    bind_port: u16,
}

impl HealthServer {
    /// Creates a new health server.
    pub fn new(bind_address: String, bind_port: u16) -> Self {
        Self {
            registry: HealthRegistry::new(),
            bind_address,
            bind_port,
        }
    }

    /// Returns the health registry.
    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    /// Serves health requests until the token is cancelled.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.bind_address, self.bind_port);
        let listener = TcpListener::bind(&addr).await?;

        tracing::info!("health server listening on {}", addr);

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("health server stopped");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            let (stream, _) = accepted?;
            let registry = self.registry.clone();
            let io = TokioIo::new(stream);

            tokio::task::spawn(async move {
                let http = hyper::server::conn::http1::Builder::new();
                let service = service_fn(move |req: Request<Incoming>| {
                    handle_request(req, registry.clone())
                });

                let _ = http.serve_connection(io, service).await;
            });
        }
    }

    /// Runs the health server in a background task.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}

/// Handles one health request.
async fn handle_request(
    req: Request<Incoming>,
    registry: HealthRegistry,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/healthz" | "/healthz/live" => plain(HttpStatusCode::OK, "ok"),
        "/healthz/ready" => {
            let result = registry.check_all().await;
            match result.status {
                HealthStatus::Healthy => plain(HttpStatusCode::OK, "ok"),
                HealthStatus::Unhealthy => {
                    plain(HttpStatusCode::SERVICE_UNAVAILABLE, "not ready")
                }
            }
        }
        "/healthz/deep" => {
            let result = registry.check_all().await;
            let status = match result.status {
                HealthStatus::Healthy => HttpStatusCode::OK,
                HealthStatus::Unhealthy => HttpStatusCode::SERVICE_UNAVAILABLE,
            };
            let json = serde_json::to_string(&result).unwrap_or_default();
            Response::builder()
                .status(status)
                .header("Content-Type", "application/json")
                .body(Full::new(Bytes::from(json)))
                .unwrap()
        }
        _ => plain(HttpStatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

fn plain(status: HttpStatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
