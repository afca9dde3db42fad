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

//! kube-operator - an observation operator built on kube-operator-rust
//!
//! Watches the resource types declared in the configuration file with a
//! logging reconciler. Useful as a scaffold for real operators and as a
//! way to observe reconciliation behavior against a live cluster.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kube::api::DynamicObject;

use kube_operator_rust::config::OperatorConfig;
use kube_operator_rust::gateway::ResourceGateway;
use kube_operator_rust::health::{FunctionHealthChecker, HealthServer};
use kube_operator_rust::kube_gateway::{KubeLeaseGateway, KubeResourceGateway};
use kube_operator_rust::leader_election::{self, LeaseLeaderElection};
use kube_operator_rust::operator::Operator;
use kube_operator_rust::reconciler::{FunctionReconciler, Reconciler};
use kube_operator_rust::registration::ControllerDescriptor;
use kube_operator_rust::resource::ResourceId;

/// Kubernetes operator
///
/// An operator is a control loop that watches custom resources through
/// the apiserver and makes changes attempting to move the current state
/// towards the state their specs declare.
#[derive(Parser, Debug)]
#[command(name = "kube-operator")]
#[command(version = kube_operator_rust::VERSION)]
#[command(about = "Kubernetes operator", long_about = None)]
struct Args {
    /// Path to the kubeconfig file
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from
    #[arg(long, global = true)]
    master: Option<String>,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    log_json: bool,

    /// Namespace the operator runs in
    #[arg(long)]
    namespace: Option<String>,

    /// Enable leader election
    #[arg(long)]
    leader_elect: bool,

    /// Disable leader election
    #[arg(long, conflicts_with = "leader_elect")]
    leader_elect_disable: bool,

    /// Port for the health check server
    #[arg(long)]
    healthz_bind_port: Option<u16>,

    /// Server-side watch timeout
    #[arg(long, value_parser = parse_duration)]
    watch_timeout: Option<Duration>,
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(s).map_err(|e| anyhow::anyhow!("invalid duration: {}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.log_json);

    info!("starting kube-operator");

    // Load configuration and apply command-line overrides
    let config = load_config(args).await?;
    config.validate().context("invalid configuration")?;

    info!(
        "configuration: resources={}, leader_election={}",
        config.resources.len(),
        config.leader_election.enabled
    );

    // Create Kubernetes client
    let client = create_client(&config).await?;

    // Build the operator, gated by leader election when enabled
    let mut operator = if config.leader_election.enabled {
        let identity = leader_election::create_identity()?;
        let lease_namespace = config
            .leader_election
            .lease_namespace
            .clone()
            .unwrap_or_else(|| config.generic.namespace.clone());
        let lease_gateway = Arc::new(KubeLeaseGateway::new(
            client.clone(),
            lease_namespace,
            config.leader_election.lease_name.clone(),
        ));
        let elector = Arc::new(LeaseLeaderElection::new(
            config.leader_election.clone(),
            identity,
            lease_gateway,
        )?);
        Operator::with_leader_election(config.clone(), elector)
    } else {
        Operator::new(config.clone())
    };

    // Register one observing controller per configured resource type
    let watch_timeout = config.generic.watch_timeout;
    for resource_config in &config.resources {
        let gateway: Arc<dyn ResourceGateway<DynamicObject>> = Arc::new(
            KubeResourceGateway::new(client.clone(), resource_config, watch_timeout),
        );
        let reconciler: Arc<dyn Reconciler<DynamicObject>> = Arc::new(observing_reconciler());
        let descriptor = ControllerDescriptor::new(resource_config.clone(), gateway, reconciler)
            .with_context(|| format!("registering {}", resource_config.key()))?;

        info!(resource = %resource_config.key(), "registered controller");
        operator.register(descriptor);
    }

    // Health server: live while the process runs, ready until shutdown
    let shutdown_token = operator.shutdown_token();
    let health = HealthServer::new(
        config.generic.healthz_bind_address.clone(),
        config.generic.healthz_bind_port,
    );
    {
        let shutdown = shutdown_token.clone();
        health
            .registry()
            .register(Arc::new(FunctionHealthChecker::new("operator", move || {
                let shutdown = shutdown.clone();
                async move { !shutdown.is_cancelled() }
            })))
            .await;
    }
    let _health_task = health.spawn(shutdown_token.clone());

    // Set up signal handling
    tokio::spawn(async move {
        wait_for_shutdown().await;
        shutdown_token.cancel();
    });

    // Run the operator
    if let Err(e) = operator.run().await {
        error!("operator failed: {:#}", e);
        return Err(e);
    }

    info!("kube-operator exited successfully");
    Ok(())
}

/// A reconciler that logs every transition it observes.
///
/// Stands in for real business logic so the shipped binary exercises
/// the full pipeline, finalizers included.
fn observing_reconciler() -> FunctionReconciler<DynamicObject> {
    FunctionReconciler::new(|resource: DynamicObject, _cancel| async move {
        info!(resource = %ResourceId::of(&resource), "observed spec change");
        Ok(())
    })
    .with_finalize(|resource: DynamicObject, _cancel| async move {
        info!(resource = %ResourceId::of(&resource), "observed deletion, nothing to clean up");
        Ok(())
    })
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.parse().unwrap())
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    }
}

/// Loads the configuration from file or defaults, then applies
/// command-line overrides.
async fn load_config(mut args: Args) -> anyhow::Result<OperatorConfig> {
    let mut config = if let Some(config_path) = args.config.take() {
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("failed to read config file: {:?}", config_path))?;

        serde_yaml::from_str::<OperatorConfig>(&content)
            .with_context(|| format!("failed to parse config file: {:?}", config_path))?
    } else {
        OperatorConfig::default()
    };

    if let Some(kubeconfig) = args.kubeconfig {
        config.generic.kubeconfig = Some(kubeconfig);
    }
    if let Some(master) = args.master {
        config.generic.master = Some(master);
    }
    if let Some(namespace) = args.namespace {
        config.generic.namespace = namespace;
    }
    if let Some(port) = args.healthz_bind_port {
        config.generic.healthz_bind_port = port;
    }
    if let Some(timeout) = args.watch_timeout {
        config.generic.watch_timeout = timeout;
    }

    if args.leader_elect {
        config.leader_election.enabled = true;
    } else if args.leader_elect_disable {
        config.leader_election.enabled = false;
    }

    Ok(config)
}

/// Creates a Kubernetes client from the configuration.
async fn create_client(config: &OperatorConfig) -> anyhow::Result<kube::Client> {
    use kube::config::{KubeConfigOptions, Kubeconfig};
    use kube::Config;

    let kube_config = if let Some(kubeconfig_path) = &config.generic.kubeconfig {
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
            .with_context(|| format!("failed to read kubeconfig from: {:?}", kubeconfig_path))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("failed to load kubeconfig from: {:?}", kubeconfig_path))?
    } else if let Some(master_url) = &config.generic.master {
        let uri = master_url
            .parse::<http::Uri>()
            .with_context(|| format!("invalid master URL: {}", master_url))?;
        Config::new(uri)
    } else {
        Config::infer().await.context("failed to load kubeconfig")?
    };

    Ok(kube::Client::try_from(kube_config)?)
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(windows)]
    {
        let mut ctrl_c = signal::windows::ctrl_c().expect("failed to install Ctrl+C handler");

        if ctrl_c.recv().await.is_some() {
            info!("received Ctrl+C, shutting down");
        }
    }
}
