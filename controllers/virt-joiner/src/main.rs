//! virt-joiner
//!
//! Enrolls KubeVirt VirtualMachines in FreeIPA:
//! - a mutating admission webhook registers the host and injects the
//!   cloud-init join script on VM creation
//! - a lifecycle poller confirms the join through the host keytab
//! - a finalizer keeps the VM until its host entry is removed on deletion
//!
//! Configuration comes from `CONFIG_PATH` (default `config.yaml`) overlaid
//! with environment variables.

mod backoff;
mod cluster;
mod config;
mod controller;
mod error;
mod events;
mod lifecycle;
mod metrics;
mod mutator;
mod os_profile;
mod template;
mod tracker;
mod watcher;
mod webhook;

#[cfg(test)]
mod test_utils;

use crate::config::Config;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // kube, reqwest and axum-server all link rustls; pick one provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = Config::load()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting virt-joiner");
    info!("Configuration:");
    info!("  Domain: {} (realm {})", config.domain, config.realm());
    info!("  FreeIPA fallback hosts: {}", config.ipa_host);
    info!("  Hostname template: {}", config.hostname_template);
    info!("  Finalizer: {}", config.finalizer_name);
    info!("  Listen address: {}", config.listen_addr);
    info!(
        "  Namespace: {}",
        config.watch_namespace.as_deref().unwrap_or("all namespaces")
    );

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
