//! Main controller implementation.
//!
//! Wires the FreeIPA client, cluster access, tracker and metrics together and
//! runs the three long-lived tasks:
//! - the admission webhook server
//! - the lifecycle poller (verification and cleanup)
//! - the VirtualMachine watcher (deletion detection)
//!
//! Startup reconciliation runs before any of them, retried until the cluster
//! answers, so records for VMs created by a previous process exist before the
//! first admission or poll.

use crate::cluster::KubeClusterOps;
use crate::config::Config;
use crate::error::ControllerError;
use crate::lifecycle::LifecycleController;
use crate::metrics::Metrics;
use crate::mutator::EnrollmentMutator;
use crate::tracker::EnrollmentTracker;
use crate::watcher::Watcher;
use crate::webhook::{self, TlsFiles, WebhookState};
use ipa_client::{DirectoryServerResolver, HickorySrvLookup, IpaClient, IpaClientSettings, IpaClientTrait};
use kube::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Main controller for FreeIPA enrollment of KubeVirt VMs.
pub struct Controller {
    webhook_server: JoinHandle<Result<(), ControllerError>>,
    lifecycle_poller: JoinHandle<Result<(), ControllerError>>,
    vm_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts its tasks.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing virt-joiner");
        let config = Arc::new(config);

        let listen_addr: SocketAddr = config
            .listen_addr
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("listen_addr {:?}: {}", config.listen_addr, e)))?;

        // Create Kubernetes client
        let kube_client = Client::try_default().await?;

        // Create FreeIPA client
        let lookup = HickorySrvLookup::from_system_conf(config.ipa_timeout())?;
        let resolver = DirectoryServerResolver::new(Arc::new(lookup), config.ipa_srv_service.clone(), config.ipa_rpc_port);
        let ipa_client = IpaClient::new(
            resolver,
            IpaClientSettings {
                domain: config.domain.clone(),
                static_hosts: config.ipa_host.clone(),
                username: config.ipa_user.clone(),
                password: config.ipa_pass.clone(),
                verify_ssl: config.ipa_verify_ssl,
                timeout: config.ipa_timeout(),
            },
        )?;

        // A directory outage must not keep the webhook down; admissions fail
        // closed until it recovers.
        info!("Validating FreeIPA credentials and connectivity...");
        match ipa_client.validate_connectivity().await {
            Ok(()) => info!("FreeIPA connectivity established"),
            Err(e) => {
                error!("Failed to reach FreeIPA: {}", e);
                error!("Please ensure:");
                error!("  1. IPA_USER and IPA_PASS are correct");
                error!("  2. SRV records exist for {} or IPA_HOST lists reachable servers", config.domain);
                warn!("Continuing; enrollments are denied until FreeIPA is reachable");
            }
        }
        let ipa: Arc<dyn IpaClientTrait> = Arc::new(ipa_client);

        let cluster = Arc::new(KubeClusterOps::new(kube_client, config.watch_namespace.clone()));
        let vm_api = cluster.vm_api();
        let tracker = Arc::new(EnrollmentTracker::new());
        let metrics = Metrics::new()?;

        let mutator = Arc::new(EnrollmentMutator::new(
            config.clone(),
            ipa.clone(),
            cluster.clone(),
            tracker.clone(),
        ));
        let lifecycle = Arc::new(LifecycleController::new(
            config.clone(),
            ipa,
            cluster,
            tracker,
            metrics.clone(),
        ));

        // Rebuild in-memory state from finalizers left by earlier runs
        info!("Performing startup reconciliation...");
        let rebuilt = lifecycle.reconcile_until_ready().await;
        info!("Startup reconciliation completed, {} records rebuilt", rebuilt);

        let webhook_server = {
            let state = Arc::new(WebhookState {
                mutator,
                metrics,
                admission_timeout: config.admission_timeout(),
            });
            let tls = match (&config.tls_cert_path, &config.tls_key_path) {
                (Some(cert_path), Some(key_path)) => Some(TlsFiles {
                    cert_path: cert_path.clone(),
                    key_path: key_path.clone(),
                }),
                _ => None,
            };
            tokio::spawn(async move { webhook::serve(state, listen_addr, tls).await })
        };

        let lifecycle_poller = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.run().await })
        };

        let vm_watcher = {
            let watcher = Watcher::new(lifecycle, vm_api);
            tokio::spawn(async move { watcher.watch_virtual_machines().await })
        };

        Ok(Self {
            webhook_server,
            lifecycle_poller,
            vm_watcher,
        })
    }

    /// Runs the controller until one of its tasks exits.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("virt-joiner running");

        tokio::select! {
            result = &mut self.webhook_server => {
                result.map_err(|e| ControllerError::Server(format!("webhook server panicked: {}", e)))?
                    .map_err(|e| ControllerError::Server(format!("webhook server error: {}", e)))?;
            }
            result = &mut self.lifecycle_poller => {
                result.map_err(|e| ControllerError::Watch(format!("lifecycle poller panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("lifecycle poller error: {}", e)))?;
            }
            result = &mut self.vm_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("VirtualMachine watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("VirtualMachine watcher error: {}", e)))?;
            }
        }

        // Tasks are meant to run forever
        Err(ControllerError::Watch("a controller task exited".to_string()))
    }
}
