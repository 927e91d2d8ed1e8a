//! VirtualMachine watcher.
//!
//! Feeds VM changes into the lifecycle controller using
//! kube_runtime::Controller, which handles reconnection and relisting.
//! Only deletions of guarded VMs matter; everything else is a no-op.

use crate::error::ControllerError;
use crate::cluster::VmSummary;
use crate::lifecycle::LifecycleController;
use futures::StreamExt;
use kube::Api;
use kube_runtime::{Controller, controller::Action, watcher};
use kubevirt_crds::VirtualMachine;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Watches VirtualMachine resources for deletions.
pub struct Watcher {
    lifecycle: Arc<LifecycleController>,
    vm_api: Api<VirtualMachine>,
}

impl Watcher {
    pub fn new(lifecycle: Arc<LifecycleController>, vm_api: Api<VirtualMachine>) -> Self {
        Self { lifecycle, vm_api }
    }

    /// Watch VirtualMachines until the stream ends.
    pub async fn watch_virtual_machines(&self) -> Result<(), ControllerError> {
        info!("Starting VirtualMachine watcher");

        let error_policy = |vm: Arc<VirtualMachine>, error: &ControllerError, _ctx: Arc<LifecycleController>| {
            error!(vm = ?vm.metadata.name, error = %error, "Reconciliation error for VirtualMachine");
            Action::requeue(Duration::from_secs(60))
        };

        Controller::new(self.vm_api.clone(), watcher::Config::default())
            .run(reconcile, error_policy, self.lifecycle.clone())
            .for_each(|res| async move {
                if let Err(e) = res {
                    error!("Controller error for VirtualMachine: {}", e);
                }
            })
            .await;

        Ok(())
    }
}

async fn reconcile(vm: Arc<VirtualMachine>, lifecycle: Arc<LifecycleController>) -> Result<Action, ControllerError> {
    let summary = VmSummary::from_vm(&vm)
        .ok_or_else(|| ControllerError::InvalidObject("VirtualMachine without name or namespace".to_string()))?;
    lifecycle.observe_vm(&summary);
    Ok(Action::await_change())
}
