//! Unit tests for the enrollment mutator

#[cfg(test)]
mod tests {
    use super::super::{EnrollmentMutator, MutationOutcome};
    use crate::cluster::TemplateKind;
    use crate::config::Config;
    use crate::error::MutationError;
    use crate::test_utils::*;
    use crate::tracker::{EnrollmentRecord, EnrollmentState, EnrollmentTracker, VmIdentity};
    use ipa_client::{MockFailure, MockIpaClient};
    use serde_json::{Value, json};
    use std::sync::Arc;

    struct Fixture {
        mutator: EnrollmentMutator,
        ipa: MockIpaClient,
        cluster: Arc<FakeClusterOps>,
        tracker: Arc<EnrollmentTracker>,
    }

    fn fixture_with(config: Config) -> Fixture {
        let ipa = MockIpaClient::new("ipa1.example.com");
        let cluster = Arc::new(FakeClusterOps::new());
        let tracker = Arc::new(EnrollmentTracker::new());
        let mutator = EnrollmentMutator::new(
            Arc::new(config),
            Arc::new(ipa.clone()),
            cluster.clone(),
            tracker.clone(),
        );
        Fixture {
            mutator,
            ipa,
            cluster,
            tracker,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(test_config())
    }

    fn vm1() -> VmIdentity {
        VmIdentity::new("default", "vm1")
    }

    fn expect_patch(outcome: MutationOutcome) -> json_patch::Patch {
        match outcome {
            MutationOutcome::Patch(patch) => patch,
            other => panic!("expected a patch, got {:?}", other),
        }
    }

    fn patch_paths(patch: &json_patch::Patch) -> Vec<String> {
        serde_json::to_value(patch)
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|op| op["path"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_vm_creation_is_enrolled() {
        let f = fixture();
        f.ipa.push_otp("ABC123");
        let vm = vm_object("vm1");

        let patch = expect_patch(f.mutator.on_create(&admission_request("CREATE", vm.clone())).await);
        let patched = apply_patch(&vm, &patch);

        let user_data = cloud_init_user_data(&patched);
        assert!(user_data.contains("--password='ABC123'"));
        assert!(user_data.contains("--hostname=vm1.example.com"));
        assert!(user_data.contains("--server=ipa1.example.com"));
        assert!(user_data.contains("--realm=EXAMPLE.COM"));
        assert_eq!(patched["metadata"]["finalizers"], json!([FINALIZER]));
        assert_eq!(
            patched["metadata"]["annotations"]["ipa-enroll/status"],
            "Enrolled as vm1.example.com"
        );

        let record = f.tracker.get(&vm1()).unwrap();
        assert_eq!(record.state, EnrollmentState::Injected);
        assert_eq!(record.fqdn, "vm1.example.com");
        assert_eq!(record.otp().unwrap().expose(), "ABC123");

        let description = f.ipa.description_of("vm1.example.com").unwrap();
        assert!(description.starts_with("Created by virt-joiner at "));
        assert!(description.ends_with("| K8s UID: 705ab4f5-6393-11e8-b7cc-42010a800002"));
    }

    #[tokio::test]
    async fn test_patch_has_one_injection_and_one_guard() {
        let f = fixture();
        let patch = expect_patch(f.mutator.on_create(&admission_request("CREATE", vm_object("vm1"))).await);
        let paths = patch_paths(&patch);

        assert_eq!(paths.iter().filter(|p| p.starts_with("/metadata/finalizers")).count(), 1);
        assert_eq!(paths.iter().filter(|p| p.starts_with("/spec/template/spec/volumes")).count(), 1);
        assert_eq!(f.tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_finalizers_and_annotations_are_kept() {
        let f = fixture();
        let mut vm = vm_object("vm1");
        vm["metadata"]["finalizers"] = json!(["example.com/protect"]);
        vm["metadata"]["annotations"] = json!({"owner": "team-a"});

        let patch = expect_patch(f.mutator.on_create(&admission_request("CREATE", vm.clone())).await);
        let patched = apply_patch(&vm, &patch);

        assert_eq!(patched["metadata"]["finalizers"], json!(["example.com/protect", FINALIZER]));
        assert_eq!(patched["metadata"]["annotations"]["owner"], "team-a");
        assert!(patch_paths(&patch).contains(&"/metadata/annotations/ipa-enroll~1status".to_string()));
    }

    #[tokio::test]
    async fn test_directory_unreachable_fails_closed() {
        let f = fixture();
        f.ipa.fail("add_host", MockFailure::Unreachable);

        let outcome = f.mutator.on_create(&admission_request("CREATE", vm_object("vm1"))).await;
        assert!(matches!(outcome, MutationOutcome::Deny(MutationError::DirectoryUnavailable(_))));
        assert!(f.tracker.is_empty());
    }

    #[tokio::test]
    async fn test_directory_rejection_fails_closed() {
        let f = fixture();
        f.ipa.fail("add_host", MockFailure::Rejected(3009));

        let outcome = f.mutator.on_create(&admission_request("CREATE", vm_object("vm1"))).await;
        assert!(matches!(outcome, MutationOutcome::Deny(MutationError::DirectoryRejected(_))));
        assert!(f.tracker.get(&vm1()).is_none());
    }

    #[tokio::test]
    async fn test_non_create_operations_are_ignored() {
        let f = fixture();
        for operation in ["UPDATE", "DELETE"] {
            let outcome = f.mutator.on_create(&admission_request(operation, vm_object("vm1"))).await;
            assert!(matches!(outcome, MutationOutcome::Skip));
        }
        assert_eq!(f.ipa.call_count("add_host"), 0);
    }

    #[tokio::test]
    async fn test_long_fqdn_is_rejected_before_registration() {
        let f = fixture();
        let name = "a".repeat(60);
        let outcome = f.mutator.on_create(&admission_request("CREATE", vm_object(&name))).await;

        match outcome {
            MutationOutcome::Deny(MutationError::InvalidHostname(msg)) => {
                assert!(msg.contains("Max allowed is 64"));
            }
            other => panic!("expected InvalidHostname, got {:?}", other),
        }
        assert_eq!(f.ipa.call_count("add_host"), 0);
    }

    #[tokio::test]
    async fn test_unmergeable_boot_config_denied_without_registration() {
        let f = fixture();
        let mut vm = vm_object("vm1");
        vm["spec"]["template"]["spec"]["volumes"]
            .as_array_mut()
            .unwrap()
            .push(json!({"name": "cloudinitdisk", "cloudInitNoCloud": {"userData": "#!/bin/sh\necho hi\n"}}));

        let outcome = f.mutator.on_create(&admission_request("CREATE", vm)).await;
        assert!(matches!(outcome, MutationOutcome::Deny(MutationError::PatchConflict(_))));
        assert_eq!(f.ipa.call_count("add_host"), 0);
        assert!(f.tracker.is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_rotates_the_credential() {
        let f = fixture();
        f.ipa.push_otp("FIRST1");
        f.ipa.push_otp("SECOND2");
        let request = admission_request("CREATE", vm_object("vm1"));

        let first = expect_patch(f.mutator.on_create(&request).await);
        let second = expect_patch(f.mutator.on_create(&request).await);

        let vm = vm_object("vm1");
        assert!(cloud_init_user_data(&apply_patch(&vm, &first)).contains("FIRST1"));
        assert!(cloud_init_user_data(&apply_patch(&vm, &second)).contains("SECOND2"));
        assert_eq!(f.ipa.password_of("vm1.example.com").as_deref(), Some("SECOND2"));

        let record = f.tracker.get(&vm1()).unwrap();
        assert_eq!(record.state, EnrollmentState::Injected);
        assert_eq!(record.otp().unwrap().expose(), "SECOND2");
    }

    #[tokio::test]
    async fn test_live_enrollment_is_not_overwritten() {
        let f = fixture();
        f.tracker.put(EnrollmentRecord::new(
            vm1(),
            "vm1.example.com",
            EnrollmentState::AwaitingVerification,
        ));

        let outcome = f.mutator.on_create(&admission_request("CREATE", vm_object("vm1"))).await;
        assert!(matches!(outcome, MutationOutcome::Deny(MutationError::AlreadyEnrolled(_))));
        assert_eq!(f.ipa.call_count("add_host"), 0);
    }

    #[tokio::test]
    async fn test_admission_during_orphan_removal_is_retryable() {
        let f = fixture();
        f.tracker
            .put(EnrollmentRecord::new(vm1(), "vm1.example.com", EnrollmentState::Orphaning));

        let outcome = f.mutator.on_create(&admission_request("CREATE", vm_object("vm1"))).await;
        match outcome {
            MutationOutcome::Deny(e) => {
                assert!(matches!(e, MutationError::ConcurrentAdmission(_)));
                assert!(e.to_string().contains("retry"));
            }
            other => panic!("expected a denial, got {:?}", other),
        }
        assert_eq!(f.ipa.call_count("add_host"), 0);
        assert_eq!(f.tracker.get(&vm1()).unwrap().state, EnrollmentState::Orphaning);
    }

    #[tokio::test]
    async fn test_os_profile_from_instancetype_name() {
        let f = fixture();
        let mut vm = vm_object("vm1");
        vm["spec"]["instancetype"] = json!({"name": "ubuntu-22.04-large"});

        let patch = expect_patch(f.mutator.on_create(&admission_request("CREATE", vm.clone())).await);
        let user_data = cloud_init_user_data(&apply_patch(&vm, &patch));
        assert!(user_data.contains("apt-get install -y freeipa-client"));
        assert!(!user_data.contains("dnf install"));
    }

    #[tokio::test]
    async fn test_os_annotation_inherited_from_preference() {
        let f = fixture();
        f.cluster.add_template(
            TemplateKind::Preference,
            "corp-linux",
            None,
            &[],
            &[("vm.kubevirt.io/os", "ubuntu")],
        );
        let mut vm = vm_object("vm1");
        vm["spec"]["preference"] = json!({"name": "corp-linux"});

        let patch = expect_patch(f.mutator.on_create(&admission_request("CREATE", vm.clone())).await);
        assert!(cloud_init_user_data(&apply_patch(&vm, &patch)).contains("apt-get"));
    }

    #[tokio::test]
    async fn test_unknown_os_uses_default_profile() {
        let f = fixture();
        let mut vm = vm_object("vm1");
        vm["spec"]["preference"] = json!({"name": "unknown-os-xyz"});

        let patch = expect_patch(f.mutator.on_create(&admission_request("CREATE", vm.clone())).await);
        assert!(cloud_init_user_data(&apply_patch(&vm, &patch)).contains("dnf install -y ipa-client"));
    }

    #[tokio::test]
    async fn test_label_gate_uses_inherited_labels() {
        let f = fixture_with(Config {
            enroll_label_required: true,
            ..test_config()
        });
        f.cluster.add_template(
            TemplateKind::Instancetype,
            "u1.medium",
            None,
            &[("ipa-enroll", "true")],
            &[],
        );

        // Unlabelled VM without an instance type stays untouched
        let outcome = f.mutator.on_create(&admission_request("CREATE", vm_object("plain"))).await;
        assert!(matches!(outcome, MutationOutcome::Skip));

        let mut vm = vm_object("vm1");
        vm["spec"]["instancetype"] = json!({"name": "u1.medium"});
        assert!(matches!(
            f.mutator.on_create(&admission_request("CREATE", vm.clone())).await,
            MutationOutcome::Patch(_)
        ));

        // The VM's own label wins over the inherited one
        let mut opted_out = vm.clone();
        opted_out["metadata"]["name"] = json!("vm2");
        opted_out["metadata"]["labels"] = json!({"ipa-enroll": "false"});
        let outcome = f.mutator.on_create(&admission_request("CREATE", opted_out)).await;
        assert!(matches!(outcome, MutationOutcome::Skip));
        assert_eq!(f.ipa.call_count("add_host"), 1);
    }

    #[tokio::test]
    async fn test_namespaced_instancetype_lookup() {
        let f = fixture_with(Config {
            enroll_label_required: true,
            ..test_config()
        });
        f.cluster.add_template(
            TemplateKind::Instancetype,
            "small",
            Some("default"),
            &[("ipa-enroll", "true")],
            &[],
        );
        let mut vm = vm_object("vm1");
        vm["spec"]["instancetype"] = json!({"name": "small", "kind": "VirtualMachineInstancetype"});

        assert!(matches!(
            f.mutator.on_create(&admission_request("CREATE", vm)).await,
            MutationOutcome::Patch(_)
        ));
    }

    #[tokio::test]
    async fn test_template_lookup_failure_falls_back_to_own_metadata() {
        let f = fixture();
        f.cluster.fail_lookups(true);
        let mut vm = vm_object("vm1");
        vm["spec"]["instancetype"] = json!({"name": "u1.medium"});

        assert!(matches!(
            f.mutator.on_create(&admission_request("CREATE", vm)).await,
            MutationOutcome::Patch(_)
        ));
    }

    #[tokio::test]
    async fn test_object_without_spec_is_ignored() {
        let f = fixture();
        let vm: Value = json!({
            "apiVersion": "kubevirt.io/v1",
            "kind": "VirtualMachine",
            "metadata": {"name": "vm1", "namespace": "default"}
        });
        assert!(matches!(
            f.mutator.on_create(&admission_request("CREATE", vm)).await,
            MutationOutcome::Skip
        ));
    }
}
