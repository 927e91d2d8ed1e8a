//! Integration tests for the FreeIPA client
//!
//! These tests require a reachable FreeIPA server.
//! Set IPA_HOST, IPA_USER, IPA_PASS and DOMAIN environment variables to run.

use ipa_client::{
    DEFAULT_SRV_SERVICE, DeleteOutcome, DirectoryServerResolver, HickorySrvLookup, IpaClient, IpaClientSettings,
    IpaClientTrait,
};
use std::sync::Arc;
use std::time::Duration;

fn client_from_env() -> IpaClient {
    let domain = std::env::var("DOMAIN").unwrap_or_else(|_| "example.com".to_string());
    let settings = IpaClientSettings {
        domain,
        static_hosts: std::env::var("IPA_HOST").unwrap_or_default(),
        username: std::env::var("IPA_USER").unwrap_or_else(|_| "admin".to_string()),
        password: std::env::var("IPA_PASS").expect("IPA_PASS environment variable must be set"),
        verify_ssl: std::env::var("IPA_VERIFY_SSL").is_ok_and(|v| v == "true"),
        timeout: Duration::from_secs(10),
    };
    let lookup = HickorySrvLookup::from_system_conf(Duration::from_secs(5)).expect("Failed to build resolver");
    let resolver = DirectoryServerResolver::new(Arc::new(lookup), DEFAULT_SRV_SERVICE, 443);
    IpaClient::new(resolver, settings).expect("Failed to create client")
}

fn test_fqdn(name: &str) -> String {
    let domain = std::env::var("DOMAIN").unwrap_or_else(|_| "example.com".to_string());
    format!("{}.{}", name, domain)
}

#[tokio::test]
#[ignore] // Requires running FreeIPA instance
async fn test_validate_connectivity() {
    let client = client_from_env();
    client.validate_connectivity().await.expect("FreeIPA not reachable");
}

#[tokio::test]
#[ignore]
async fn test_add_host_is_idempotent() {
    let client = client_from_env();
    let fqdn = test_fqdn("virt-joiner-it-add");

    let first = client.add_host(&fqdn, "virt-joiner integration test").await.expect("first add failed");
    let second = client.add_host(&fqdn, "virt-joiner integration test").await.expect("second add failed");
    assert_ne!(first.otp, second.otp);

    let status = client.host_status(&fqdn).await.expect("host_show failed");
    assert!(status.exists);
    assert!(!status.has_keytab);

    client.delete_host(&fqdn).await.expect("cleanup failed");
}

#[tokio::test]
#[ignore]
async fn test_delete_missing_host() {
    let client = client_from_env();
    let fqdn = test_fqdn("virt-joiner-it-missing");

    let outcome = client.delete_host(&fqdn).await.expect("delete failed");
    assert_eq!(outcome, DeleteOutcome::NotFound);
    assert!(!client.has_keytab(&fqdn).await.expect("host_show failed"));
}
