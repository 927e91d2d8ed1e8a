//! Runtime configuration
//!
//! Precedence: built-in defaults, then the YAML file at `CONFIG_PATH`
//! (default `config.yaml`), then environment variables. A missing file is
//! fine; an unreadable or malformed one is an error. The loaded snapshot is
//! shared read-only for the life of the process.

use crate::error::ControllerError;
use crate::os_profile::{OsProfile, OsProfileResolver};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Controller configuration snapshot
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Comma-separated static FreeIPA server list (fallback for DNS discovery)
    pub ipa_host: String,
    pub ipa_user: String,
    pub ipa_pass: String,
    /// Directory domain, also used for SRV discovery
    pub domain: String,
    /// Kerberos realm; upper-cased domain when unset
    pub realm: Option<String>,
    pub ipa_verify_ssl: bool,
    pub ipa_srv_service: String,
    pub ipa_rpc_port: u16,
    /// Per-RPC timeout
    pub ipa_timeout_secs: u64,
    /// Finalizer guarding VM deletion until the host is removed
    pub finalizer_name: String,
    pub log_level: String,
    /// FQDN template, `{name}`, `{namespace}` and `{domain}` available
    pub hostname_template: String,
    pub enroll_label: String,
    /// Only enroll VMs whose (inherited) labels carry `<enroll_label>=true`
    pub enroll_label_required: bool,
    pub poll_interval_secs: u64,
    pub verification_max_attempts: u32,
    pub cleanup_max_attempts: u32,
    /// Poll cycles an admitted VM may stay invisible before its host is
    /// treated as orphaned
    pub persist_grace_cycles: u32,
    pub listen_addr: String,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub admission_timeout_secs: u64,
    /// Namespace to watch; all namespaces when unset
    pub watch_namespace: Option<String>,
    /// Ordered OS profile list (YAML only)
    pub os_profiles: Vec<OsProfile>,
    /// Profile for VMs matching no entry (YAML only)
    pub default_os_profile: OsProfile,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ipa_host: "ipa.example.com".to_string(),
            ipa_user: "admin".to_string(),
            ipa_pass: "password".to_string(),
            domain: "example.com".to_string(),
            realm: None,
            ipa_verify_ssl: false,
            ipa_srv_service: ipa_client::DEFAULT_SRV_SERVICE.to_string(),
            ipa_rpc_port: 443,
            ipa_timeout_secs: 5,
            finalizer_name: "ipa.enroll/cleanup".to_string(),
            log_level: "INFO".to_string(),
            hostname_template: "{name}.{domain}".to_string(),
            enroll_label: "ipa-enroll".to_string(),
            enroll_label_required: false,
            poll_interval_secs: 10,
            verification_max_attempts: 90,
            cleanup_max_attempts: 10,
            persist_grace_cycles: 6,
            listen_addr: "0.0.0.0:8443".to_string(),
            tls_cert_path: None,
            tls_key_path: None,
            admission_timeout_secs: 10,
            watch_namespace: None,
            os_profiles: OsProfile::builtin_profiles(),
            default_os_profile: OsProfile::default_profile(),
        }
    }
}

impl Config {
    /// Load from `CONFIG_PATH` and the process environment.
    pub fn load() -> Result<Self, ControllerError> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path), |key| std::env::var(key).ok())
    }

    /// Load from `path`, then apply overrides from `env`.
    pub fn load_from<F>(path: &Path, env: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => Self::from_yaml(&text)
                .map_err(|e| ControllerError::InvalidConfig(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(ControllerError::InvalidConfig(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )));
            }
        };
        config.apply_env(env)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document over the defaults. An empty document is valid.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        Ok(serde_yaml::from_str::<Option<Self>>(text)?.unwrap_or_default())
    }

    fn apply_env<F>(&mut self, env: F) -> Result<(), ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, target: &mut String| {
            if let Some(value) = env(key) {
                *target = value;
            }
        };
        string("IPA_HOST", &mut self.ipa_host);
        string("IPA_USER", &mut self.ipa_user);
        string("IPA_PASS", &mut self.ipa_pass);
        string("DOMAIN", &mut self.domain);
        string("IPA_SRV_SERVICE", &mut self.ipa_srv_service);
        string("FINALIZER_NAME", &mut self.finalizer_name);
        string("LOG_LEVEL", &mut self.log_level);
        string("HOSTNAME_TEMPLATE", &mut self.hostname_template);
        string("ENROLL_LABEL", &mut self.enroll_label);
        string("LISTEN_ADDR", &mut self.listen_addr);

        let optional = |key: &str, target: &mut Option<String>| {
            if let Some(value) = env(key) {
                *target = if value.trim().is_empty() { None } else { Some(value) };
            }
        };
        optional("REALM", &mut self.realm);
        optional("TLS_CERT_PATH", &mut self.tls_cert_path);
        optional("TLS_KEY_PATH", &mut self.tls_key_path);
        optional("WATCH_NAMESPACE", &mut self.watch_namespace);

        if let Some(value) = env("IPA_VERIFY_SSL") {
            self.ipa_verify_ssl = value.trim().eq_ignore_ascii_case("true");
        }
        if let Some(value) = env("ENROLL_LABEL_REQUIRED") {
            self.enroll_label_required = value.trim().eq_ignore_ascii_case("true");
        }

        parse_env(&env, "IPA_RPC_PORT", &mut self.ipa_rpc_port)?;
        parse_env(&env, "IPA_TIMEOUT_SECS", &mut self.ipa_timeout_secs)?;
        parse_env(&env, "POLL_INTERVAL_SECS", &mut self.poll_interval_secs)?;
        parse_env(&env, "VERIFICATION_MAX_ATTEMPTS", &mut self.verification_max_attempts)?;
        parse_env(&env, "CLEANUP_MAX_ATTEMPTS", &mut self.cleanup_max_attempts)?;
        parse_env(&env, "PERSIST_GRACE_CYCLES", &mut self.persist_grace_cycles)?;
        parse_env(&env, "ADMISSION_TIMEOUT_SECS", &mut self.admission_timeout_secs)?;
        Ok(())
    }

    /// DNS names are case-insensitive; host names are built lowercase.
    fn normalize(&mut self) {
        self.domain = self.domain.trim().trim_end_matches('.').to_ascii_lowercase();
    }

    fn validate(&self) -> Result<(), ControllerError> {
        if self.domain.trim().is_empty() {
            return Err(ControllerError::InvalidConfig("domain must not be empty".to_string()));
        }
        if self.finalizer_name.trim().is_empty() {
            return Err(ControllerError::InvalidConfig("finalizer_name must not be empty".to_string()));
        }
        if !self.hostname_template.contains("{name}") {
            return Err(ControllerError::InvalidConfig(
                "hostname_template must contain {name}".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 || self.ipa_timeout_secs == 0 || self.admission_timeout_secs == 0 {
            return Err(ControllerError::InvalidConfig(
                "poll_interval_secs, ipa_timeout_secs and admission_timeout_secs must be positive".to_string(),
            ));
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return Err(ControllerError::InvalidConfig(
                "tls_cert_path and tls_key_path must be set together".to_string(),
            ));
        }
        Ok(())
    }

    /// Kerberos realm
    #[must_use]
    pub fn realm(&self) -> String {
        self.realm
            .clone()
            .unwrap_or_else(|| self.domain.trim_end_matches('.').to_uppercase())
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub fn ipa_timeout(&self) -> Duration {
        Duration::from_secs(self.ipa_timeout_secs)
    }

    #[must_use]
    pub fn admission_timeout(&self) -> Duration {
        Duration::from_secs(self.admission_timeout_secs)
    }

    /// OS profile resolver over the configured list
    #[must_use]
    pub fn os_profile_resolver(&self) -> OsProfileResolver {
        OsProfileResolver::new(self.os_profiles.clone(), self.default_os_profile.clone())
    }

    /// `tracing` filter directive for `log_level` (`DEBUG|INFO|WARNING|ERROR`)
    #[must_use]
    pub fn log_directive(&self) -> &'static str {
        match self.log_level.trim().to_ascii_uppercase().as_str() {
            "TRACE" => "trace",
            "DEBUG" => "debug",
            "WARN" | "WARNING" => "warn",
            "ERROR" | "CRITICAL" => "error",
            _ => "info",
        }
    }
}

fn parse_env<F, T>(env: &F, key: &str, target: &mut T) -> Result<(), ControllerError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(value) = env(key) {
        *target = value
            .trim()
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("{}={:?}: {}", key, value, e)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os_profile::OsFamily;
    use crate::template::target_fqdn;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    fn temp_config(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("virt-joiner-{}-{}.yaml", name, std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_file() {
        let config = Config::load_from(Path::new("/nonexistent/virt-joiner.yaml"), env_from(&[])).unwrap();
        assert_eq!(config.finalizer_name, "ipa.enroll/cleanup");
        assert_eq!(config.hostname_template, "{name}.{domain}");
        assert_eq!(config.realm(), "EXAMPLE.COM");
        assert!(!config.ipa_verify_ssl);
        assert_eq!(config.os_profiles.len(), 2);
    }

    #[test]
    fn test_env_overrides_file() {
        let path = temp_config(
            "precedence",
            "domain: file.example\nipa_user: from-file\nipa_verify_ssl: true\npoll_interval_secs: 30\n",
        );
        let config = Config::load_from(
            &path,
            env_from(&[("DOMAIN", "env.example"), ("IPA_VERIFY_SSL", "False"), ("LOG_LEVEL", "warning")]),
        )
        .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.domain, "env.example");
        assert_eq!(config.ipa_user, "from-file");
        assert!(!config.ipa_verify_ssl);
        assert_eq!(config.poll_interval_secs, 30);
        assert_eq!(config.log_directive(), "warn");
    }

    #[test]
    fn test_domain_is_lowercased_on_load() {
        let config = Config::load_from(Path::new("/nonexistent"), env_from(&[("DOMAIN", " Example.COM. ")])).unwrap();
        assert_eq!(config.domain, "example.com");
        assert_eq!(config.realm(), "EXAMPLE.COM");
        assert_eq!(
            target_fqdn(&config.hostname_template, "vm1", "default", &config.domain).unwrap(),
            "vm1.example.com"
        );

        let path = temp_config("domain-case", "domain: Lab.Example.ORG\n");
        let config = Config::load_from(&path, env_from(&[])).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.domain, "lab.example.org");
    }

    #[test]
    fn test_os_profiles_from_yaml() {
        let config = Config::from_yaml(
            "os_profiles:\n  - match: sles\n    family: other\n    install_command: zypper -n in freeipa-client\n\
             default_os_profile:\n  family: rhel-like\n  install_command: yum install -y ipa-client\n",
        )
        .unwrap();
        assert_eq!(config.os_profiles.len(), 1);
        assert_eq!(config.os_profiles[0].family, OsFamily::Other);
        let resolver = config.os_profile_resolver();
        assert_eq!(resolver.resolve("windows").install_command, "yum install -y ipa-client");
    }

    #[test]
    fn test_empty_file_is_defaults() {
        let config = Config::from_yaml("").unwrap();
        assert_eq!(config.poll_interval_secs, 10);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let path = temp_config("malformed", "poll_interval_secs: [not, a, number]\n");
        let result = Config::load_from(&path, env_from(&[]));
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
    }

    #[test]
    fn test_bad_numeric_env() {
        let result = Config::load_from(Path::new("/nonexistent"), env_from(&[("POLL_INTERVAL_SECS", "soon")]));
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
    }

    #[test]
    fn test_tls_paths_must_pair() {
        let result = Config::load_from(Path::new("/nonexistent"), env_from(&[("TLS_CERT_PATH", "/tls/tls.crt")]));
        assert!(result.is_err());
    }
}
