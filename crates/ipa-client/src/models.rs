//! FreeIPA API models
//!
//! Request/response shapes of the JSON-RPC endpoint and the values handed back
//! to callers.

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::fmt;

/// API version sent with every command.
pub const API_VERSION: &str = "2.231";

/// Length of generated one-time passwords.
pub const OTP_LENGTH: usize = 24;

/// One-time enrollment password.
///
/// `Debug` and `Display` never print the secret; call [`Otp::expose`] where the
/// value has to leave the process (the boot script, the RPC body).
#[derive(Clone, PartialEq, Eq)]
pub struct Otp(String);

impl Otp {
    /// Wrap an existing credential.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh random alphanumeric credential.
    #[must_use]
    pub fn generate() -> Self {
        let value: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(OTP_LENGTH)
            .map(char::from)
            .collect();
        Self(value)
    }

    /// The credential itself.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Otp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Otp(***)")
    }
}

impl fmt::Display for Otp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Result of registering a host.
#[derive(Debug, Clone)]
pub struct HostEnrollment {
    /// Credential the VM uses to join
    pub otp: Otp,
    /// Server that accepted the registration; the VM joins against it
    pub server: String,
}

/// Result of a host deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The host entry was removed
    Deleted,
    /// There was nothing to remove
    NotFound,
}

/// Directory-side view of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostStatus {
    /// Host entry exists
    pub exists: bool,
    /// Host holds a keytab, i.e. it completed the domain join
    pub has_keytab: bool,
}

/// JSON-RPC request body sent to `/ipa/session/json`.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub method: String,
    pub params: (Vec<serde_json::Value>, serde_json::Map<String, serde_json::Value>),
    pub id: u32,
}

impl RpcRequest {
    /// Build a request for `method` with positional `args` and keyword
    /// `options`. The API version is always added to the options.
    pub fn new(
        method: &str,
        args: Vec<serde_json::Value>,
        mut options: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        options.insert("version".to_string(), serde_json::Value::from(API_VERSION));
        Self {
            method: method.to_string(),
            params: (args, options),
            id: 0,
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub message: String,
}

/// JSON-RPC response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

/// `host_show` result entry (only the fields we read).
#[derive(Debug, Clone, Deserialize)]
pub struct HostEntry {
    #[serde(default)]
    pub fqdn: Vec<String>,
    #[serde(default)]
    pub has_keytab: bool,
}
