//! FreeIPA JSON-RPC client
//!
//! Registers and removes host entries in FreeIPA/IDM for the virt-joiner
//! controller. Servers are discovered through DNS SRV records (static list as
//! fallback) and every operation fails over across them in order.
//!
//! # Example
//!
//! ```no_run
//! use ipa_client::{DirectoryServerResolver, HickorySrvLookup, IpaClient, IpaClientSettings, IpaClientTrait};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let lookup = HickorySrvLookup::from_system_conf(Duration::from_secs(5))?;
//! let resolver = DirectoryServerResolver::new(Arc::new(lookup), "_kerberos._tcp", 443);
//! let client = IpaClient::new(
//!     resolver,
//!     IpaClientSettings {
//!         domain: "example.com".to_string(),
//!         static_hosts: "ipa1.example.com".to_string(),
//!         username: "admin".to_string(),
//!         password: "secret".to_string(),
//!         verify_ssl: true,
//!         timeout: Duration::from_secs(10),
//!     },
//! )?;
//!
//! // Register a host and hand its one-time password to the VM
//! let enrollment = client.add_host("vm1.example.com", "created by virt-joiner").await?;
//! println!("join against {}", enrollment.server);
//!
//! // Later: has the VM joined?
//! let joined = client.has_keytab("vm1.example.com").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod endpoint;
pub mod error;
pub mod models;
pub mod resolver;
#[path = "trait.rs"]
pub mod ipa_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::{IpaClient, IpaClientSettings};
pub use endpoint::{DirectoryEndpoint, SrvRecord, Transport};
pub use error::IpaError;
pub use ipa_trait::IpaClientTrait;
pub use models::*;
pub use resolver::{DEFAULT_SRV_SERVICE, DirectoryServerResolver, HickorySrvLookup, SrvLookup};
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockFailure, MockIpaClient};
