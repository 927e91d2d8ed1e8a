//! OS profile resolution
//!
//! Maps a VM's OS hint (instance type, preference or `vm.kubevirt.io/os`
//! annotation) to the commands that install and run the FreeIPA client.
//!
//! Profiles are an ordered list evaluated top to bottom; the first profile
//! whose token is a case-insensitive substring of the input wins. Inputs that
//! match nothing get the default profile, never an error.

use crate::template::render;
use ipa_client::Otp;
use serde::{Deserialize, Serialize};

/// Join command used when a profile does not bring its own.
pub const DEFAULT_JOIN_COMMAND: &str = "ipa-client-install --server={server} --hostname={fqdn} --domain={domain} --realm={realm} --password='{otp}' --mkhomedir --unattended --no-ntp";

/// Install command of the default (RHEL-like) profile.
pub const DEFAULT_INSTALL_COMMAND: &str = "dnf install -y ipa-client";

/// Install command for Debian and Ubuntu guests.
pub const APT_INSTALL_COMMAND: &str =
    "export DEBIAN_FRONTEND=noninteractive && apt-get update -y && apt-get install -y freeipa-client";

/// OS family of a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OsFamily {
    #[default]
    RhelLike,
    DebianLike,
    Other,
}

fn default_join_command() -> String {
    DEFAULT_JOIN_COMMAND.to_string()
}

/// One entry of the `os_profiles` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsProfile {
    /// Substring matched against the OS hint
    #[serde(rename = "match", default)]
    pub match_token: String,

    #[serde(default)]
    pub family: OsFamily,

    /// Shell command installing the FreeIPA client
    pub install_command: String,

    /// Join command template, see [`JoinContext`] for the placeholders
    #[serde(default = "default_join_command")]
    pub join_command: String,
}

impl OsProfile {
    /// Build a profile with the default join command.
    pub fn new(match_token: &str, family: OsFamily, install_command: &str) -> Self {
        Self {
            match_token: match_token.to_string(),
            family,
            install_command: install_command.to_string(),
            join_command: default_join_command(),
        }
    }

    /// Profile used when nothing matches.
    #[must_use]
    pub fn default_profile() -> Self {
        Self::new("", OsFamily::RhelLike, DEFAULT_INSTALL_COMMAND)
    }

    /// Profiles shipped when the configuration has none.
    #[must_use]
    pub fn builtin_profiles() -> Vec<Self> {
        vec![
            Self::new("ubuntu", OsFamily::DebianLike, APT_INSTALL_COMMAND),
            Self::new("debian", OsFamily::DebianLike, APT_INSTALL_COMMAND),
        ]
    }

    /// Render the join command for one enrollment.
    #[must_use]
    pub fn render_join(&self, ctx: &JoinContext<'_>) -> String {
        render(
            &self.join_command,
            &[
                ("server", ctx.server),
                ("fqdn", ctx.fqdn),
                ("hostname", ctx.hostname),
                ("domain", ctx.domain),
                ("realm", ctx.realm),
                ("otp", ctx.otp.expose()),
            ],
        )
    }
}

/// Values substituted into a join command template.
#[derive(Debug)]
pub struct JoinContext<'a> {
    /// FreeIPA server that accepted the registration
    pub server: &'a str,
    pub fqdn: &'a str,
    /// Short host name
    pub hostname: &'a str,
    pub domain: &'a str,
    pub realm: &'a str,
    pub otp: &'a Otp,
}

/// First-match-wins profile resolver
#[derive(Debug, Clone)]
pub struct OsProfileResolver {
    profiles: Vec<OsProfile>,
    default: OsProfile,
}

impl OsProfileResolver {
    /// Create a resolver over `profiles` (in evaluation order).
    pub fn new(profiles: Vec<OsProfile>, default: OsProfile) -> Self {
        Self { profiles, default }
    }

    /// Resolve a single OS hint.
    pub fn resolve(&self, name: &str) -> &OsProfile {
        self.find(name).unwrap_or(&self.default)
    }

    /// Resolve the first candidate that matches a profile, else the default.
    pub fn resolve_first<'a, I>(&self, candidates: I) -> &OsProfile
    where
        I: IntoIterator<Item = &'a str>,
    {
        candidates
            .into_iter()
            .find_map(|name| self.find(name))
            .unwrap_or(&self.default)
    }

    fn find(&self, name: &str) -> Option<&OsProfile> {
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            return None;
        }
        self.profiles.iter().find(|profile| {
            let token = profile.match_token.trim().to_lowercase();
            !token.is_empty() && name.contains(&token)
        })
    }
}
