//! FreeIPA API client
//!
//! Speaks the FreeIPA JSON-RPC API (`/ipa/session/json`) with password
//! session login. Every operation re-resolves the server list and walks it
//! left to right, moving on only when a server is unreachable or broken.

use crate::endpoint::DirectoryEndpoint;
use crate::error::IpaError;
use crate::ipa_trait::IpaClientTrait;
use crate::models::*;
use crate::resolver::DirectoryServerResolver;
use reqwest::Client;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE, COOKIE, REFERER, SET_COOKIE};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the FreeIPA session cookie.
const SESSION_COOKIE: &str = "ipa_session";

/// Settings needed to build an [`IpaClient`].
#[derive(Debug, Clone)]
pub struct IpaClientSettings {
    /// Directory domain used for SRV discovery
    pub domain: String,
    /// Comma-separated static fallback list
    pub static_hosts: String,
    /// Principal used to log in
    pub username: String,
    /// Password of `username`
    pub password: String,
    /// Validate server certificates
    pub verify_ssl: bool,
    /// Upper bound for one RPC against one server (login included)
    pub timeout: Duration,
}

/// Outcome of a single authenticated JSON-RPC post.
enum Reply {
    Body(RpcResponse),
    SessionExpired,
}

/// FreeIPA API client
pub struct IpaClient {
    http: Client,
    resolver: DirectoryServerResolver,
    settings: IpaClientSettings,
    // base URL -> session cookie value
    sessions: Mutex<HashMap<String, String>>,
}

impl IpaClient {
    /// Create a new FreeIPA client
    ///
    /// # Arguments
    /// * `resolver` - server discovery used before every operation
    /// * `settings` - credentials, TLS and timeout settings
    pub fn new(resolver: DirectoryServerResolver, settings: IpaClientSettings) -> Result<Self, IpaError> {
        if !settings.verify_ssl {
            warn!("FreeIPA certificate verification is disabled (ipa_verify_ssl=false)");
        }
        let http = Client::builder()
            .timeout(settings.timeout)
            .danger_accept_invalid_certs(!settings.verify_ssl)
            .build()?;

        Ok(Self {
            http,
            resolver,
            settings,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve the current candidate list, failing when it is empty.
    async fn endpoints(&self) -> Result<Vec<DirectoryEndpoint>, IpaError> {
        let endpoints = self
            .resolver
            .resolve(&self.settings.domain, &self.settings.static_hosts)
            .await;
        if endpoints.is_empty() {
            return Err(IpaError::NoEndpoints);
        }
        Ok(endpoints)
    }

    fn cached_session(&self, base_url: &str) -> Option<String> {
        self.sessions.lock().ok()?.get(base_url).cloned()
    }

    fn store_session(&self, base_url: &str, session: Option<String>) {
        if let Ok(mut sessions) = self.sessions.lock() {
            match session {
                Some(value) => {
                    sessions.insert(base_url.to_string(), value);
                }
                None => {
                    sessions.remove(base_url);
                }
            }
        }
    }

    /// Log in with username/password and return the session cookie value.
    async fn login(&self, endpoint: &DirectoryEndpoint) -> Result<String, IpaError> {
        let base_url = endpoint.base_url();
        let url = format!("{}/ipa/session/login_password", base_url);
        debug!("Logging in to FreeIPA server {}", endpoint);

        let body = format!(
            "user={}&password={}",
            urlencoding::encode(&self.settings.username),
            urlencoding::encode(&self.settings.password)
        );
        let response = self
            .http
            .post(&url)
            .header(REFERER, format!("{}/ipa", base_url))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(ACCEPT, "text/plain")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(IpaError::Server {
                server: endpoint.host.clone(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let reason = response
                .headers()
                .get("X-IPA-Rejection-Reason")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let text = response.text().await.unwrap_or_default();
            return Err(IpaError::Authentication {
                server: endpoint.host.clone(),
                message: reason.unwrap_or_else(|| format!("{} - {}", status, text.trim())),
            });
        }

        let session = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(session_from_cookie)
            .ok_or_else(|| {
                IpaError::InvalidResponse(format!("{} did not return an {} cookie", endpoint.host, SESSION_COOKIE))
            })?;

        info!("Successfully authenticated to {}", endpoint.host);
        self.store_session(&base_url, Some(session.clone()));
        Ok(session)
    }

    async fn post_rpc(
        &self,
        endpoint: &DirectoryEndpoint,
        session: &str,
        request: &RpcRequest,
    ) -> Result<Reply, IpaError> {
        let base_url = endpoint.base_url();
        let response = self
            .http
            .post(format!("{}/ipa/session/json", base_url))
            .header(REFERER, format!("{}/ipa", base_url))
            .header(ACCEPT, "application/json")
            .header(COOKIE, format!("{}={}", SESSION_COOKIE, session))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Ok(Reply::SessionExpired);
        }
        if status.is_server_error() {
            return Err(IpaError::Server {
                server: endpoint.host.clone(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(IpaError::InvalidResponse(format!(
                "{} answered {} to {}",
                endpoint.host, status, request.method
            )));
        }

        let text = response.text().await?;
        Ok(Reply::Body(decode_reply(&text)?))
    }

    /// Run one command against one server, logging in (or back in) as needed.
    async fn rpc_on(
        &self,
        endpoint: &DirectoryEndpoint,
        method: &str,
        args: Vec<Value>,
        options: Map<String, Value>,
    ) -> Result<Value, IpaError> {
        let request = RpcRequest::new(method, args, options);
        let base_url = endpoint.base_url();

        let session = match self.cached_session(&base_url) {
            Some(session) => session,
            None => self.login(endpoint).await?,
        };

        let reply = match self.post_rpc(endpoint, &session, &request).await? {
            Reply::Body(reply) => reply,
            Reply::SessionExpired => {
                debug!("Session on {} expired, logging in again", endpoint);
                self.store_session(&base_url, None);
                let session = self.login(endpoint).await?;
                match self.post_rpc(endpoint, &session, &request).await? {
                    Reply::Body(reply) => reply,
                    Reply::SessionExpired => {
                        self.store_session(&base_url, None);
                        return Err(IpaError::Authentication {
                            server: endpoint.host.clone(),
                            message: "session rejected right after login".to_string(),
                        });
                    }
                }
            }
        };

        rpc_result(method, reply)
    }

    /// Register the host on one server, rotating the password when it exists.
    async fn register_on(
        &self,
        endpoint: &DirectoryEndpoint,
        fqdn: &str,
        description: &str,
        otp: &Otp,
    ) -> Result<(), IpaError> {
        let mut options = Map::new();
        options.insert("force".to_string(), json!(true));
        options.insert("description".to_string(), json!(description));
        options.insert("userpassword".to_string(), json!(otp.expose()));

        let added = self.rpc_on(endpoint, "host_add", vec![json!(fqdn)], options).await;
        match registration_step(added)? {
            Registration::Added => {
                info!("Registered host {} on {}", fqdn, endpoint.host);
            }
            Registration::RotatePassword => {
                info!("Host {} already exists on {}, rotating enrollment password", fqdn, endpoint.host);
                let mut options = Map::new();
                options.insert("userpassword".to_string(), json!(otp.expose()));
                self.rpc_on(endpoint, "host_mod", vec![json!(fqdn)], options).await?;
            }
        }
        Ok(())
    }
}

/// What `host_add` left to do for a registration.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Registration {
    Added,
    /// The entry already existed; only its password must change
    RotatePassword,
}

/// Parse a JSON-RPC response body.
pub(crate) fn decode_reply(text: &str) -> Result<RpcResponse, IpaError> {
    serde_json::from_str(text).map_err(|e| {
        IpaError::InvalidResponse(format!(
            "{} - Response (first 200 chars): {}",
            e,
            text.chars().take(200).collect::<String>()
        ))
    })
}

/// Map a decoded reply to its `result`, or to the FreeIPA rejection it carries.
pub(crate) fn rpc_result(method: &str, reply: RpcResponse) -> Result<Value, IpaError> {
    if let Some(error) = reply.error {
        return Err(IpaError::Rejected {
            method: method.to_string(),
            code: error.code,
            name: error.name,
            message: error.message,
        });
    }
    reply
        .result
        .ok_or_else(|| IpaError::InvalidResponse(format!("{} returned neither result nor error", method)))
}

pub(crate) fn registration_step(added: Result<Value, IpaError>) -> Result<Registration, IpaError> {
    match added {
        Ok(_) => Ok(Registration::Added),
        Err(e) if e.is_duplicate() => Ok(Registration::RotatePassword),
        Err(e) => Err(e),
    }
}

pub(crate) fn delete_outcome(fqdn: &str, deleted: Result<Value, IpaError>) -> Result<DeleteOutcome, IpaError> {
    match deleted {
        Ok(_) => Ok(DeleteOutcome::Deleted),
        Err(e) if e.is_not_found() => {
            info!("Host {} already gone", fqdn);
            Ok(DeleteOutcome::NotFound)
        }
        Err(e) => Err(e),
    }
}

/// Read a `host_show` result. A missing host is a status, not an error.
pub(crate) fn host_status_from(fqdn: &str, shown: Result<Value, IpaError>) -> Result<HostStatus, IpaError> {
    match shown {
        Ok(value) => {
            let entry: HostEntry = serde_json::from_value(value.get("result").cloned().unwrap_or(Value::Null))
                .map_err(|e| IpaError::InvalidResponse(format!("host_show {}: {}", fqdn, e)))?;
            Ok(HostStatus {
                exists: true,
                has_keytab: entry.has_keytab,
            })
        }
        Err(e) if e.is_not_found() => Ok(HostStatus::default()),
        Err(e) => Err(e),
    }
}

/// Extract the session value from one `Set-Cookie` header.
fn session_from_cookie(header: &str) -> Option<String> {
    let pair = header.split(';').next()?.trim();
    let value = pair.strip_prefix(SESSION_COOKIE)?.strip_prefix('=')?;
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Try `attempt` against each endpoint in order until one succeeds.
///
/// Each attempt is bounded by `timeout`. Errors for which
/// [`IpaError::is_failover`] holds move on to the next endpoint; any other
/// error is returned immediately. Returns the value together with the
/// endpoint that produced it.
pub(crate) async fn with_failover<T, F, Fut>(
    endpoints: &[DirectoryEndpoint],
    timeout: Duration,
    mut attempt: F,
) -> Result<(T, DirectoryEndpoint), IpaError>
where
    F: FnMut(DirectoryEndpoint) -> Fut,
    Fut: Future<Output = Result<T, IpaError>>,
{
    if endpoints.is_empty() {
        return Err(IpaError::NoEndpoints);
    }

    let mut failures = Vec::new();
    for endpoint in endpoints {
        debug!("Attempting FreeIPA server {}", endpoint);
        match tokio::time::timeout(timeout, attempt(endpoint.clone())).await {
            Ok(Ok(value)) => return Ok((value, endpoint.clone())),
            Ok(Err(e)) if e.is_failover() => {
                warn!("Failed to reach FreeIPA server {}: {}", endpoint, e);
                failures.push(format!("{}: {}", endpoint, e));
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                let e = IpaError::Timeout(endpoint.to_string());
                warn!("{}", e);
                failures.push(e.to_string());
            }
        }
    }
    Err(IpaError::AllEndpointsFailed(failures))
}

#[async_trait::async_trait]
impl IpaClientTrait for IpaClient {
    async fn validate_connectivity(&self) -> Result<(), IpaError> {
        let endpoints = self.endpoints().await?;
        let (_, endpoint) = with_failover(&endpoints, self.settings.timeout, |ep| async move {
            self.rpc_on(&ep, "ping", Vec::new(), Map::new()).await
        })
        .await?;
        info!("FreeIPA connectivity validated against {}", endpoint.host);
        Ok(())
    }

    async fn add_host(&self, fqdn: &str, description: &str) -> Result<HostEnrollment, IpaError> {
        let endpoints = self.endpoints().await?;
        let otp = Otp::generate();
        let otp_ref = &otp;
        let (_, endpoint) = with_failover(&endpoints, self.settings.timeout, |ep| async move {
            self.register_on(&ep, fqdn, description, otp_ref).await
        })
        .await?;

        Ok(HostEnrollment {
            otp,
            server: endpoint.host,
        })
    }

    async fn delete_host(&self, fqdn: &str) -> Result<DeleteOutcome, IpaError> {
        let endpoints = self.endpoints().await?;
        info!("Deleting host: {}", fqdn);
        let result = with_failover(&endpoints, self.settings.timeout, |ep| async move {
            self.rpc_on(&ep, "host_del", vec![json!(fqdn)], Map::new()).await
        })
        .await;

        delete_outcome(fqdn, result.map(|(value, _)| value))
    }

    async fn has_keytab(&self, fqdn: &str) -> Result<bool, IpaError> {
        Ok(self.host_status(fqdn).await?.has_keytab)
    }

    async fn host_status(&self, fqdn: &str) -> Result<HostStatus, IpaError> {
        let endpoints = self.endpoints().await?;
        let result = with_failover(&endpoints, self.settings.timeout, |ep| async move {
            self.rpc_on(&ep, "host_show", vec![json!(fqdn)], Map::new()).await
        })
        .await;

        host_status_from(fqdn, result.map(|(value, _)| value))
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod client_test;
