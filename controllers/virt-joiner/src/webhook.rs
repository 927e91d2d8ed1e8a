//! HTTPS server for the mutating admission webhook.
//!
//! Routes:
//! - `POST /mutate`: AdmissionReview for VirtualMachine CREATE
//! - `GET /healthz`, `GET /readyz`: probes
//! - `GET /metrics`: Prometheus text format
//!
//! Each admission runs on its own task under the admission deadline. When the
//! deadline expires the request is denied, but the task is left to finish so
//! it never stops halfway through a registration; a host it registers for a
//! VM that is never persisted is removed by the lifecycle controller.

use crate::error::{ControllerError, MutationError};
use crate::metrics::Metrics;
use crate::mutator::{EnrollmentMutator, MutationOutcome};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_server::tls_rustls::RustlsConfig;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared handler state
pub struct WebhookState {
    pub mutator: Arc<EnrollmentMutator>,
    pub metrics: Metrics,
    pub admission_timeout: Duration,
}

/// PEM files for the serving certificate
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub cert_path: String,
    pub key_path: String,
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate", post(mutate_handler))
        .route("/healthz", get(probe_handler))
        .route("/readyz", get(probe_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the listener fails. Plain HTTP without TLS files, which is
/// only useful behind a TLS-terminating proxy or in development.
pub async fn serve(state: Arc<WebhookState>, addr: SocketAddr, tls: Option<TlsFiles>) -> Result<(), ControllerError> {
    let app = router(state);

    match tls {
        Some(files) => {
            let tls_config = RustlsConfig::from_pem_file(&files.cert_path, &files.key_path)
                .await
                .map_err(|e| ControllerError::Server(format!("TLS config error: {}", e)))?;
            info!(addr = %addr, cert = %files.cert_path, "Starting admission webhook (HTTPS)");
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await
                .map_err(|e| ControllerError::Server(e.to_string()))
        }
        None => {
            warn!(addr = %addr, "No TLS certificate configured, serving plain HTTP");
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| ControllerError::Server(format!("bind {}: {}", addr, e)))?;
            axum::serve(listener, app)
                .await
                .map_err(|e| ControllerError::Server(e.to_string()))
        }
    }
}

async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            state.metrics.admissions.with_label_values(&["invalid"]).inc();
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    Json(admit(&state, request).await.into_review())
}

/// Decide one admission request.
pub async fn admit(state: &WebhookState, request: AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let base = AdmissionResponse::from(&request);
    let uid = request.uid.clone();
    let mutator = state.mutator.clone();
    let task = tokio::spawn(async move { mutator.on_create(&request).await });

    let outcome = match tokio::time::timeout(state.admission_timeout, task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            error!(uid = %uid, error = %e, "Admission task failed");
            state.metrics.admissions.with_label_values(&["internal_error"]).inc();
            return base.deny(format!("enrollment failed: {}", e));
        }
        Err(_) => MutationOutcome::Deny(MutationError::Timeout(state.admission_timeout.as_secs())),
    };

    match outcome {
        MutationOutcome::Skip => {
            state.metrics.admissions.with_label_values(&["skipped"]).inc();
            base
        }
        MutationOutcome::Patch(patch) => {
            debug!(uid = %uid, operations = patch.0.len(), "Returning enrollment patch");
            match base.clone().with_patch(patch) {
                Ok(response) => {
                    state.metrics.admissions.with_label_values(&["patched"]).inc();
                    response
                }
                Err(e) => {
                    error!(uid = %uid, error = %e, "Failed to serialize patch");
                    state.metrics.admissions.with_label_values(&["internal_error"]).inc();
                    base.deny(format!("patch serialization error: {}", e))
                }
            }
        }
        MutationOutcome::Deny(reason) => {
            warn!(uid = %uid, error = %reason, "Denying VM admission");
            state.metrics.admissions.with_label_values(&[reason.metric_label()]).inc();
            base.deny(reason.to_string())
        }
    }
}

async fn probe_handler() -> &'static str {
    "ok"
}

async fn metrics_handler(State(state): State<Arc<WebhookState>>) -> Response {
    match state.metrics.render() {
        Ok(text) => text.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
