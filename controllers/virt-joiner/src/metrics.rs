//! Prometheus metrics served on `/metrics`.

use crate::error::ControllerError;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Controller metrics, registered in a private registry
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    /// Admission decisions by result (`patched`, `skipped` or a denial reason)
    pub admissions: IntCounterVec,
    pub enrollments_verified: IntCounter,
    pub verification_failures: IntCounter,
    /// Host deletions by result (`deleted`, `not_found`, `failed`, `orphan`)
    pub cleanups: IntCounterVec,
    pub tracked_records: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();
        let admissions = IntCounterVec::new(
            Opts::new("virt_joiner_admissions_total", "Admission requests handled, by result"),
            &["result"],
        )
        .map_err(metrics_error)?;
        let enrollments_verified = IntCounter::new(
            "virt_joiner_enrollments_verified_total",
            "Hosts whose keytab was found after enrollment",
        )
        .map_err(metrics_error)?;
        let verification_failures = IntCounter::new(
            "virt_joiner_verification_failures_total",
            "Enrollments that timed out waiting for a keytab",
        )
        .map_err(metrics_error)?;
        let cleanups = IntCounterVec::new(
            Opts::new("virt_joiner_cleanups_total", "Host deletion attempts, by result"),
            &["result"],
        )
        .map_err(metrics_error)?;
        let tracked_records = IntGauge::new("virt_joiner_tracked_records", "Enrollment records held in memory")
            .map_err(metrics_error)?;

        registry.register(Box::new(admissions.clone())).map_err(metrics_error)?;
        registry
            .register(Box::new(enrollments_verified.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(verification_failures.clone()))
            .map_err(metrics_error)?;
        registry.register(Box::new(cleanups.clone())).map_err(metrics_error)?;
        registry.register(Box::new(tracked_records.clone())).map_err(metrics_error)?;

        Ok(Self {
            registry,
            admissions,
            enrollments_verified,
            verification_failures,
            cleanups,
            tracked_records,
        })
    }

    /// Text exposition format
    pub fn render(&self) -> Result<String, ControllerError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| ControllerError::Server(format!("metrics encoding: {}", e)))
    }
}

fn metrics_error(e: prometheus::Error) -> ControllerError {
    ControllerError::Server(format!("metrics: {}", e))
}
