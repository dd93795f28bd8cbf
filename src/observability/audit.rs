/// Security event logging for bintrace
/// Structured events are serialized to JSON and routed through `log` under the
/// `bintrace::audit` target, so the host's logger decides where they land
use crate::core::types::KillReport;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const AUDIT_TARGET: &str = "bintrace::audit";

/// Security event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecuritySeverity {
    Critical,
    High,
    Medium,
    Low,
}

/// Types of security events we track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityEventType {
    // Admission
    ValidationRejected,

    // Lifecycle events
    ExecutionStart,
    ExecutionEnd,
    WallTimeLimitViolation,
    TraceTruncated,

    // Control events
    ControlDegraded,

    // Cleanup events
    CleanupFailure,
}

impl SecurityEventType {
    /// Get the default severity for this event type
    pub fn default_severity(&self) -> SecuritySeverity {
        match self {
            SecurityEventType::ValidationRejected => SecuritySeverity::Medium,
            SecurityEventType::ExecutionStart => SecuritySeverity::Low,
            SecurityEventType::ExecutionEnd => SecuritySeverity::Low,
            SecurityEventType::WallTimeLimitViolation => SecuritySeverity::High,
            SecurityEventType::TraceTruncated => SecuritySeverity::Medium,
            SecurityEventType::ControlDegraded => SecuritySeverity::High,
            SecurityEventType::CleanupFailure => SecuritySeverity::Critical,
        }
    }
}

/// Correlation identifiers for one execution attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationIds {
    pub run_id: String,
    /// Proxy PID in the host namespace
    pub root_pid: Option<i32>,
}

impl CorrelationIds {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            root_pid: None,
        }
    }

    pub fn with_root_pid(mut self, pid: i32) -> Self {
        self.root_pid = Some(pid);
        self
    }
}

impl Default for CorrelationIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Individual security event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_type: SecurityEventType,
    pub severity: SecuritySeverity,
    pub timestamp: DateTime<Utc>,
    pub details: String,
    pub correlation: Option<CorrelationIds>,
    pub file_path: Option<String>,
}

impl SecurityEvent {
    /// Create a new security event with default severity
    pub fn new(event_type: SecurityEventType, details: String) -> Self {
        Self {
            severity: event_type.default_severity(),
            event_type,
            timestamp: Utc::now(),
            details,
            correlation: None,
            file_path: None,
        }
    }

    pub fn with_correlation(mut self, correlation: CorrelationIds) -> Self {
        self.correlation = Some(correlation);
        self
    }

    pub fn with_file_path(mut self, file_path: String) -> Self {
        self.file_path = Some(file_path);
        self
    }

    pub fn with_severity(mut self, severity: SecuritySeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Audit record as emitted on the audit target
    pub fn to_json(&self) -> serde_json::Value {
        let mut entry = serde_json::json!({
            "timestamp": self.timestamp.to_rfc3339(),
            "event_type": self.event_type,
            "severity": self.severity,
            "details": self.details,
            "process_id": std::process::id(),
        });

        if let Some(correlation) = &self.correlation {
            entry["correlation"] = serde_json::json!({
                "run_id": correlation.run_id,
                "root_pid": correlation.root_pid,
            });
        }
        if let Some(file_path) = &self.file_path {
            entry["file_path"] = serde_json::json!(file_path);
        }
        entry
    }
}

/// Log a security event at the level matching its severity
pub fn log_security_event(event: SecurityEvent) {
    let entry = event.to_json();
    match event.severity {
        SecuritySeverity::Critical | SecuritySeverity::High => {
            error!(target: AUDIT_TARGET, "{}", entry)
        }
        SecuritySeverity::Medium => warn!(target: AUDIT_TARGET, "{}", entry),
        SecuritySeverity::Low => info!(target: AUDIT_TARGET, "{}", entry),
    }
}

/// Convenience functions for common security events
pub mod events {
    use super::*;

    pub fn validation_rejected(reason: String) {
        log_security_event(SecurityEvent::new(
            SecurityEventType::ValidationRejected,
            format!("Binary rejected: {}", reason),
        ));
    }

    pub fn execution_start(correlation: &CorrelationIds, mode: &str) {
        let event = SecurityEvent::new(
            SecurityEventType::ExecutionStart,
            format!("Execution started: run_id={}, mode={}", correlation.run_id, mode),
        )
        .with_correlation(correlation.clone());
        log_security_event(event);
    }

    pub fn execution_end(correlation: &CorrelationIds, exit_code: i32, runtime_ms: u64) {
        let event = SecurityEvent::new(
            SecurityEventType::ExecutionEnd,
            format!(
                "Execution ended: run_id={}, exit_code={}, runtime_ms={}",
                correlation.run_id, exit_code, runtime_ms
            ),
        )
        .with_correlation(correlation.clone());
        log_security_event(event);
    }

    pub fn execution_timeout(
        correlation: &CorrelationIds,
        limit_ms: u64,
        kill_report: Option<&KillReport>,
    ) {
        log_security_event(timeout_event(correlation, limit_ms, kill_report));
    }

    /// A kill that missed part of the process group may have left tasks behind.
    pub(crate) fn timeout_event(
        correlation: &CorrelationIds,
        limit_ms: u64,
        kill_report: Option<&KillReport>,
    ) -> SecurityEvent {
        let mut details = format!("Wall time limit of {}ms exceeded, process tree killed", limit_ms);
        if let Some(report) = kill_report {
            details.push_str(&format!(" ({})", report.summary()));
        }
        let event = SecurityEvent::new(SecurityEventType::WallTimeLimitViolation, details)
            .with_correlation(correlation.clone());
        match kill_report {
            Some(report) if !report.reached_group() => event.with_severity(SecuritySeverity::Critical),
            _ => event,
        }
    }

    pub fn control_degraded(control_name: String, reason: String) {
        log_security_event(SecurityEvent::new(
            SecurityEventType::ControlDegraded,
            format!("Control degraded: {} - {}", control_name, reason),
        ));
    }

    pub fn trace_truncated(root_pid: i32, events_recorded: u64) {
        log_security_event(SecurityEvent::new(
            SecurityEventType::TraceTruncated,
            format!(
                "Lost control of traced pid {} after {} events",
                root_pid, events_recorded
            ),
        ));
    }

    pub fn cleanup_failure(path: String, error: String) {
        let event = SecurityEvent::new(
            SecurityEventType::CleanupFailure,
            format!("Cleanup failed: {}", error),
        )
        .with_file_path(path);
        log_security_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_ids_creation() {
        let correlation = CorrelationIds::new();
        assert!(correlation.root_pid.is_none());
        assert_eq!(correlation.run_id.len(), 36);
        assert_ne!(correlation.run_id, CorrelationIds::new().run_id);
        assert_eq!(correlation.with_root_pid(1234).root_pid, Some(1234));
    }

    #[test]
    fn test_event_type_severity() {
        assert_eq!(
            SecurityEventType::ExecutionStart.default_severity(),
            SecuritySeverity::Low
        );
        assert_eq!(
            SecurityEventType::CleanupFailure.default_severity(),
            SecuritySeverity::Critical
        );
        assert_eq!(
            SecurityEventType::ControlDegraded.default_severity(),
            SecuritySeverity::High
        );
    }

    #[test]
    fn test_event_json_shape() {
        let event = SecurityEvent::new(
            SecurityEventType::CleanupFailure,
            "Cleanup failed: busy".to_string(),
        )
        .with_correlation(CorrelationIds::new().with_root_pid(7))
        .with_file_path("/tmp/x".to_string());

        let json = event.to_json();
        assert_eq!(json["event_type"], "CleanupFailure");
        assert_eq!(json["severity"], "Critical");
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
        assert_eq!(json["correlation"]["root_pid"], 7);
        assert_eq!(json["file_path"], "/tmp/x");
    }

    #[test]
    fn test_event_helpers_do_not_panic_without_logger() {
        let correlation = CorrelationIds::new();
        events::execution_start(&correlation, "direct");
        events::execution_end(&correlation, 0, 12);
        events::control_degraded("resource_governor".to_string(), "test".to_string());
    }

    #[test]
    fn test_timeout_event_carries_escalation() {
        let correlation = CorrelationIds::new();
        let mut report = KillReport {
            group_signals: vec!["SIGTERM".to_string(), "SIGKILL".to_string()],
            fallbacks: Vec::new(),
            escalation_ms: 50,
        };

        let event = events::timeout_event(&correlation, 1000, Some(&report));
        assert_eq!(event.severity, SecuritySeverity::High);
        assert!(event.details.contains("1000ms"));
        assert!(event.details.contains("[SIGTERM, SIGKILL]"));

        report.fallbacks.push("SIGKILL: ESRCH".to_string());
        let event = events::timeout_event(&correlation, 1000, Some(&report));
        assert_eq!(event.severity, SecuritySeverity::Critical);

        let event = events::timeout_event(&correlation, 1000, None);
        assert_eq!(event.severity, SecuritySeverity::High);
    }

}
