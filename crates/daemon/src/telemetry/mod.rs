//! Audit, metrics and notification sinks.

pub mod audit;
pub mod metrics;
pub mod notify;

pub use audit::{
    AuditEvent, AuditLog, AuditOutcome, AuditSink, JsonlAuditSink, MemoryAuditSink,
    TracingAuditSink,
};
pub use metrics::{Metrics, MetricsSnapshot};
pub use notify::{LogNotifier, Notification, Notifier, NotifyError};
