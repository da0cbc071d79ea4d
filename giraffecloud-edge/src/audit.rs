//! Audit sink consumed on handshakes, evictions, and control-plane
//! mutations. Failures are swallowed; auditing never fails a request.

use tracing::info;

pub struct AuditEvent {
    pub action: &'static str,
    pub user_id: i64,
    pub tunnel_id: i64,
    pub domain: String,
    pub detail: String,
}

impl AuditEvent {
    pub fn new(action: &'static str, user_id: i64, tunnel_id: i64, domain: &str) -> Self {
        Self {
            action,
            user_id,
            tunnel_id,
            domain: domain.to_string(),
            detail: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Default sink: structured log events under the `audit` target.
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, event: AuditEvent) {
        info!(
            target: "audit",
            action = event.action,
            user_id = event.user_id,
            tunnel_id = event.tunnel_id,
            domain = %event.domain,
            detail = %event.detail,
        );
    }
}
