//! Observability sink: the seam between the router's `ProxyInfo` rows and
//! whatever external store a deployment wants to persist them to.
//!
//! The core only defines the trait and ships the reference `tracing`-backed
//! implementation; a real database-backed sink is a collaborator outside
//! this crate (§4.H).

use async_trait::async_trait;
use tracing::info;

use crate::session::ProxyInfo;

/// Persists one terminal request's `ProxyInfo` row. Implementations must not
/// propagate errors back into the request path — a failed log write is
/// logged and swallowed by the caller, never surfaced to the client.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn record(&self, info: &ProxyInfo);
}

/// Reference sink: logs the row at `info` level instead of writing to an
/// external store. Stands in for the real persistence collaborator in the
/// binary shipped from this crate.
#[derive(Debug, Default)]
pub struct TracingLogSink;

#[async_trait]
impl LogSink for TracingLogSink {
    async fn record(&self, info: &ProxyInfo) {
        info!(
            session_id = %info.session_id,
            server_key = %info.server_key,
            request_method = %info.request_method,
            cost_time_ms = ?info.cost_time_ms,
            "tool call completed"
        );
    }
}

/// Apply the §4.H/§8 log-gating rule: only `tools/call` requests are logged,
/// and only when the operator has `app.save_log = true`.
pub fn should_log(save_log: bool, request_method: &str) -> bool {
    save_log && request_method == crate::protocol::methods::TOOLS_CALL
}

/// Log `info` through `sink` iff gating allows it. Swallows sink failures by
/// construction — `LogSink::record` has no error path.
pub async fn maybe_record(sink: &dyn LogSink, save_log: bool, info: &ProxyInfo) {
    if should_log(save_log, &info.request_method) {
        sink.record(info).await;
    }
}
