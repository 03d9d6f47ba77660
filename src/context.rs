//! Pagination/continuation state threaded through one logical query.
//!
//! A [`QueryContext`] is created by the caller (or defaulted) before the
//! first call and refreshed in place from every reply that carries updated
//! server state. One context instance spans an entire continuation sequence.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Output shape requested from the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputFormat {
    /// Server-native result objects.
    #[default]
    Default,
    /// Plain JSON rows.
    Json,
    /// d3-friendly tree structure.
    D3,
}

/// Pagination, timeout, and cumulative-progress state for one logical query.
///
/// Field names on the wire are camelCase (`nextIndex`, `pageSize`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryContext {
    /// Opaque continuation cursor. `None` until the server reports one.
    pub next_index: Option<JsonValue>,
    /// Number of items requested per page.
    pub page_size: u32,
    /// Cap on cumulative results across the whole continuation sequence.
    pub max_size: u32,
    /// Per-request timeout enforced by the correlation table, re-armed on
    /// every progress event.
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,
    /// Whether the caller wants automatic continuation.
    pub continuous: bool,
    /// Requested output shape.
    pub format: OutputFormat,
    /// Server reported that no further results exist.
    pub exhausted: bool,
    /// Running total of items received so far.
    pub cumulative: u32,
    /// Last server-reported round-trip latency in milliseconds.
    #[serde(rename = "elapsed")]
    pub elapsed_ms: u64,
    /// The query timed out server-side at least once.
    pub expired: bool,
}

impl Default for QueryContext {
    fn default() -> Self {
        Self {
            next_index: None,
            page_size: 100,
            max_size: 5000,
            timeout_ms: 3000,
            continuous: false,
            format: OutputFormat::Default,
            exhausted: false,
            cumulative: 0,
            elapsed_ms: 0,
            expired: false,
        }
    }
}

impl QueryContext {
    /// Create a context with the documented defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the page size.
    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size;
        self
    }

    /// Set the cumulative result cap.
    pub fn with_max_size(mut self, size: u32) -> Self {
        self.max_size = size;
        self
    }

    /// Set the per-request timeout in milliseconds.
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    /// Request automatic continuation across pages.
    pub fn with_continuous(mut self, enabled: bool) -> Self {
        self.continuous = enabled;
        self
    }

    /// Set the requested output shape.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// True iff the server should keep pushing pages for this query.
    pub fn should_continue(&self) -> bool {
        self.continuous
            && self.next_index.is_some()
            && !self.expired
            && !self.exhausted
            && self.cumulative < self.max_size
    }

    /// Apply all server-reported fields atomically.
    ///
    /// Fields absent in `update` reset to their type's neutral default
    /// (`None`/`0`/`false`) rather than keeping the previous value, so stale
    /// continuation state can never survive an omitted field. The
    /// client-owned `timeout` and `format` fields are kept unless the server
    /// sends replacements.
    pub fn refresh(&mut self, update: &ContextUpdate) {
        self.next_index = update.next_index.clone();
        self.exhausted = update.exhausted.unwrap_or(false);
        self.cumulative = update.cumulative.unwrap_or(0);
        self.elapsed_ms = update.elapsed.unwrap_or(0);
        self.expired = update.expired.unwrap_or(false);
        if let Some(timeout) = update.timeout {
            self.timeout_ms = timeout;
        }
        if let Some(format) = update.format {
            self.format = format;
        }
    }
}

/// Wire shape of the `q` object embedded in server replies.
///
/// All fields are optional so [`QueryContext::refresh`] can distinguish
/// "absent" from an explicit value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextUpdate {
    pub next_index: Option<JsonValue>,
    pub exhausted: Option<bool>,
    pub cumulative: Option<u32>,
    pub elapsed: Option<u64>,
    pub expired: Option<bool>,
    pub timeout: Option<u64>,
    pub format: Option<OutputFormat>,
}

impl From<&QueryContext> for ContextUpdate {
    fn from(ctx: &QueryContext) -> Self {
        Self {
            next_index: ctx.next_index.clone(),
            exhausted: Some(ctx.exhausted),
            cumulative: Some(ctx.cumulative),
            elapsed: Some(ctx.elapsed_ms),
            expired: Some(ctx.expired),
            timeout: Some(ctx.timeout_ms),
            format: Some(ctx.format),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let ctx = QueryContext::new();
        assert_eq!(ctx.page_size, 100);
        assert_eq!(ctx.max_size, 5000);
        assert_eq!(ctx.timeout_ms, 3000);
        assert!(!ctx.continuous);
        assert_eq!(ctx.format, OutputFormat::Default);
        assert!(ctx.next_index.is_none());
        assert_eq!(ctx.cumulative, 0);
    }

    #[test]
    fn test_should_continue_requires_all_conditions() {
        let mut ctx = QueryContext::new().with_continuous(true);
        assert!(!ctx.should_continue(), "no cursor yet");

        ctx.next_index = Some(json!(42));
        assert!(ctx.should_continue());

        ctx.exhausted = true;
        assert!(!ctx.should_continue());
        ctx.exhausted = false;

        ctx.expired = true;
        assert!(!ctx.should_continue());
        ctx.expired = false;

        ctx.continuous = false;
        assert!(!ctx.should_continue());
    }

    #[test]
    fn test_should_continue_false_at_max_size_even_with_cursor() {
        let mut ctx = QueryContext::new()
            .with_continuous(true)
            .with_max_size(300);
        ctx.next_index = Some(json!("page-4"));
        ctx.cumulative = 300;
        assert!(!ctx.should_continue());
        ctx.cumulative = 299;
        assert!(ctx.should_continue());
    }

    #[test]
    fn test_refresh_applies_server_fields() {
        let mut ctx = QueryContext::new().with_continuous(true);
        let update = ContextUpdate {
            next_index: Some(json!(7)),
            exhausted: Some(false),
            cumulative: Some(100),
            elapsed: Some(12),
            expired: Some(false),
            ..Default::default()
        };
        ctx.refresh(&update);
        assert_eq!(ctx.next_index, Some(json!(7)));
        assert_eq!(ctx.cumulative, 100);
        assert_eq!(ctx.elapsed_ms, 12);
    }

    #[test]
    fn test_refresh_resets_absent_fields_to_neutral() {
        let mut ctx = QueryContext::new();
        ctx.next_index = Some(json!(9));
        ctx.cumulative = 500;
        ctx.exhausted = true;
        ctx.expired = true;

        ctx.refresh(&ContextUpdate::default());
        assert!(ctx.next_index.is_none());
        assert_eq!(ctx.cumulative, 0);
        assert!(!ctx.exhausted);
        assert!(!ctx.expired);
        // client-owned fields survive
        assert_eq!(ctx.timeout_ms, 3000);
    }

    #[test]
    fn test_refresh_with_own_state_is_idempotent() {
        let mut ctx = QueryContext::new().with_continuous(true);
        ctx.next_index = Some(json!([1, 2]));
        ctx.cumulative = 250;
        ctx.elapsed_ms = 8;

        let snapshot = ctx.clone();
        let update = ContextUpdate::from(&snapshot);
        ctx.refresh(&update);
        assert_eq!(ctx, snapshot);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut ctx = QueryContext::new();
        ctx.next_index = Some(json!("cursor"));
        let mut branch = ctx.clone();
        branch.next_index = Some(json!("other"));
        branch.cumulative = 10;
        assert_eq!(ctx.next_index, Some(json!("cursor")));
        assert_eq!(ctx.cumulative, 0);
    }

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let mut ctx = QueryContext::new().with_page_size(10);
        ctx.next_index = Some(json!(3));
        let v = serde_json::to_value(&ctx).unwrap();
        assert_eq!(v["pageSize"], json!(10));
        assert_eq!(v["nextIndex"], json!(3));
        assert_eq!(v["maxSize"], json!(5000));
        assert_eq!(v["timeout"], json!(3000));
        assert_eq!(v["format"], json!("DEFAULT"));
        assert_eq!(v["cumulative"], json!(0));
    }

    #[test]
    fn test_context_update_parses_partial_payload() {
        let update: ContextUpdate =
            serde_json::from_value(json!({ "cumulative": 42, "exhausted": true })).unwrap();
        assert_eq!(update.cumulative, Some(42));
        assert_eq!(update.exhausted, Some(true));
        assert!(update.next_index.is_none());
        assert!(update.elapsed.is_none());
    }
}
