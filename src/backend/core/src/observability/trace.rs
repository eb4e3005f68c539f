//! Trace linkage for tasks and history events.
//!
//! A [`TraceLink`] records the trace and span active when a transition
//! happened, plus a URL into the trace viewer when a template is configured.

use opentelemetry::trace::TraceContextExt;
use serde::{Deserialize, Serialize};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// External observability identifiers attached to a task or event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceLink {
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_url: Option<String>,
}

impl TraceLink {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: None,
            trace_url: None,
        }
    }

    pub fn with_span(mut self, span_id: impl Into<String>) -> Self {
        self.span_id = Some(span_id.into());
        self
    }

    pub fn with_url(mut self, trace_url: impl Into<String>) -> Self {
        self.trace_url = Some(trace_url.into());
        self
    }

    /// Trace and span of the current `tracing` span, if OpenTelemetry is active.
    pub fn current() -> Option<Self> {
        let context = tracing::Span::current().context();
        let span = context.span();
        let span_ctx = span.span_context();

        if span_ctx.is_valid() {
            Some(Self::new(span_ctx.trace_id().to_string()).with_span(span_ctx.span_id().to_string()))
        } else {
            None
        }
    }
}

/// Builds trace links, rendering viewer URLs from a template.
///
/// The template may contain `{trace_id}` and `{span_id}` placeholders.
#[derive(Debug, Clone, Default)]
pub struct TraceLinker {
    url_template: Option<String>,
}

impl TraceLinker {
    pub fn new(url_template: Option<String>) -> Self {
        Self {
            url_template: url_template.filter(|t| !t.trim().is_empty()),
        }
    }

    /// Link for a caller-supplied trace id, or the current span otherwise.
    pub fn link(&self, explicit_trace_id: Option<&str>) -> Option<TraceLink> {
        let link = match explicit_trace_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(trace_id) => {
                let mut link = TraceLink::new(trace_id);
                link.span_id = TraceLink::current().and_then(|c| c.span_id);
                link
            }
            None => TraceLink::current()?,
        };
        Some(self.decorate(link))
    }

    /// Fill in the viewer URL if a template is set and none is present.
    pub fn decorate(&self, mut link: TraceLink) -> TraceLink {
        if link.trace_url.is_none() {
            if let Some(template) = &self.url_template {
                let url = template
                    .replace("{trace_id}", &link.trace_id)
                    .replace("{span_id}", link.span_id.as_deref().unwrap_or_default());
                link.trace_url = Some(url);
            }
        }
        link
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_trace_id_gets_url() {
        let linker = TraceLinker::new(Some("https://traces.local/trace/{trace_id}".into()));
        let link = linker.link(Some("abc123")).unwrap();
        assert_eq!(link.trace_id, "abc123");
        assert_eq!(link.trace_url.as_deref(), Some("https://traces.local/trace/abc123"));
    }

    #[test]
    fn test_no_active_span_and_no_id_yields_none() {
        let linker = TraceLinker::new(None);
        assert!(linker.link(None).is_none());
        assert!(linker.link(Some("   ")).is_none());
    }

    #[test]
    fn test_decorate_keeps_existing_url() {
        let linker = TraceLinker::new(Some("https://x/{trace_id}".into()));
        let link = linker.decorate(TraceLink::new("t").with_url("https://y/t"));
        assert_eq!(link.trace_url.as_deref(), Some("https://y/t"));
    }

    #[test]
    fn test_blank_template_is_ignored() {
        let linker = TraceLinker::new(Some("  ".into()));
        assert!(linker.link(Some("t")).unwrap().trace_url.is_none());
    }
}
