use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use std::collections::HashMap;
use std::fmt::{self as stdfmt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::OnceLock;
use tracing::field::{Field, Visit};
use tracing::Event;
use tracing::Subscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::{
    self as fmt_subscriber, format::Writer, FmtContext, FormatEvent, FormatFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const SERVICE_NAME: &str = "refresher";
const LEADING_FIELDS: [&str; 3] = ["queue", "delivery_tag", "attempt"];

pub fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("refresher=info,info"));

    let stdout = std::io::stdout;
    let stderr = std::io::stderr;

    let writer = stdout
        .with_max_level(tracing::Level::INFO)
        .or_else(stderr.with_min_level(tracing::Level::WARN));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(false)
        .with_ansi(false)
        .event_format(KeyValueFormatter::new())
        .fmt_fields(fmt_subscriber::format::DefaultFields::new())
        .with_writer(writer)
        .try_init()
        .map_err(|err| crate::err!("failed to initialise tracing subscriber: {err}"))
}

/// Renders each event as a single `key=value` line.
struct KeyValueFormatter {
    service_name: &'static str,
}

impl KeyValueFormatter {
    const fn new() -> Self {
        Self {
            service_name: SERVICE_NAME,
        }
    }
}

impl<S, N> FormatEvent<S, N> for KeyValueFormatter
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> stdfmt::Result {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let metadata = event.metadata();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut fields = visitor.fields;
        let event_name = take_field(&mut fields, "event");
        let message = visitor
            .message
            .take()
            .or(event_name)
            .unwrap_or_else(|| metadata.name().to_string());

        let mut line = String::new();
        push_field(&mut line, "ts", &timestamp);
        push_field(&mut line, "level", metadata.level().as_str());
        push_field(&mut line, "service", self.service_name);
        push_field(&mut line, "component", metadata.target());

        if let Some(span_path) = current_span_path(ctx) {
            push_field(&mut line, "span", &span_path);
        }

        push_field(&mut line, "msg", &message);

        // Queue identity first, then the rest alphabetically.
        for key in LEADING_FIELDS {
            if let Some(value) = take_field(&mut fields, key) {
                push_field(&mut line, key, &value);
            }
        }

        fields.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));
        for (key, value) in fields {
            push_field(&mut line, &key, &value);
        }

        writer.write_str(&line)?;
        writer.write_char('\n')
    }
}

fn take_field(fields: &mut Vec<(String, String)>, key: &str) -> Option<String> {
    let position = fields.iter().position(|(name, _)| name == key)?;
    Some(fields.remove(position).1)
}

fn current_span_path<S, N>(ctx: &FmtContext<'_, S, N>) -> Option<String>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    let span = ctx.lookup_current()?;
    let names: Vec<&str> = span.scope().from_root().map(|s| s.name()).collect();
    if names.is_empty() {
        None
    } else {
        Some(names.join("."))
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl FieldVisitor {
    fn record_field(&mut self, field: &Field, value: String) {
        if field.name().is_empty() {
            return;
        }
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_field(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn stdfmt::Debug) {
        self.record_field(field, format!("{value:?}"));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_field(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_field(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_field(field, value.to_string());
    }
}

fn encode_field_value(value: &str) -> String {
    let needs_quotes = value.chars().any(|c| {
        c.is_whitespace()
            || matches!(
                c,
                '"' | '\\' | '=' | '[' | ']' | '{' | '}' | ',' | '\n' | '\r' | '\t'
            )
    });

    if !needs_quotes {
        return value.to_string();
    }

    let mut encoded = String::with_capacity(value.len() + 2);
    encoded.push('"');
    for ch in value.chars() {
        match ch {
            '"' => encoded.push_str("\\\""),
            '\\' => encoded.push_str("\\\\"),
            '\n' => encoded.push_str("\\n"),
            '\r' => encoded.push_str("\\r"),
            '\t' => encoded.push_str("\\t"),
            _ => encoded.push(ch),
        }
    }
    encoded.push('"');
    encoded
}

fn push_field(buffer: &mut String, key: &str, value: &str) {
    if !buffer.is_empty() {
        buffer.push(' ');
    }
    buffer.push_str(key);
    buffer.push('=');
    buffer.push_str(&encode_field_value(value));
}

/// Process-wide counters for the queue lifecycle.
#[derive(Default)]
pub struct RuntimeCounters {
    published: AtomicU64,
    publish_failures: AtomicU64,
    dedup_rejected: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    leaked: AtomicU64,
    dropped: AtomicU64,
    reconnects: AtomicU64,
    inflight: InflightRegistry,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeCountersSnapshot {
    pub published: u64,
    pub publish_failures: u64,
    pub dedup_rejected: u64,
    pub acked: u64,
    pub retried: u64,
    pub failed: u64,
    pub leaked: u64,
    pub dropped: u64,
    pub reconnects: u64,
    pub inflight: Vec<QueueInflightSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueInflightSnapshot {
    pub queue: String,
    pub inflight: u64,
}

#[derive(Default)]
struct InflightRegistry {
    queues: Mutex<HashMap<String, u64>>,
}

impl InflightRegistry {
    fn add(&self, queue: &str, count: u64) {
        let mut guard = self.queues.lock().expect("inflight registry lock poisoned");
        *guard.entry(queue.to_string()).or_insert(0) += count;
    }

    fn sub(&self, queue: &str, count: u64) {
        let mut guard = self.queues.lock().expect("inflight registry lock poisoned");
        if let Some(current) = guard.get_mut(queue) {
            *current = current.saturating_sub(count);
        }
    }

    fn snapshot(&self) -> Vec<QueueInflightSnapshot> {
        let guard = self.queues.lock().expect("inflight registry lock poisoned");
        let mut entries: Vec<_> = guard
            .iter()
            .map(|(queue, inflight)| QueueInflightSnapshot {
                queue: queue.clone(),
                inflight: *inflight,
            })
            .collect();
        entries.sort_by(|lhs, rhs| lhs.queue.cmp(&rhs.queue));
        entries
    }
}

static RUNTIME_COUNTERS: OnceLock<RuntimeCounters> = OnceLock::new();

pub fn runtime_counters() -> &'static RuntimeCounters {
    RUNTIME_COUNTERS.get_or_init(RuntimeCounters::default)
}

impl RuntimeCounters {
    pub fn inc_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dedup_rejected(&self) {
        self.dedup_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_leaked(&self) {
        self.leaked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_inflight(&self, queue: &str, count: u64) {
        self.inflight.add(queue, count);
    }

    pub fn sub_inflight(&self, queue: &str, count: u64) {
        self.inflight.sub(queue, count);
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        RuntimeCountersSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            dedup_rejected: self.dedup_rejected.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            leaked: self.leaked.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            inflight: self.inflight.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_values_with_spaces_are_quoted() {
        assert_eq!(encode_field_value("plain"), "plain");
        assert_eq!(encode_field_value("two words"), "\"two words\"");
        assert_eq!(encode_field_value("a\"b"), "\"a\\\"b\"");
    }

    #[test]
    fn leading_fields_are_taken_once() {
        let mut fields = vec![
            ("error".to_string(), "closed".to_string()),
            ("queue".to_string(), "app".to_string()),
        ];
        assert_eq!(take_field(&mut fields, "queue").as_deref(), Some("app"));
        assert_eq!(take_field(&mut fields, "queue"), None);
        assert_eq!(fields.len(), 1);
    }

    #[test]
    fn inflight_never_underflows() {
        let counters = RuntimeCounters::default();
        counters.add_inflight("apps", 2);
        counters.sub_inflight("apps", 5);
        counters.sub_inflight("unknown", 1);

        let snapshot = counters.snapshot();
        assert_eq!(
            snapshot.inflight,
            vec![QueueInflightSnapshot {
                queue: "apps".to_string(),
                inflight: 0,
            }]
        );
    }
}
