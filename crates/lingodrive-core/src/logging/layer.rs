//! `tracing` layer that mirrors events into the instance's JSONL file

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Number, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use super::entry::LogRecord;
use super::writer::InstanceLogWriter;

/// Writes every event it sees as a [`LogRecord`].
#[derive(Debug, Clone)]
pub struct JsonlLayer {
    writer: Arc<InstanceLogWriter>,
}

impl JsonlLayer {
    pub fn new(logs_dir: impl Into<PathBuf>, instance: impl Into<String>) -> std::io::Result<Self> {
        Ok(Self {
            writer: Arc::new(InstanceLogWriter::open(logs_dir.into(), instance)?),
        })
    }

    pub fn log_path(&self) -> &std::path::Path {
        self.writer.path()
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let mut record = LogRecord::now(
            metadata.level().as_str().to_lowercase(),
            self.writer.instance(),
            metadata.target(),
            fields.message.unwrap_or_default(),
        );
        if !fields.values.is_empty() {
            record = record.with_fields(Value::Object(fields.values));
        }
        if let Some(scope) = ctx.event_scope(event) {
            let spans: Vec<&str> = scope.from_root().map(|span| span.name()).collect();
            if !spans.is_empty() {
                record = record.with_span(spans.join(" > "));
            }
        }

        // Logging must never take the node down.
        let _ = self.writer.append(&record);
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    values: Map<String, Value>,
}

impl FieldCollector {
    fn put(&mut self, field: &Field, value: Value) {
        self.values.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut text = String::new();
        let _ = write!(text, "{:?}", value);
        if field.name() == "message" {
            self.message = Some(text);
        } else {
            self.put(field, Value::String(text));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.put(field, Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = Number::from_f64(value) {
            self.put(field, Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, Value::String(value.to_string()));
    }
}

/// Installs the global subscriber: console output plus optional JSONL.
#[derive(Debug, Clone)]
pub struct LoggingBuilder {
    filter: String,
    jsonl: Option<(PathBuf, String)>,
    console: bool,
}

impl LoggingBuilder {
    /// Start from an `EnvFilter` directive; `RUST_LOG` overrides it at init.
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            jsonl: None,
            console: true,
        }
    }

    /// Also write `logs_dir/raw/<date>_<instance>.jsonl`.
    pub fn with_jsonl(mut self, logs_dir: impl Into<PathBuf>, instance: impl Into<String>) -> Self {
        self.jsonl = Some((logs_dir.into(), instance.into()));
        self
    }

    pub fn no_console(mut self) -> Self {
        self.console = false;
        self
    }

    /// Install the subscriber. Returns the JSONL path when enabled.
    ///
    /// Fails if a global subscriber is already set.
    pub fn init(self) -> std::io::Result<Option<PathBuf>> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.filter));

        let jsonl = match &self.jsonl {
            Some((dir, instance)) => Some(JsonlLayer::new(dir.clone(), instance.clone())?),
            None => None,
        };
        let path = jsonl.as_ref().map(|layer| layer.log_path().to_path_buf());

        let console = self
            .console
            .then(|| {
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
            });

        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .with(jsonl)
            .try_init()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::AlreadyExists, e.to_string()))?;
        Ok(path)
    }
}
