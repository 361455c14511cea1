use crate::config::{LogFormat, LogOutputType, LoggingConfig};
use crate::error::ProxyError;
use chrono::{SecondsFormat, Utc};
use log::kv::{self, Key, VisitSource};
use log::{Level, LevelFilter, Record};
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

struct Sink {
    level: LevelFilter,
    writer: Mutex<BufWriter<Box<dyn Write + Send>>>,
}

/// `log` backend writing one JSON object or text line per record to each
/// configured sink. Structured fields travel as `log` key-values.
pub struct CustomLogger {
    level: LevelFilter,
    format: LogFormat,
    sinks: Vec<Sink>,
}

impl CustomLogger {
    pub fn new(config: &LoggingConfig) -> Result<Self, ProxyError> {
        let level = config.level.to_level_filter();
        let mut sinks = Vec::new();

        for target in &config.targets {
            let writer: Box<dyn Write + Send> = match target.output_type {
                LogOutputType::Stdout => Box::new(std::io::stdout()),
                LogOutputType::File => {
                    let path = target.path.as_ref().ok_or_else(|| {
                        ProxyError::Config("file log target requires a path".to_string())
                    })?;
                    Box::new(OpenOptions::new().create(true).append(true).open(path)?)
                }
            };
            let sink_level = target.level.map_or(level, |l| l.to_level_filter().min(level));
            sinks.push(Sink {
                level: sink_level,
                writer: Mutex::new(BufWriter::new(writer)),
            });
        }

        if sinks.is_empty() {
            sinks.push(Sink {
                level,
                writer: Mutex::new(BufWriter::new(Box::new(std::io::stdout()))),
            });
        }

        Ok(Self {
            level,
            format: config.format,
            sinks,
        })
    }

    /// Logger with a single sink, at the configured level.
    pub fn with_writer(config: &LoggingConfig, writer: Box<dyn Write + Send>) -> Self {
        let level = config.level.to_level_filter();
        Self {
            level,
            format: config.format,
            sinks: vec![Sink {
                level,
                writer: Mutex::new(BufWriter::new(writer)),
            }],
        }
    }

    /// Writes `message` with `fields` at `level`, subject to the same
    /// filtering as records arriving through the facade.
    pub fn emit(&self, level: Level, message: &str, fields: &[(&str, kv::Value<'_>)]) {
        log::Log::log(
            self,
            &Record::builder()
                .level(level)
                .target(module_path!())
                .args(format_args!("{}", message))
                .key_values(&fields)
                .build(),
        );
    }
}

impl log::Log for CustomLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = render(self.format, record);
        for sink in self.sinks.iter().filter(|s| record.level() <= s.level) {
            if let Ok(mut writer) = sink.writer.lock() {
                let _ = writeln!(writer, "{}", line);
                let _ = writer.flush();
            }
        }
    }

    fn flush(&self) {
        for sink in &self.sinks {
            if let Ok(mut writer) = sink.writer.lock() {
                let _ = writer.flush();
            }
        }
    }
}

/// Installs the process-wide logger. With `RUST_LOG` set, env_logger takes
/// over filtering but lines keep the configured format.
pub fn init(config: &LoggingConfig) -> Result<(), ProxyError> {
    if std::env::var_os("RUST_LOG").is_some() {
        return init_fallback(config);
    }

    let logger = CustomLogger::new(config)?;
    log::set_boxed_logger(Box::new(logger))
        .map_err(|e| ProxyError::Config(format!("failed to install logger: {}", e)))?;
    log::set_max_level(config.level.to_level_filter());
    Ok(())
}

fn init_fallback(config: &LoggingConfig) -> Result<(), ProxyError> {
    let format = config.format;
    let default_level = config.level.to_string();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format(move |buf, record| writeln!(buf, "{}", render(format, record)))
        .try_init()
        .map_err(|e| ProxyError::Config(format!("failed to install logger: {}", e)))
}

pub fn render(format: LogFormat, record: &Record) -> String {
    let mut fields = FieldCollector::default();
    let _ = record.key_values().visit(&mut fields);
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

    match format {
        LogFormat::Json => render_json(&timestamp, record, fields.0),
        LogFormat::Text => render_text(&timestamp, record, &fields.0),
    }
}

fn render_json(timestamp: &str, record: &Record, fields: Map<String, Value>) -> String {
    let mut entry = Map::new();
    entry.insert("timestamp".to_string(), Value::from(timestamp));
    entry.insert("level".to_string(), Value::from(record.level().as_str()));
    entry.insert("message".to_string(), Value::from(record.args().to_string()));
    if !fields.is_empty() {
        entry.insert("fields".to_string(), Value::Object(fields));
    }
    Value::Object(entry).to_string()
}

fn render_text(timestamp: &str, record: &Record, fields: &Map<String, Value>) -> String {
    let mut line = format!("[{}] {} {}", timestamp, record.level().as_str(), record.args());
    for (key, value) in fields {
        line.push(' ');
        line.push_str(key);
        line.push('=');
        match value {
            Value::String(s) if s.is_empty() || s.contains([' ', '=', '"']) => {
                line.push_str(&format!("{:?}", s))
            }
            Value::String(s) => line.push_str(s),
            other => line.push_str(&other.to_string()),
        }
    }
    line
}

#[derive(Default)]
struct FieldCollector(Map<String, Value>);

impl<'kvs> VisitSource<'kvs> for FieldCollector {
    fn visit_pair(&mut self, key: Key<'kvs>, value: kv::Value<'kvs>) -> Result<(), kv::Error> {
        self.0.insert(key.as_str().to_string(), field_value(&value));
        Ok(())
    }
}

fn field_value(value: &kv::Value<'_>) -> Value {
    if let Some(b) = value.to_bool() {
        Value::Bool(b)
    } else if let Some(i) = value.to_i64() {
        Value::from(i)
    } else if let Some(u) = value.to_u64() {
        Value::from(u)
    } else if let Some(f) = value.to_f64() {
        Value::from(f)
    } else if let Some(s) = value.to_borrowed_str() {
        Value::from(s)
    } else {
        Value::from(value.to_string())
    }
}
