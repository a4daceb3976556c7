/*!
 * Collector Configuration
 *
 * Built once at startup and handed by value to `Collector::start`. Nothing in
 * the pipeline reads configuration from global state.
 */

use crate::core::errors::{CollectorError, Result};
use crate::core::limits::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Where the depository sends refined events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// One file for the whole run
    Single,
    /// A new numbered file after every checkpoint
    Checkpointing,
    /// One file per event category
    MultiStream,
    /// Stream to a remote collector that connects on `port`
    Socket { port: u16 },
}

/// Encoding of persisted events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Newline-delimited JSON
    JsonLines,
    /// Consecutive bincode records
    Binary,
}

impl OutputFormat {
    /// File extension for streams in this format
    pub const fn suffix(self) -> &'static str {
        match self {
            OutputFormat::JsonLines => "fl",
            OutputFormat::Binary => "flb",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub kind: OutputKind,
    pub format: OutputFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            kind: OutputKind::Checkpointing,
            format: OutputFormat::JsonLines,
        }
    }
}

/// When the refinery cuts a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub enabled: bool,
    pub initial_duration: Duration,
    pub duration: Duration,
    pub event_count: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_duration: CHECKPOINT_INITIAL_DURATION,
            duration: CHECKPOINT_DURATION,
            event_count: CHECKPOINT_EVENT_COUNT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub run_name: String,
    pub output_dir: PathBuf,
    pub local_buffer_capacity: usize,
    pub raw_queue_capacity: usize,
    pub out_queue_capacity: usize,
    pub gc_queue_capacity: usize,
    pub refinery_cache_size: usize,
    pub poll_interval: Duration,
    pub checkpoint: CheckpointConfig,
    /// Drop events about fields proven to be thread-confined
    pub filter_events: bool,
    pub output: OutputConfig,
    pub sites_file: Option<PathBuf>,
    pub fields_file: Option<PathBuf>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            run_name: DEFAULT_RUN_NAME.to_string(),
            output_dir: std::env::temp_dir().join(DEFAULT_RUN_NAME),
            local_buffer_capacity: LOCAL_BUFFER_CAPACITY,
            raw_queue_capacity: RAW_QUEUE_CAPACITY,
            out_queue_capacity: OUT_QUEUE_CAPACITY,
            gc_queue_capacity: GC_QUEUE_CAPACITY,
            refinery_cache_size: REFINERY_CACHE_SIZE,
            poll_interval: REFINERY_POLL_INTERVAL,
            checkpoint: CheckpointConfig::default(),
            filter_events: true,
            output: OutputConfig::default(),
            sites_file: None,
            fields_file: None,
        }
    }
}

impl CollectorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `RACEWATCH_*` environment variables
    ///
    /// Recognized: RUN, DIR, LOCAL_BUFFER, RAWQ_SIZE, OUTQ_SIZE, GCQ_SIZE,
    /// REFINERY_SIZE, POLL_MS, CHECKPOINT (0/1), CHECKPOINT_INITIAL_MS,
    /// CHECKPOINT_MS, CHECKPOINT_EVENTS, FILTER (0/1), OUTPUT
    /// (single|checkpointing|multi|socket), OUTPUT_PORT, FORMAT (json|binary),
    /// SITES_FILE, FIELDS_FILE.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("RACEWATCH_{name}"));
        let mut config = Self::default();

        if let Some(run) = var("RUN") {
            config.run_name = run;
        }
        if let Some(dir) = var("DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(v) = var("LOCAL_BUFFER") {
            config.local_buffer_capacity = parse("LOCAL_BUFFER", &v)?;
        }
        if let Some(v) = var("RAWQ_SIZE") {
            config.raw_queue_capacity = parse("RAWQ_SIZE", &v)?;
        }
        if let Some(v) = var("OUTQ_SIZE") {
            config.out_queue_capacity = parse("OUTQ_SIZE", &v)?;
        }
        if let Some(v) = var("GCQ_SIZE") {
            config.gc_queue_capacity = parse("GCQ_SIZE", &v)?;
        }
        if let Some(v) = var("REFINERY_SIZE") {
            config.refinery_cache_size = parse("REFINERY_SIZE", &v)?;
        }
        if let Some(v) = var("POLL_MS") {
            config.poll_interval = Duration::from_millis(parse("POLL_MS", &v)?);
        }
        if let Some(v) = var("CHECKPOINT") {
            config.checkpoint.enabled = parse_flag("CHECKPOINT", &v)?;
        }
        if let Some(v) = var("CHECKPOINT_INITIAL_MS") {
            config.checkpoint.initial_duration =
                Duration::from_millis(parse("CHECKPOINT_INITIAL_MS", &v)?);
        }
        if let Some(v) = var("CHECKPOINT_MS") {
            config.checkpoint.duration = Duration::from_millis(parse("CHECKPOINT_MS", &v)?);
        }
        if let Some(v) = var("CHECKPOINT_EVENTS") {
            config.checkpoint.event_count = parse("CHECKPOINT_EVENTS", &v)?;
        }
        if let Some(v) = var("FILTER") {
            config.filter_events = parse_flag("FILTER", &v)?;
        }
        if let Some(v) = var("FORMAT") {
            config.output.format = match v.as_str() {
                "json" | "jsonl" => OutputFormat::JsonLines,
                "binary" | "bin" => OutputFormat::Binary,
                other => {
                    return Err(CollectorError::Configuration(format!(
                        "RACEWATCH_FORMAT: unknown format '{other}'"
                    )))
                }
            };
        }
        if let Some(v) = var("OUTPUT") {
            config.output.kind = match v.as_str() {
                "single" => OutputKind::Single,
                "checkpointing" => OutputKind::Checkpointing,
                "multi" | "multistream" => OutputKind::MultiStream,
                "socket" => {
                    let port = var("OUTPUT_PORT").ok_or_else(|| {
                        CollectorError::Configuration(
                            "RACEWATCH_OUTPUT=socket requires RACEWATCH_OUTPUT_PORT".into(),
                        )
                    })?;
                    OutputKind::Socket {
                        port: parse("OUTPUT_PORT", &port)?,
                    }
                }
                other => {
                    return Err(CollectorError::Configuration(format!(
                        "RACEWATCH_OUTPUT: unknown output '{other}'"
                    )))
                }
            };
        }
        config.sites_file = var("SITES_FILE").map(PathBuf::from);
        config.fields_file = var("FIELDS_FILE").map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("local_buffer_capacity", self.local_buffer_capacity),
            ("raw_queue_capacity", self.raw_queue_capacity),
            ("out_queue_capacity", self.out_queue_capacity),
            ("gc_queue_capacity", self.gc_queue_capacity),
            ("checkpoint.event_count", self.checkpoint.event_count),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(CollectorError::Configuration(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.poll_interval.is_zero() {
            return Err(CollectorError::Configuration(
                "poll_interval must be greater than zero".into(),
            ));
        }
        if self.checkpoint.enabled
            && (self.checkpoint.duration.is_zero() || self.checkpoint.initial_duration.is_zero())
        {
            return Err(CollectorError::Configuration(
                "checkpoint durations must be greater than zero".into(),
            ));
        }
        if self.run_name.is_empty() {
            return Err(CollectorError::Configuration(
                "run_name must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn with_run_name(mut self, run_name: impl Into<String>) -> Self {
        self.run_name = run_name.into();
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_output(mut self, kind: OutputKind, format: OutputFormat) -> Self {
        self.output = OutputConfig { kind, format };
        self
    }

    pub fn with_local_buffer_capacity(mut self, capacity: usize) -> Self {
        self.local_buffer_capacity = capacity;
        self
    }

    pub fn with_queue_capacities(mut self, raw: usize, out: usize) -> Self {
        self.raw_queue_capacity = raw;
        self.out_queue_capacity = out;
        self
    }

    pub fn with_refinery_cache_size(mut self, size: usize) -> Self {
        self.refinery_cache_size = size;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_checkpoints(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn without_checkpoints(mut self) -> Self {
        self.checkpoint.enabled = false;
        self
    }

    pub fn with_filtering(mut self, enabled: bool) -> Self {
        self.filter_events = enabled;
        self
    }

    /// Path of a run-level file with the given suffix
    pub fn run_file(&self, suffix: &str) -> PathBuf {
        self.output_dir.join(format!("{}.{}", self.run_name, suffix))
    }
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        CollectorError::Configuration(format!("RACEWATCH_{name}: cannot parse '{value}'"))
    })
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => Err(CollectorError::Configuration(format!(
            "RACEWATCH_{name}: expected a boolean, got '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = CollectorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.local_buffer_capacity, LOCAL_BUFFER_CAPACITY);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.output.kind, OutputKind::Checkpointing);
    }

    #[test]
    fn test_overrides() {
        let config = CollectorConfig::from_lookup(lookup(&[
            ("RACEWATCH_RUN", "demo"),
            ("RACEWATCH_RAWQ_SIZE", "4"),
            ("RACEWATCH_FILTER", "off"),
            ("RACEWATCH_OUTPUT", "socket"),
            ("RACEWATCH_OUTPUT_PORT", "4567"),
            ("RACEWATCH_FORMAT", "binary"),
            ("RACEWATCH_CHECKPOINT_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.run_name, "demo");
        assert_eq!(config.raw_queue_capacity, 4);
        assert!(!config.filter_events);
        assert_eq!(config.output.kind, OutputKind::Socket { port: 4567 });
        assert_eq!(config.output.format, OutputFormat::Binary);
        assert_eq!(config.checkpoint.duration, Duration::from_millis(250));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err = CollectorConfig::from_lookup(lookup(&[("RACEWATCH_OUTQ_SIZE", "0")]))
            .unwrap_err();
        assert!(matches!(err, CollectorError::Configuration(_)));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(CollectorConfig::from_lookup(lookup(&[("RACEWATCH_POLL_MS", "soon")])).is_err());
        assert!(CollectorConfig::from_lookup(lookup(&[("RACEWATCH_OUTPUT", "socket")])).is_err());
        assert!(CollectorConfig::from_lookup(lookup(&[("RACEWATCH_FORMAT", "xml")])).is_err());
    }

    #[test]
    fn test_run_file() {
        let config = CollectorConfig::default()
            .with_run_name("r")
            .with_output_dir("/tmp/out");
        assert_eq!(config.run_file("flh"), PathBuf::from("/tmp/out/r.flh"));
    }
}
