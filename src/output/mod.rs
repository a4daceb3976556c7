/*!
 * Output Strategies
 * Pluggable sinks the depository drives
 *
 * A strategy sees every refined event in order, including `Checkpoint`
 * markers (its cue to rotate) and the final sentinel. Errors are returned
 * to the depository, which logs and counts them and keeps going.
 */

mod checkpointing;
pub mod codec;
mod memory;
mod multi_stream;
mod socket;
mod stream;

pub use crate::config::OutputFormat;
pub use checkpointing::CheckpointingOutput;
pub use codec::{read_events, EventEncoder, EventReader};
pub use memory::MemoryOutput;
pub use multi_stream::MultiStreamOutput;
pub use socket::SocketOutput;
pub use stream::StreamOutput;

use crate::config::{CollectorConfig, OutputKind};
use crate::core::errors::{CollectorError, Result};
use crate::core::limits::{FORMAT_VERSION, HEADER_SUFFIX};
use crate::events::Event;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, TimestampSeconds};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::SystemTime;
use tracing::info;
use uuid::Uuid;

/// Sink for the refined event stream
pub trait OutputStrategy: Send {
    /// Consume one event
    fn handle(&mut self, event: &Event) -> Result<()>;

    /// Push buffered output to its destination
    fn flush(&mut self) -> Result<()>;

    /// Flush and release the destination; called once, after `Final`
    fn close(&mut self) -> Result<()>;
}

/// Description of a run, written next to file-based output
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHeader {
    pub run: String,
    pub run_id: String,
    #[serde_as(as = "TimestampSeconds<i64>")]
    pub started: SystemTime,
    pub output: OutputKind,
    pub format: OutputFormat,
    pub version: u32,
}

impl RunHeader {
    pub fn new(config: &CollectorConfig) -> Self {
        Self {
            run: config.run_name.clone(),
            run_id: Uuid::new_v4().to_string(),
            started: SystemTime::now(),
            output: config.output.kind.clone(),
            format: config.output.format,
            version: FORMAT_VERSION,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|err| CollectorError::io(path, err))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|err| CollectorError::io(path, err))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Build the strategy `config` asks for
///
/// File-based strategies create the output directory and the run header;
/// socket output binds its listener. Any failure here aborts startup.
pub fn build_strategy(config: &CollectorConfig) -> Result<Box<dyn OutputStrategy>> {
    let format = config.output.format;

    if let OutputKind::Socket { port } = config.output.kind {
        let socket = SocketOutput::bind((Ipv4Addr::UNSPECIFIED, port), format)?;
        info!(port, "socket output waiting for a collector");
        return Ok(Box::new(socket));
    }

    let dir = &config.output_dir;
    fs::create_dir_all(dir).map_err(|err| CollectorError::io(dir, err))?;
    RunHeader::new(config).write(&config.run_file(HEADER_SUFFIX))?;

    let strategy: Box<dyn OutputStrategy> = match config.output.kind {
        OutputKind::Single => Box::new(StreamOutput::create(
            &config.run_file(format.suffix()),
            format,
        )?),
        OutputKind::Checkpointing => Box::new(CheckpointingOutput::create(
            dir,
            &config.run_name,
            format,
        )?),
        OutputKind::MultiStream => Box::new(MultiStreamOutput::create(
            dir,
            &config.run_name,
            format,
        )?),
        OutputKind::Socket { .. } => {
            return Err(CollectorError::Internal(
                "socket output reached the file path".into(),
            ))
        }
    };
    info!(dir = %dir.display(), run = %config.run_name, ?format, "file output ready");
    Ok(strategy)
}
