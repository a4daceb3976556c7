/*!
 * Checkpointing Output
 * One numbered file per checkpoint interval
 *
 * Files are named `<run>.NNNNNN.<suffix>`. When a `Checkpoint` arrives the
 * current file gets the marker and a closing `Final`, then a completion
 * marker `<run>.NNNNNN.complete` records the cut time and the next file is
 * opened. A file is safe to consume once its completion marker exists.
 */

use super::codec::EventEncoder;
use super::{OutputFormat, OutputStrategy};
use crate::core::errors::{CollectorError, Result};
use crate::core::limits::COMPLETE_SUFFIX;
use crate::events::{Event, EventKind};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct CheckpointingOutput {
    dir: PathBuf,
    run: String,
    format: OutputFormat,
    index: u32,
    current: Option<EventEncoder<File>>,
    last_nanos: u64,
}

impl CheckpointingOutput {
    pub fn create(dir: &Path, run: &str, format: OutputFormat) -> Result<Self> {
        let mut output = Self {
            dir: dir.to_path_buf(),
            run: run.to_string(),
            format,
            index: 0,
            current: None,
            last_nanos: 0,
        };
        output.open()?;
        Ok(output)
    }

    /// Path of the `index`th stream file
    pub fn file_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!(
            "{}.{:06}.{}",
            self.run,
            index,
            self.format.suffix()
        ))
    }

    /// Path of the `index`th completion marker
    pub fn marker_path(&self, index: u32) -> PathBuf {
        self.dir
            .join(format!("{}.{:06}.{}", self.run, index, COMPLETE_SUFFIX))
    }

    /// Index of the file currently being written
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    fn open(&mut self) -> Result<()> {
        let path = self.file_path(self.index);
        let file = File::create(&path).map_err(|err| CollectorError::io(&path, err))?;
        self.current = Some(EventEncoder::new(file, self.format));
        debug!(path = %path.display(), "opened checkpoint file");
        Ok(())
    }

    fn encoder(&mut self) -> Result<&mut EventEncoder<File>> {
        self.current
            .as_mut()
            .ok_or_else(|| CollectorError::Internal("checkpoint output already closed".into()))
    }

    /// Close the current file and write its completion marker
    fn complete(&mut self, nanos: u64) -> Result<()> {
        let Some(encoder) = self.current.take() else {
            return Ok(());
        };
        encoder.finish()?.sync_all()?;
        let marker = self.marker_path(self.index);
        fs::write(&marker, format!("{nanos} ns")).map_err(|err| CollectorError::io(&marker, err))
    }

    fn rotate(&mut self, checkpoint: &Event) -> Result<()> {
        let encoder = self.encoder()?;
        encoder.encode(checkpoint)?;
        encoder.encode(&Event::at(checkpoint.nanos, EventKind::Final))?;
        self.complete(checkpoint.nanos)?;
        self.index += 1;
        self.open()
    }
}

impl OutputStrategy for CheckpointingOutput {
    fn handle(&mut self, event: &Event) -> Result<()> {
        self.last_nanos = event.nanos;
        if event.is_checkpoint() {
            return self.rotate(event);
        }
        self.encoder()?.encode(event)
    }

    fn flush(&mut self) -> Result<()> {
        match self.current.as_mut() {
            Some(encoder) => encoder.flush(),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> Result<()> {
        let nanos = self.last_nanos;
        self.complete(nanos)
    }
}
