/*!
 * Single Stream Output
 */

use super::codec::EventEncoder;
use super::{OutputFormat, OutputStrategy};
use crate::core::errors::{CollectorError, Result};
use crate::events::Event;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Every event of the run into one writer
pub struct StreamOutput<W: Write + Send> {
    encoder: Option<EventEncoder<W>>,
}

impl StreamOutput<File> {
    /// Create (truncating) the stream file at `path`
    pub fn create(path: &Path, format: OutputFormat) -> Result<Self> {
        let file = File::create(path).map_err(|err| CollectorError::io(path, err))?;
        Ok(Self::new(file, format))
    }
}

impl<W: Write + Send> StreamOutput<W> {
    pub fn new(writer: W, format: OutputFormat) -> Self {
        Self {
            encoder: Some(EventEncoder::new(writer, format)),
        }
    }

    fn encoder(&mut self) -> Result<&mut EventEncoder<W>> {
        self.encoder
            .as_mut()
            .ok_or_else(|| CollectorError::Internal("stream output already closed".into()))
    }
}

impl<W: Write + Send> OutputStrategy for StreamOutput<W> {
    fn handle(&mut self, event: &Event) -> Result<()> {
        self.encoder()?.encode(event)
    }

    fn flush(&mut self) -> Result<()> {
        self.encoder()?.flush()
    }

    fn close(&mut self) -> Result<()> {
        match self.encoder.take() {
            Some(encoder) => encoder.finish().map(drop),
            None => Ok(()),
        }
    }
}
