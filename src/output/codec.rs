/*!
 * Event Codec
 * JSON-lines and binary encodings of the event stream
 *
 * Binary streams are consecutive bincode records with no framing beyond
 * what bincode itself writes; a reader stops at the first clean EOF.
 */

use crate::config::OutputFormat;
use crate::core::errors::{CollectorError, Result};
use crate::core::limits::OUTPUT_BUFFER_SIZE;
use crate::events::Event;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Buffered writer of events in one format
pub struct EventEncoder<W: Write> {
    format: OutputFormat,
    writer: BufWriter<W>,
}

impl<W: Write> EventEncoder<W> {
    pub fn new(writer: W, format: OutputFormat) -> Self {
        Self {
            format,
            writer: BufWriter::with_capacity(OUTPUT_BUFFER_SIZE, writer),
        }
    }

    pub fn encode(&mut self, event: &Event) -> Result<()> {
        match self.format {
            OutputFormat::JsonLines => {
                serde_json::to_writer(&mut self.writer, event)?;
                self.writer.write_all(b"\n")?;
            }
            OutputFormat::Binary => bincode::serialize_into(&mut self.writer, event)?,
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    #[inline]
    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Flush and hand back the underlying writer
    pub fn finish(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|err| CollectorError::Stream(err.into_error()))
    }
}

/// Iterator over the events of an encoded stream
pub struct EventReader<R: Read> {
    format: OutputFormat,
    reader: BufReader<R>,
    line: String,
    failed: bool,
}

impl<R: Read> EventReader<R> {
    pub fn new(reader: R, format: OutputFormat) -> Self {
        Self {
            format,
            reader: BufReader::with_capacity(OUTPUT_BUFFER_SIZE, reader),
            line: String::new(),
            failed: false,
        }
    }

    fn next_json(&mut self) -> Option<Result<Event>> {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => {
                    let line = self.line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    return Some(serde_json::from_str(line).map_err(CollectorError::from));
                }
                Err(err) => return Some(Err(err.into())),
            }
        }
    }

    fn next_binary(&mut self) -> Option<Result<Event>> {
        let at_eof = match self.reader.fill_buf() {
            Ok(buf) => buf.is_empty(),
            Err(err) => return Some(Err(err.into())),
        };
        if at_eof {
            return None;
        }
        Some(
            bincode::deserialize_from(&mut self.reader)
                .map_err(|err| CollectorError::Decode(err.to_string())),
        )
    }
}

impl<R: Read> Iterator for EventReader<R> {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let next = match self.format {
            OutputFormat::JsonLines => self.next_json(),
            OutputFormat::Binary => self.next_binary(),
        };
        if matches!(next, Some(Err(_))) {
            self.failed = true;
        }
        next
    }
}

/// Read a whole stream file
pub fn read_events(path: &Path, format: OutputFormat) -> Result<Vec<Event>> {
    let file = File::open(path).map_err(|err| CollectorError::io(path, err))?;
    EventReader::new(file, format).collect()
}
