/*!
 * Multi-Stream Output
 * One file per event category
 */

use super::codec::EventEncoder;
use super::{OutputFormat, OutputStrategy};
use crate::core::errors::{CollectorError, Result};
use crate::core::limits::{
    ACCESS_STREAM_SUFFIX, INDIRECT_STREAM_SUFFIX, LOCK_STREAM_SUFFIX, OBJECT_STREAM_SUFFIX,
    OTHER_STREAM_SUFFIX,
};
use crate::events::{Category, Event};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Streams in `Category` order
const STREAMS: [(Category, &str); 5] = [
    (Category::Lock, LOCK_STREAM_SUFFIX),
    (Category::Access, ACCESS_STREAM_SUFFIX),
    (Category::Object, OBJECT_STREAM_SUFFIX),
    (Category::Indirect, INDIRECT_STREAM_SUFFIX),
    (Category::Other, OTHER_STREAM_SUFFIX),
];

/// Routes each event by category; broadcast events go to every stream
pub struct MultiStreamOutput {
    streams: Vec<EventEncoder<File>>,
    paths: Vec<PathBuf>,
}

impl MultiStreamOutput {
    pub fn create(dir: &Path, run: &str, format: OutputFormat) -> Result<Self> {
        let mut streams = Vec::with_capacity(STREAMS.len());
        let mut paths = Vec::with_capacity(STREAMS.len());
        for (_, name) in STREAMS {
            let path = dir.join(format!("{run}.{name}.{}", format.suffix()));
            let file = File::create(&path).map_err(|err| CollectorError::io(&path, err))?;
            streams.push(EventEncoder::new(file, format));
            paths.push(path);
        }
        Ok(Self { streams, paths })
    }

    /// Path of the stream carrying `category`
    pub fn path(&self, category: Category) -> Option<&Path> {
        STREAMS
            .iter()
            .position(|(c, _)| *c == category)
            .map(|i| self.paths[i].as_path())
    }

    fn each<F>(&mut self, mut op: F) -> Result<()>
    where
        F: FnMut(&mut EventEncoder<File>) -> Result<()>,
    {
        // Every stream gets the call even if an earlier one fails
        let mut first_err = None;
        for stream in self.streams.iter_mut() {
            if let Err(err) = op(stream) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl OutputStrategy for MultiStreamOutput {
    fn handle(&mut self, event: &Event) -> Result<()> {
        match event.category() {
            Category::Broadcast => self.each(|stream| stream.encode(event)),
            category => {
                let index = STREAMS
                    .iter()
                    .position(|(c, _)| *c == category)
                    .ok_or_else(|| CollectorError::Internal(format!("no stream for {category:?}")))?;
                self.streams[index].encode(event)
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.each(|stream| stream.flush())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}
