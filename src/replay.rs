// src/replay.rs
//
// Recorded sensor stream: one JSON array of detection records per line,
// frames in sensor-timestamp order.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;
use tracing::warn;

use crate::types::RawDetection;

pub struct FrameReader<R> {
    lines: Lines<R>,
    line_no: usize,
}

impl FrameReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("opening recording {}", path.display()))?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

impl<R: BufRead> Iterator for FrameReader<R> {
    type Item = Vec<RawDetection>;

    /// Blank and unparsable lines are skipped; read errors end the stream.
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    warn!("Recording read failed after line {}: {}", self.line_no, e);
                    return None;
                }
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Vec<RawDetection>>(&line) {
                Ok(frame) => return Some(frame),
                Err(e) => warn!("Skipping unparsable frame at line {}: {}", self.line_no, e),
            }
        }
    }
}
