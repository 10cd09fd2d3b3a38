use std::io;

use anyhow::Result;
use chatlabel_core::{JsonlSink, JsonlWriter};
use serde::Serialize;

/// Progress events go to stdout as JSON lines, interleaved with results.
pub fn progress_sink() -> JsonlSink<io::Stdout> {
    JsonlSink::new(io::stdout())
}

pub fn print_record<T: Serialize>(record: &T) -> Result<()> {
    JsonlWriter::new(io::stdout().lock()).write_record(record)
}
