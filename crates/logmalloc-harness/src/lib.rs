//! Offline analysis of logmalloc traces.
//!
//! This crate provides:
//! - Parsing: trace lines into typed records ([`parse`])
//! - Replay: live-block reconstruction and leak detection ([`replay`])
//! - Reports: markdown and JSON renderings with the trace's SHA-256 ([`report`])

#![forbid(unsafe_code)]

pub mod parse;
pub mod replay;
pub mod report;

use std::path::Path;

use thiserror::Error;

pub use parse::{ParseError, Parser, Record, TraceEvent, parse_trace};
pub use replay::{LeakFinder, Replay};
pub use report::{LeakReport, SummaryReport};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("reading trace: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing trace: {0}")]
    Parse(#[from] ParseError),
    #[error("encoding report: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read, parse and replay a trace file. Returns the raw bytes with the replay.
pub fn analyze_file(path: &Path) -> Result<(Vec<u8>, Replay), HarnessError> {
    let raw = std::fs::read(path)?;
    let replay = analyze_bytes(&raw)?;
    Ok((raw, replay))
}

/// Parse and replay trace bytes. Invalid UTF-8 is replaced, not rejected.
pub fn analyze_bytes(raw: &[u8]) -> Result<Replay, HarnessError> {
    let text = String::from_utf8_lossy(raw);
    let records = parse_trace(&text)?;
    Ok(LeakFinder::replay(&records))
}
