//! Leak and summary reports over a replayed trace.

use std::collections::BTreeMap;
use std::fmt::Write;

use serde::Serialize;
use sha2::Digest;

use crate::parse::Counters;
use crate::replay::{LiveBlock, Replay, UnknownFree};

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

/// SHA-256 of the raw trace bytes, lowercase hex.
#[must_use]
pub fn trace_digest(raw: &[u8]) -> String {
    hex_lower(&sha2::Sha256::digest(raw))
}

/// Result of `findleak`.
#[derive(Debug, Clone, Serialize)]
pub struct LeakReport {
    pub trace: String,
    pub sha256: String,
    pub events: usize,
    pub live_bytes: u64,
    pub live_blocks: Vec<LiveBlock>,
    pub foreign_frees: usize,
    pub unknown_frees: Vec<UnknownFree>,
    pub degraded_lines: usize,
    pub last_used: Option<u64>,
    pub consistent: bool,
}

impl LeakReport {
    #[must_use]
    pub fn new(trace: impl Into<String>, raw: &[u8], replay: Replay) -> Self {
        Self {
            trace: trace.into(),
            sha256: trace_digest(raw),
            events: replay.events,
            live_bytes: replay.live_bytes,
            live_blocks: replay.live_blocks,
            foreign_frees: replay.foreign_frees,
            unknown_frees: replay.unknown_frees,
            degraded_lines: replay.degraded_lines,
            last_used: replay.last_used,
            consistent: replay.consistent,
        }
    }

    #[must_use]
    pub fn has_leaks(&self) -> bool {
        !self.live_blocks.is_empty()
    }

    /// Render the report as markdown.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Leak report: {}\n", self.trace);
        let _ = writeln!(out, "- SHA-256: {}", self.sha256);
        let _ = writeln!(out, "- Events: {}", self.events);
        let _ = writeln!(out, "- Live blocks: {}", self.live_blocks.len());
        let _ = writeln!(out, "- Live bytes: {}", self.live_bytes);
        let _ = writeln!(out, "- Foreign frees: {}", self.foreign_frees);
        let _ = writeln!(out, "- Unknown frees: {}", self.unknown_frees.len());
        let _ = writeln!(out, "- Degraded lines: {}", self.degraded_lines);
        match self.last_used {
            Some(used) => {
                let verdict = if self.consistent { "matches" } else { "DIFFERS" };
                let _ = writeln!(out, "- Last used total: {used} ({verdict})\n");
            }
            None => out.push('\n'),
        }

        if self.has_leaks() {
            out.push_str("| Line | Op | Pointer | Size |\n");
            out.push_str("|------|----|---------|------|\n");
            for b in &self.live_blocks {
                let _ = writeln!(out, "| {} | {} | {:#x} | {} |", b.line, b.op, b.ptr, b.size);
            }
            for b in self.live_blocks.iter().filter(|b| !b.frames.is_empty()) {
                let _ = writeln!(out, "\n{:#x} allocated at line {}:", b.ptr, b.line);
                for frame in &b.frames {
                    let _ = writeln!(out, "    {frame}");
                }
            }
        } else {
            out.push_str("No leaks.\n");
        }
        out
    }

    /// Render the report as JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}

/// Result of `summary`.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryReport {
    pub trace: String,
    pub sha256: String,
    pub events: usize,
    pub ops: BTreeMap<String, u64>,
    pub peak_used: u64,
    pub init: Option<Counters>,
    pub fini: Option<Counters>,
}

impl SummaryReport {
    #[must_use]
    pub fn new(trace: impl Into<String>, raw: &[u8], replay: Replay) -> Self {
        Self {
            trace: trace.into(),
            sha256: trace_digest(raw),
            events: replay.events,
            ops: replay.ops,
            peak_used: replay.peak_used,
            init: replay.init,
            fini: replay.fini,
        }
    }

    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Trace summary: {}\n", self.trace);
        let _ = writeln!(out, "- SHA-256: {}", self.sha256);
        let _ = writeln!(out, "- Events: {}", self.events);
        let _ = writeln!(out, "- Peak used: {}\n", self.peak_used);
        out.push_str("| Op | Events |\n");
        out.push_str("|----|--------|\n");
        for (op, n) in &self.ops {
            let _ = writeln!(out, "| {op} | {n} |");
        }
        if let Some(fini) = &self.fini {
            let _ = writeln!(out, "\nFinal counters: [{}:{}]", fini.used, fini.rused);
            for (name, n) in &fini.calls {
                let _ = writeln!(out, "- {name}: {n}");
            }
        }
        out
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}
