//! Trace line parser.
//!
//! The parser is stateful only in one respect: after `# FILE <path>` every
//! line up to the next `+`/`#` line is raw file text (the process map).

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

/// A malformed trace line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {reason}")]
pub struct ParseError {
    pub line: usize,
    pub reason: String,
}

impl ParseError {
    fn new(line: usize, reason: impl Into<String>) -> Self {
        Self {
            line,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CountersTag {
    Init,
    Fini,
}

/// `+ INIT` / `+ FINI` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub tag: CountersTag,
    pub used: u64,
    pub rused: u64,
    pub calls: BTreeMap<String, u64>,
}

/// One allocator event line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEvent {
    pub op: String,
    pub amount: i64,
    pub ptr: u64,
    pub ptr2: Option<u64>,
    /// Numbers inside the parentheses, in order; `:` separators dropped.
    pub extra: Vec<i64>,
    pub used: u64,
    pub rused: u64,
    pub foreign: bool,
    /// Reentrant line written without snapshot or stack (`!` suffix).
    pub degraded: bool,
    pub snapshot: Option<String>,
}

impl TraceEvent {
    #[must_use]
    pub fn is_release(&self) -> bool {
        self.op == "free"
    }

    #[must_use]
    pub fn is_resize(&self) -> bool {
        self.op == "realloc"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Counters(Counters),
    Event(TraceEvent),
    /// `# PID 42`, `# CLOCK-START 100`, ...
    Header { key: String, value: String },
    /// `# FILE <path>`; map lines follow.
    FileMarker { path: String },
    FileLine { text: String },
    /// Stack frame belonging to the preceding event.
    Frame { text: String },
    /// Any other `#` line (savepoints, application text).
    Note { text: String },
}

const HEADER_KEYS: [&str; 6] = ["PID", "EXE", "CWD", "CLOCK-START", "CLOCK-END", "CLOCK-DIFF"];

/// `<n> 0x<ip> ...`, the frame format of the cursor unwinder.
fn is_unwind_frame(rest: &str) -> bool {
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    digits > 0 && rest[digits..].starts_with(" 0x")
}

#[derive(Debug, Default)]
pub struct Parser {
    in_file: bool,
}

impl Parser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one line (without its newline). Blank lines yield `None`.
    pub fn parse_line(&mut self, number: usize, line: &str) -> Result<Option<Record>, ParseError> {
        if line.trim().is_empty() {
            return Ok(None);
        }
        if let Some(rest) = line.strip_prefix("+ ") {
            self.in_file = false;
            return parse_plus(number, rest).map(Some);
        }
        if line.strip_prefix('#').is_some_and(is_unwind_frame) {
            self.in_file = false;
            return Ok(Some(Record::Frame {
                text: line.to_owned(),
            }));
        }
        if let Some(rest) = line.strip_prefix('#') {
            self.in_file = false;
            return Ok(Some(self.parse_hash(rest.trim_start())));
        }
        if self.in_file {
            return Ok(Some(Record::FileLine {
                text: line.to_owned(),
            }));
        }
        Ok(Some(Record::Frame {
            text: line.to_owned(),
        }))
    }

    fn parse_hash(&mut self, rest: &str) -> Record {
        let (key, value) = rest.split_once(' ').unwrap_or((rest, ""));
        if key == "FILE" {
            self.in_file = true;
            return Record::FileMarker {
                path: value.to_owned(),
            };
        }
        if HEADER_KEYS.contains(&key) {
            return Record::Header {
                key: key.to_owned(),
                value: value.to_owned(),
            };
        }
        Record::Note {
            text: rest.to_owned(),
        }
    }
}

/// Parse a whole trace into numbered records (1-based line numbers).
pub fn parse_trace(text: &str) -> Result<Vec<(usize, Record)>, ParseError> {
    let mut parser = Parser::new();
    let mut records = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if let Some(record) = parser.parse_line(index + 1, line)? {
            records.push((index + 1, record));
        }
    }
    Ok(records)
}

fn parse_plus(number: usize, rest: &str) -> Result<Record, ParseError> {
    let tag = rest.split(' ').next().unwrap_or_default();
    match tag {
        "INIT" => parse_counters(number, CountersTag::Init, rest),
        "FINI" => parse_counters(number, CountersTag::Fini, rest),
        _ => parse_event(number, rest).map(Record::Event),
    }
}

fn parse_totals(number: usize, token: &str) -> Result<(u64, u64), ParseError> {
    let inner = token
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .ok_or_else(|| ParseError::new(number, format!("expected [used:rused], found `{token}`")))?;
    let (used, rused) = inner
        .split_once(':')
        .ok_or_else(|| ParseError::new(number, format!("totals `{token}` lack `:`")))?;
    Ok((
        parse_num(number, used, "used")?,
        parse_num(number, rused, "rused")?,
    ))
}

fn parse_num<T: std::str::FromStr>(number: usize, token: &str, what: &str) -> Result<T, ParseError> {
    token
        .parse()
        .map_err(|_| ParseError::new(number, format!("bad {what} `{token}`")))
}

fn parse_ptr(number: usize, token: &str) -> Result<u64, ParseError> {
    let digits = token
        .strip_prefix("0x")
        .ok_or_else(|| ParseError::new(number, format!("pointer `{token}` lacks 0x")))?;
    u64::from_str_radix(digits, 16).map_err(|_| ParseError::new(number, format!("bad pointer `{token}`")))
}

fn parse_counters(number: usize, tag: CountersTag, rest: &str) -> Result<Record, ParseError> {
    let mut tokens = rest.split_whitespace().skip(1);
    let totals = tokens
        .next()
        .ok_or_else(|| ParseError::new(number, "counters line without totals"))?;
    let (used, rused) = parse_totals(number, totals)?;
    let mut calls = BTreeMap::new();
    for token in tokens {
        let (name, value) = token
            .split_once('=')
            .ok_or_else(|| ParseError::new(number, format!("bad counter `{token}`")))?;
        if name == "memalign" {
            let (plain, posix) = value
                .split_once('/')
                .ok_or_else(|| ParseError::new(number, format!("bad memalign counter `{value}`")))?;
            calls.insert("memalign".to_owned(), parse_num(number, plain, "counter")?);
            calls.insert("posix_memalign".to_owned(), parse_num(number, posix, "counter")?);
        } else {
            calls.insert(name.to_owned(), parse_num(number, value, "counter")?);
        }
    }
    Ok(Record::Counters(Counters {
        tag,
        used,
        rused,
        calls,
    }))
}

fn parse_event(number: usize, rest: &str) -> Result<TraceEvent, ParseError> {
    let mut body = rest;
    let degraded = body.ends_with('!');
    if degraded {
        body = &body[..body.len() - 1];
    }
    let mut snapshot = None;
    if let Some((head, snap)) = body.split_once(" #") {
        snapshot = Some(snap.to_owned());
        body = head;
    }
    let foreign = match body.strip_suffix(" !f") {
        Some(head) => {
            body = head;
            true
        }
        None => false,
    };

    let mut extra = Vec::new();
    let mut fields = String::with_capacity(body.len());
    match (body.find('('), body.rfind(')')) {
        (Some(open), Some(close)) if open < close => {
            for token in body[open + 1..close].split_whitespace().filter(|t| *t != ":") {
                extra.push(parse_num(number, token, "extra")?);
            }
            fields.push_str(&body[..open]);
            fields.push_str(&body[close + 1..]);
        }
        _ => fields.push_str(body),
    }

    let tokens: Vec<&str> = fields.split_whitespace().collect();
    let (totals, head) = tokens
        .split_last()
        .ok_or_else(|| ParseError::new(number, "empty event"))?;
    let (used, rused) = parse_totals(number, totals)?;
    let [op, amount, ptr, rest @ ..] = head else {
        return Err(ParseError::new(number, "event needs op, amount and pointer"));
    };
    let ptr2 = match rest {
        [] => None,
        [p] => Some(parse_ptr(number, p)?),
        _ => return Err(ParseError::new(number, "too many pointer fields")),
    };
    Ok(TraceEvent {
        op: (*op).to_owned(),
        amount: parse_num(number, amount, "amount")?,
        ptr: parse_ptr(number, ptr)?,
        ptr2,
        extra,
        used,
        rused,
        foreign,
        degraded,
        snapshot,
    })
}
