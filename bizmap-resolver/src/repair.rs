//! Recovery of truncated JSON snapshots
//!
//! A snapshot cut off mid-write is repaired by discarding its unparseable
//! tail; nothing is ever synthesised apart from the closing brackets needed
//! to balance what remains.
//!
//! **Strategies, in order:**
//! 1. Direct parse (file is fine)
//! 2. Structural scan: walk the text tracking string/escape state and the
//!    bracket stack, remember every point where a top-level element ends,
//!    cut at the rightmost one, drop a trailing separator and close the root
//! 3. Line trim: drop trailing lines one at a time, balancing brackets for
//!    each candidate, until something parses
//!
//! Every result is re-parsed before it is reported, and [`repair_file`]
//! writes a `.backup` copy before touching the original.

use crate::error::{ResolveError, ResolveResult};
use bizmap_common::fs::{write_atomic, write_backup};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

/// Candidate cuts tried by the structural scan before giving up
const MAX_STRUCTURAL_ATTEMPTS: usize = 64;

/// Trailing lines the line trim may drop before giving up
const MAX_TRIMMED_LINES: usize = 2000;

/// How a snapshot was brought back to a parseable state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStrategy {
    /// Parsed as-is, nothing changed
    Intact,
    StructuralScan,
    LineTrim,
}

impl fmt::Display for RepairStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepairStrategy::Intact => write!(f, "intact"),
            RepairStrategy::StructuralScan => write!(f, "structural scan"),
            RepairStrategy::LineTrim => write!(f, "line trim"),
        }
    }
}

/// Repaired text plus its parsed value
#[derive(Debug, Clone)]
pub struct RepairedSnapshot {
    pub text: String,
    pub value: Value,
    pub strategy: RepairStrategy,
    /// Bytes of the original text that were dropped
    pub bytes_discarded: usize,
}

impl RepairedSnapshot {
    /// Top-level elements (array items or object members)
    pub fn elements(&self) -> usize {
        element_count(&self.value)
    }
}

/// Outcome of [`repair_file`]
#[derive(Debug, Clone, PartialEq)]
pub struct RepairReport {
    pub path: PathBuf,
    pub strategy: RepairStrategy,
    pub elements_recovered: usize,
    pub bytes_discarded: usize,
    /// Copy of the damaged original, when a rewrite happened
    pub backup: Option<PathBuf>,
}

fn element_count(value: &Value) -> usize {
    match value {
        Value::Array(items) => items.len(),
        Value::Object(members) => members.len(),
        _ => 1,
    }
}

/// Lexer state shared by both strategies
#[derive(Debug, Default)]
struct Scanner {
    stack: Vec<u8>,
    in_string: bool,
    escape: bool,
}

impl Scanner {
    /// Advance over one byte. Returns the depth after the byte when it closed
    /// a container, so callers can spot element ends.
    fn step(&mut self, b: u8) -> Option<usize> {
        if self.in_string {
            if self.escape {
                self.escape = false;
            } else if b == b'\\' {
                self.escape = true;
            } else if b == b'"' {
                self.in_string = false;
            }
            return None;
        }

        match b {
            b'"' => self.in_string = true,
            b'{' => self.stack.push(b'}'),
            b'[' => self.stack.push(b']'),
            b'}' | b']' => {
                self.stack.pop();
                return Some(self.stack.len());
            }
            _ => {}
        }
        None
    }

    fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Brackets that would close every open container, innermost first
    fn closers(&self) -> String {
        self.stack.iter().rev().map(|b| *b as char).collect()
    }
}

fn strip_trailing_separator(text: &str) -> &str {
    let trimmed = text.trim_end();
    trimmed.strip_suffix(',').map(str::trim_end).unwrap_or(trimmed)
}

fn try_parse(text: &str) -> Option<Value> {
    serde_json::from_str(text).ok()
}

/// Ends of complete top-level elements, rightmost last.
///
/// A boundary is a separator at depth 1 (cut before it), the close of a
/// container that returns to depth 1 (cut after it), or the close of the
/// root itself.
fn element_boundaries(text: &str) -> (Vec<Boundary>, Option<u8>) {
    let mut scanner = Scanner::default();
    let mut boundaries = Vec::new();
    let mut root = None;

    for (i, b) in text.bytes().enumerate() {
        if root.is_none() {
            if b.is_ascii_whitespace() {
                continue;
            }
            if b != b'[' && b != b'{' {
                return (Vec::new(), None);
            }
            root = Some(if b == b'[' { b']' } else { b'}' });
        }

        let was_in_string = scanner.in_string;
        match scanner.step(b) {
            Some(0) => {
                boundaries.push(Boundary { cut: i + 1, closed: true });
                break;
            }
            Some(1) => boundaries.push(Boundary { cut: i + 1, closed: false }),
            Some(_) => {}
            None => {
                if !was_in_string && b == b',' && scanner.depth() == 1 {
                    boundaries.push(Boundary { cut: i, closed: false });
                }
            }
        }
    }

    (boundaries, root)
}

#[derive(Debug, Clone, Copy)]
struct Boundary {
    cut: usize,
    /// Root already closed at this point
    closed: bool,
}

fn structural_scan(text: &str) -> Option<(String, usize)> {
    let (boundaries, root) = element_boundaries(text);
    let root = root?;

    for boundary in boundaries.iter().rev().take(MAX_STRUCTURAL_ATTEMPTS) {
        let kept = strip_trailing_separator(&text[..boundary.cut]);
        let mut candidate = String::with_capacity(kept.len() + 1);
        candidate.push_str(kept);
        if !boundary.closed {
            candidate.push(root as char);
        }

        if try_parse(&candidate).is_some() {
            return Some((candidate, text.len() - kept.len()));
        }
    }

    // Root opened but no element ever completed
    let start = text.find(|c: char| !c.is_whitespace())?;
    let empty = format!("{}{}", &text[start..=start], root as char);
    try_parse(&empty).map(|_| (empty, text.len() - start - 1))
}

fn line_trim(text: &str) -> Option<(String, usize)> {
    let lines: Vec<&str> = text.lines().collect();
    let lowest = lines.len().saturating_sub(MAX_TRIMMED_LINES).max(1);

    // The last line is where the write stopped; it never survives
    for keep in (lowest..lines.len()).rev() {
        let joined = lines[..keep].join("\n");
        let kept = strip_trailing_separator(&joined);

        let mut scanner = Scanner::default();
        for b in kept.bytes() {
            scanner.step(b);
        }
        if scanner.in_string {
            continue;
        }

        let candidate = format!("{}{}", kept, scanner.closers());
        if try_parse(&candidate).is_some() {
            let discarded = text.len().saturating_sub(kept.len());
            return Some((candidate, discarded));
        }
    }

    None
}

/// Repair snapshot text in memory.
///
/// `Err(reason)` when no strategy yields parseable JSON.
pub fn repair_text(text: &str) -> Result<RepairedSnapshot, String> {
    let direct_error = match serde_json::from_str::<Value>(text) {
        Ok(value) => {
            return Ok(RepairedSnapshot {
                text: text.to_string(),
                value,
                strategy: RepairStrategy::Intact,
                bytes_discarded: 0,
            })
        }
        Err(e) => e.to_string(),
    };

    let strategies: [(RepairStrategy, fn(&str) -> Option<(String, usize)>); 2] = [
        (RepairStrategy::StructuralScan, structural_scan),
        (RepairStrategy::LineTrim, line_trim),
    ];

    for (strategy, run) in strategies {
        let Some((repaired, bytes_discarded)) = run(text) else {
            continue;
        };

        // Verify independently of the strategy's own check
        match serde_json::from_str::<Value>(&repaired) {
            Ok(value) => {
                return Ok(RepairedSnapshot {
                    text: repaired,
                    value,
                    strategy,
                    bytes_discarded,
                })
            }
            Err(e) => {
                tracing::warn!(strategy = %strategy, error = %e, "Repaired text failed verification");
            }
        }
    }

    Err(format!("unrepairable ({})", direct_error))
}

/// Repair a snapshot file in place.
///
/// An intact file is left untouched. Otherwise a `.backup` copy of the
/// damaged file is written first, then the repaired text replaces the
/// original atomically and is re-read to confirm it parses.
pub fn repair_file(path: &Path) -> ResolveResult<RepairReport> {
    let text = std::fs::read_to_string(path)?;

    let repaired = repair_text(&text).map_err(|reason| ResolveError::Corrupt {
        path: path.to_path_buf(),
        reason,
    })?;

    if repaired.strategy == RepairStrategy::Intact {
        return Ok(RepairReport {
            path: path.to_path_buf(),
            strategy: RepairStrategy::Intact,
            elements_recovered: repaired.elements(),
            bytes_discarded: 0,
            backup: None,
        });
    }

    let backup = write_backup(path)?;

    let mut bytes = repaired.text.clone().into_bytes();
    bytes.push(b'\n');
    write_atomic(path, &bytes)?;

    let written = std::fs::read_to_string(path)?;
    if let Err(e) = serde_json::from_str::<Value>(&written) {
        return Err(ResolveError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("repaired file failed verification: {}", e),
        });
    }

    let report = RepairReport {
        path: path.to_path_buf(),
        strategy: repaired.strategy,
        elements_recovered: repaired.elements(),
        bytes_discarded: repaired.bytes_discarded,
        backup: Some(backup),
    };

    tracing::warn!(
        path = %path.display(),
        strategy = %report.strategy,
        elements = report.elements_recovered,
        bytes_discarded = report.bytes_discarded,
        "Repaired truncated snapshot"
    );

    Ok(report)
}
