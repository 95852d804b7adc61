//! fallback console-log scan
//!
//! Used when a benchmark's structured report is unavailable: after a
//! timeout-forced kill, or when the report file is corrupt or was never
//! written. The fatal markers and summary-line grammars are fixed tables so
//! this path stays testable without ever running a process.

use crate::drivers::OpErrors;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

/// substrings that mark a run as failed wherever they appear in the log
///
/// Covers the Go runtime panic markers the benchmark tools emit, S3-side
/// unavailability answers and a malformed invocation.
pub const FATAL_MARKERS: &[&str] = &[
    "panic: ",
    "runtime error:",
    "fatal error: runtime: out of memory",
    "ServiceUnavailable",
    "SlowDown",
    "InternalError",
    "connection refused",
    "flag provided but not defined",
];

/// scan rules for one benchmark tool
pub struct ScanTable {
    pub fatal_markers: &'static [&'static str],
    /// must expose named captures `op` and `errors`
    pub summary: &'static Regex,
}

/// s3bench re-prints running totals, e.g. `Operation: Write, Total Errors: 3`
static S3BENCH_SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Operation:\s*(?P<op>[A-Za-z]+).*?Errors:\s*(?P<errors>\d+)").unwrap()
});

/// warp status lines, e.g. `Put objects done, errors: 0`
static WARP_SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<op>[A-Za-z]+)\b.*?\berrors:\s*(?P<errors>\d+)").unwrap()
});

pub static S3BENCH_TABLE: Lazy<ScanTable> = Lazy::new(|| ScanTable {
    fatal_markers: FATAL_MARKERS,
    summary: Lazy::force(&S3BENCH_SUMMARY),
});

pub static WARP_TABLE: Lazy<ScanTable> = Lazy::new(|| ScanTable {
    fatal_markers: FATAL_MARKERS,
    summary: Lazy::force(&WARP_SUMMARY),
});

#[derive(Debug)]
pub struct ScanOutcome {
    /// first fatal marker found, if any; its presence fails the run
    /// regardless of any extracted counts
    pub fatal_marker: Option<String>,
    /// per configured operation; `Unknown` when no summary line could be
    /// attributed
    pub counts: BTreeMap<String, OpErrors>,
}

/// scan a raw console log for fatal markers and per-operation summary lines
///
/// Operation names match case-sensitively against the configured set; only
/// the last summary line per operation is authoritative since the tools
/// re-print running totals.
pub fn scan_console(console: &str, operations: &[String], table: &ScanTable) -> ScanOutcome {
    let mut counts: BTreeMap<String, OpErrors> = operations
        .iter()
        .map(|op| (op.clone(), OpErrors::Unknown))
        .collect();
    let mut fatal_marker = None;

    for line in console.lines() {
        if fatal_marker.is_none() {
            if let Some(marker) = table.fatal_markers.iter().find(|m| line.contains(**m)) {
                fatal_marker = Some((*marker).to_string());
            }
        }

        if let Some(caps) = table.summary.captures(line) {
            if let Some(slot) = counts.get_mut(&caps["op"]) {
                if let Ok(errors) = caps["errors"].parse::<u64>() {
                    // later lines override earlier ones
                    *slot = OpErrors::Counted(errors);
                }
            }
        }
    }

    ScanOutcome {
        fatal_marker,
        counts,
    }
}
