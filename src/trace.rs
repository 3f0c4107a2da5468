//! Raw per-thread sample traces.
//!
//! Every accepted sample appends one line to `ebstrace.raw.<pid>.<thread>`:
//!
//! ```text
//! $ | <timestamp> | <delta-begin> | <delta-end> | <m1> .. <mN> | <callpath-id> | <pc> [<caller> ..]
//! ```
//!
//! Timestamps are microseconds since the epoch. The deltas bound the
//! interval the metric values cover, in monotonic microseconds since
//! sampling started on the thread. At finalization the raw trace is scanned and
//! `ebstrace.def.<pid>.<thread>` maps every call-path id and address in it
//! to a name.

use std::collections::BTreeSet;
use std::fmt::{self, Write as _};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::SamplerError;
use crate::util::FixedBuf;

pub const TRACE_LINE_CAPACITY: usize = 1536;

#[derive(Debug, Clone, Copy)]
pub struct TraceRecord<'a> {
    pub timestamp: u64,
    pub delta_begin: u64,
    pub delta_end: u64,
    pub metrics: &'a [f64],
    pub callpath_id: usize,
    pub pcs: &'a [u64],
}

pub fn format_record<const N: usize>(record: &TraceRecord, buf: &mut FixedBuf<N>) -> fmt::Result {
    write!(
        buf,
        "$ | {} | {} | {} | ",
        record.timestamp, record.delta_begin, record.delta_end
    )?;
    for (i, metric) in record.metrics.iter().enumerate() {
        if i > 0 {
            buf.write_char(' ')?;
        }
        write!(buf, "{}", metric)?;
    }
    write!(buf, " | {} |", record.callpath_id)?;
    for pc in record.pcs {
        write!(buf, " {:#x}", pc)?;
    }
    buf.write_char('\n')
}

pub fn raw_trace_path(dir: &Path, pid: u32, thread: usize) -> PathBuf {
    dir.join(format!("ebstrace.raw.{}.{}", pid, thread))
}

pub fn definitions_path(dir: &Path, pid: u32, thread: usize) -> PathBuf {
    dir.join(format!("ebstrace.def.{}.{}", pid, thread))
}

/// A raw trace opened ahead of time so the signal handler only writes.
#[derive(Debug)]
pub struct TraceFile {
    file: File,
    path: PathBuf,
}

impl TraceFile {
    pub fn create(dir: &Path, pid: u32, thread: usize) -> Result<Self, SamplerError> {
        let path = raw_trace_path(dir, pid, thread);
        let file = File::create(&path).map_err(|io| SamplerError::Trace {
            path: path.clone(),
            io,
        })?;
        Ok(TraceFile { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Async-signal-safe: formats on the stack and issues plain writes.
    /// Records that do not fit a line are cut short but still terminated.
    pub fn write_record(&self, record: &TraceRecord) {
        let mut buf = FixedBuf::<TRACE_LINE_CAPACITY>::new();
        if format_record(record, &mut buf).is_err() {
            buf.clear();
            let _ = writeln!(
                buf,
                "$ | {} | {} | {} |  | {} | truncated",
                record.timestamp, record.delta_begin, record.delta_end, record.callpath_id
            );
        }
        let _ = (&self.file).write_all(buf.as_bytes());
    }
}

/// Call-path ids and addresses referenced by a raw trace.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TraceReferences {
    pub callpaths: BTreeSet<usize>,
    pub addresses: BTreeSet<u64>,
}

fn parse_line(line: &str, refs: &mut TraceReferences) {
    let mut fields = line.split(" | ");
    if fields.next() != Some("$") {
        return;
    }
    let Some(callpath) = fields.nth(4) else {
        return;
    };
    if let Ok(id) = callpath.trim().parse::<usize>() {
        refs.callpaths.insert(id);
    }
    if let Some(pcs) = fields.next() {
        refs.addresses.extend(
            pcs.split_whitespace()
                .filter_map(|pc| u64::from_str_radix(pc.trim_start_matches("0x"), 16).ok()),
        );
    }
}

pub fn scan_raw_trace(path: &Path) -> io::Result<TraceReferences> {
    let mut refs = TraceReferences::default();
    for line in BufReader::new(File::open(path)?).lines() {
        parse_line(&line?, &mut refs);
    }
    Ok(refs)
}

pub fn write_definitions<'a, N, D>(
    path: &Path,
    metrics: impl Iterator<Item = &'a str>,
    refs: &TraceReferences,
    callpath_name: N,
    address_name: D,
) -> io::Result<()>
where
    N: Fn(usize) -> Option<String>,
    D: Fn(u64) -> String,
{
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "# metrics | {}", metrics.collect::<Vec<_>>().join(" "))?;
    for id in &refs.callpaths {
        let name = callpath_name(*id).unwrap_or_else(|| "UNKNOWN".to_string());
        writeln!(out, "# callpath {} | {}", id, name)?;
    }
    for address in &refs.addresses {
        writeln!(out, "# address {:#x} | {}", address, address_name(*address))?;
    }
    out.flush()
}
