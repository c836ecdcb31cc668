//! Parsers for the measurement binaries' CSV output.
//!
//! Both the receiver and the transmitters append one row per reporting
//! period under a header row. Files are read while still being written, so
//! an unterminated last line is treated as not yet present.

use std::collections::HashMap;

use crate::config::{RigPaths, TC_COUNT};
use crate::model::{RawSnapshot, TxClassSample};

use super::traits::FileSystem;

/// Column of the Mbit/s figure in header-less transmitter reports
/// (`time,packets,bytes,pps,mbps,errors`).
const TX_MBPS_COLUMN: usize = 4;

/// Error type for malformed counter rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// Non-empty, newline-terminated lines of `content`.
fn complete_lines(content: &str) -> Vec<&str> {
    let flushed = match content.rfind('\n') {
        Some(end) => &content[..end],
        None => "",
    };
    flushed.lines().filter(|l| !l.trim().is_empty()).collect()
}

fn parse_counter(value: &str) -> Option<u64> {
    let value = value.trim();
    value.parse::<u64>().ok().or_else(|| {
        value
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v as u64)
    })
}

struct Row<'a> {
    fields: HashMap<&'a str, &'a str>,
}

impl<'a> Row<'a> {
    fn new(header: &'a str, row: &'a str) -> Result<Self, ParseError> {
        let names: Vec<&str> = header.split(',').map(str::trim).collect();
        let values: Vec<&str> = row.split(',').map(str::trim).collect();
        if names.len() != values.len() {
            return Err(ParseError::new(format!(
                "row has {} fields, header has {}",
                values.len(),
                names.len()
            )));
        }
        Ok(Self {
            fields: names.into_iter().zip(values).collect(),
        })
    }

    fn counter(&self, name: &str) -> Result<u64, ParseError> {
        let raw = self
            .fields
            .get(name)
            .ok_or_else(|| ParseError::new(format!("missing column '{name}'")))?;
        parse_counter(raw).ok_or_else(|| ParseError::new(format!("bad {name}: '{raw}'")))
    }

    fn optional_counter(&self, name: &str) -> Result<u64, ParseError> {
        match self.fields.get(name) {
            Some(_) => self.counter(name),
            None => Ok(0),
        }
    }

    fn optional_rate(&self, name: &str) -> Option<f64> {
        self.fields
            .get(name)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }
}

/// Parses the last complete row of the receiver's counter file.
///
/// Columns are located by header name. Returns `Ok(None)` until the file
/// holds a header plus at least one data row.
pub fn parse_counter_csv(content: &str) -> Result<Option<RawSnapshot>, ParseError> {
    let lines = complete_lines(content);
    if lines.len() < 2 {
        return Ok(None);
    }
    let row = Row::new(lines[0], lines[lines.len() - 1])?;

    let time_s = row
        .optional_rate("time_s")
        .ok_or_else(|| ParseError::new("missing or bad column 'time_s'"))?;

    let mut pcp_pkts = [0u64; TC_COUNT];
    for (tc, slot) in pcp_pkts.iter_mut().enumerate() {
        *slot = row.counter(&format!("pcp{tc}_pkts"))?;
    }

    Ok(Some(RawSnapshot {
        time_s,
        total_pkts: row.counter("total_pkts")?,
        pcp_pkts,
        vlan_pkts: row.optional_counter("vlan_pkts")?,
        non_vlan_pkts: row.optional_counter("non_vlan_pkts")?,
        seq_pkts: row.optional_counter("seq_pkts")?,
        embedded_pcp_pkts: row.optional_counter("embedded_pcp_pkts")?,
        drops: row.optional_counter("drops")?,
        total_pps: row.optional_rate("total_pps"),
        total_mbps: row.optional_rate("total_mbps"),
    }))
}

/// Parses the Mbit/s figure from the last row of a transmitter report.
pub fn parse_tx_report(content: &str) -> Option<f64> {
    let lines = complete_lines(content);
    if lines.len() < 2 {
        return None;
    }
    let column = lines[0]
        .split(',')
        .position(|name| name.trim() == "mbps")
        .unwrap_or(TX_MBPS_COLUMN);
    lines[lines.len() - 1]
        .split(',')
        .nth(column)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
}

/// Reads every transmitter's report, preferring the primary file name.
pub fn read_tx_sample<F: FileSystem>(fs: &F, paths: &RigPaths) -> TxClassSample {
    let mut sample = TxClassSample::default();
    for (tc, slot) in sample.mbps.iter_mut().enumerate() {
        let primary = paths.tx_stats_path(tc);
        let alt = paths.tx_stats_alt_path(tc);
        let path = if !fs.exists(&primary) && fs.exists(&alt) {
            alt
        } else {
            primary
        };
        *slot = fs
            .read_to_string(&path)
            .ok()
            .and_then(|content| parse_tx_report(&content))
            .unwrap_or(0.0);
    }
    sample
}
