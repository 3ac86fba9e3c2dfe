//! Collector-side parse of a fetched text block.

use tracing::{debug, warn};

use crate::bdt::END_OF_DATA;

const SERVER_TIME_KEY: &str = "server time";
const DELAY_TIME_KEY: &str = "delay time";
const ODR_KEY: &str = "accelometer ODR";

/// One data row: row number, record time stamp (first row of a record
/// only) and up to three axis samples.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRow {
    pub row: u32,
    pub time_s: Option<f64>,
    pub samples: Vec<i16>,
}

/// A complete block as received by the collector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capture {
    /// Header values, `"unknown"` when the line is missing.
    pub server_time: String,
    pub delay: String,
    pub odr: String,
    pub rows: Vec<CaptureRow>,
    /// Raw text as received, trailer included.
    pub text: String,
}

impl Capture {
    /// Parse the concatenated chunks.
    ///
    /// Malformed or short rows are skipped; parsing stops at the trailer.
    pub fn parse(text: &str) -> Self {
        let mut lines = text.lines();
        let mut header = |key: &str| {
            lines
                .next()
                .map(|line| header_value(line, key))
                .unwrap_or_else(|| "unknown".to_string())
        };
        let server_time = header(SERVER_TIME_KEY);
        let delay = header(DELAY_TIME_KEY);
        let odr = header(ODR_KEY);
        // column titles
        lines.next();

        let mut rows = Vec::new();
        for (n, line) in lines.enumerate() {
            if line.contains(END_OF_DATA.trim_end()) {
                break;
            }
            if line.len() < 7 {
                debug!(line = n, "Incomplete row");
                continue;
            }
            match parse_row(line) {
                Some(row) => rows.push(row),
                None => warn!(line = n, text = %line, "Malformed row"),
            }
        }
        Self {
            server_time,
            delay,
            odr,
            rows,
            text: text.to_string(),
        }
    }

    /// Accelerometer output data rate, if the header carried one.
    pub fn odr_hz(&self) -> Option<u32> {
        self.odr.trim_end_matches("Hz").trim().parse().ok()
    }

    /// Number of axis samples over all rows.
    pub fn sample_count(&self) -> usize {
        self.rows.iter().map(|r| r.samples.len()).sum()
    }
}

/// Value after the first `:` of a `key : value` line.
fn header_value(line: &str, key: &str) -> String {
    match line.find(key).and(line.find(':')) {
        Some(idx) if idx >= key.len() => line[idx + 1..].trim().to_string(),
        _ => "unknown".to_string(),
    }
}

fn parse_row(line: &str) -> Option<CaptureRow> {
    let mut cols = line.split(',').map(str::trim);
    let row = cols.next()?.parse().ok()?;
    let time_s = match cols.next()? {
        "" => None,
        t => Some(t.parse().ok()?),
    };
    let samples = cols
        .map(|c| c.parse().ok())
        .collect::<Option<Vec<i16>>>()?;
    Some(CaptureRow {
        row,
        time_s,
        samples,
    })
}
