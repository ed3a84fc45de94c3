use anyhow::{Context, Result};
use std::io::Write;
use tracing::warn;

use catcierge_vision::Direction;

/// Append-only CSV record log. Two record kinds: one line per frame verdict
/// and one per RFID evaluation.
pub struct CsvLog {
    file: Option<std::fs::File>,
}

impl CsvLog {
    pub fn open(path: Option<&str>) -> Result<Self> {
        let file = match path {
            Some(p) => Some(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(p)
                    .with_context(|| format!("open match log {}", p))?,
            ),
            None => None,
        };
        Ok(Self { file })
    }

    pub fn disabled() -> Self {
        Self { file: None }
    }

    fn write_line(&mut self, line: &str) {
        if let Some(f) = &mut self.file {
            if let Err(e) = writeln!(f, "{}", line) {
                warn!("match log write failed: {}", e);
            }
        }
    }

    pub fn log_match(
        &mut self,
        success: bool,
        score: f64,
        threshold: f64,
        path: Option<&str>,
        direction: Direction,
    ) {
        self.write_line(&format_match_line(success, score, threshold, path, direction));
    }

    pub fn log_rfid_check(&mut self, ok: bool) {
        self.write_line(&format_rfid_line(ok));
    }
}

pub fn format_match_line(
    success: bool,
    score: f64,
    threshold: f64,
    path: Option<&str>,
    direction: Direction,
) -> String {
    format!(
        "match, {}, {:.6}, {:.6}, {}, {}",
        if success { "success" } else { "failure" },
        score,
        threshold,
        path.filter(|p| !p.is_empty()).unwrap_or("-"),
        direction
    )
}

pub fn format_rfid_line(ok: bool) -> String {
    format!("rfid_check, {}", if ok { "ok" } else { "lockout" })
}

/// Parsed form of one log line.
#[derive(Debug, Clone, PartialEq)]
pub enum CsvRecord {
    Match {
        success: bool,
        score: f64,
        threshold: f64,
        path: Option<String>,
        direction: Direction,
    },
    RfidCheck {
        ok: bool,
    },
}

pub fn parse_line(line: &str) -> Result<CsvRecord> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    match fields.as_slice() {
        ["match", outcome, score, threshold, path, direction] => {
            let success = match *outcome {
                "success" => true,
                "failure" => false,
                other => anyhow::bail!("bad match outcome \"{}\"", other),
            };
            let direction = match *direction {
                "in" => Direction::In,
                "out" => Direction::Out,
                "unknown" => Direction::Unknown,
                other => anyhow::bail!("bad direction \"{}\"", other),
            };
            Ok(CsvRecord::Match {
                success,
                score: score.parse().context("match score")?,
                threshold: threshold.parse().context("match threshold")?,
                path: if *path == "-" { None } else { Some(path.to_string()) },
                direction,
            })
        }
        ["rfid_check", outcome] => match *outcome {
            "ok" => Ok(CsvRecord::RfidCheck { ok: true }),
            "lockout" => Ok(CsvRecord::RfidCheck { ok: false }),
            other => anyhow::bail!("bad rfid_check outcome \"{}\"", other),
        },
        _ => anyhow::bail!("unrecognized log line \"{}\"", line),
    }
}
