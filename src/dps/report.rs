//! Export of a finished cycle's logs.
//!
//! One file per cycle, named after the completion time. CSV output needs the
//! `storage_csv` feature (on by default); JSON is always available.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::ReportFormat;
use crate::error::AppResult;
use crate::runner::Cell;

use super::log::{Check, DpsLog};

/// Flat row of the CSV report.
#[derive(Debug, Serialize)]
struct ReportRow<'a> {
    column: u32,
    row: u32,
    tested_at: String,
    operation_successful: bool,
    fw_uploaded: bool,
    fw_upload_message: &'a str,
    led_current_primary_ma: Option<f64>,
    led_current_primary_passed: Option<bool>,
    led_current_secondary_ma: Option<f64>,
    led_current_secondary_passed: Option<bool>,
    button_led_voltage_mv: Option<f64>,
    button_led_voltage_passed: Option<bool>,
    feedback_voltage_mv: Option<f64>,
    feedback_voltage_passed: Option<bool>,
    fixture_error: Option<&'a str>,
}

impl<'a> ReportRow<'a> {
    fn from_log(log: &'a DpsLog) -> Self {
        let value = |check: Option<Check>| check.and_then(|c| c.value);
        let passed = |check: Option<Check>| check.map(|c| c.passed);
        let results = &log.results;
        Self {
            column: log.cell.column,
            row: log.cell.row,
            tested_at: log.tested_at.to_rfc3339(),
            operation_successful: log.operation_successful(),
            fw_uploaded: log.fw_uploaded,
            fw_upload_message: log.fw_upload_message.trim(),
            led_current_primary_ma: value(results.led_current_primary),
            led_current_primary_passed: passed(results.led_current_primary),
            led_current_secondary_ma: value(results.led_current_secondary),
            led_current_secondary_passed: passed(results.led_current_secondary),
            button_led_voltage_mv: value(results.button_led_voltage),
            button_led_voltage_passed: passed(results.button_led_voltage),
            feedback_voltage_mv: value(results.feedback_voltage),
            feedback_voltage_passed: passed(results.feedback_voltage),
            fixture_error: log.fixture_error.as_deref(),
        }
    }
}

/// Write `logs` into `dir` and return the created file.
///
/// # Errors
///
/// Fails when the directory cannot be created, the file cannot be written,
/// or CSV was requested without the `storage_csv` feature.
pub fn write_report(
    dir: &Path,
    format: ReportFormat,
    logs: &BTreeMap<Cell, DpsLog>,
    finished_at: DateTime<Utc>,
) -> AppResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let stem = format!("dps_report_{}", finished_at.format("%Y%m%d_%H%M%S"));

    let path = match format {
        ReportFormat::Csv => {
            let path = dir.join(format!("{stem}.csv"));
            write_csv(&path, logs)?;
            path
        }
        ReportFormat::Json => {
            let path = dir.join(format!("{stem}.json"));
            let records: Vec<&DpsLog> = logs.values().collect();
            let body = serde_json::to_string_pretty(&records)?;
            fs::write(&path, body)?;
            path
        }
    };

    let passed = logs.values().filter(|log| log.operation_successful()).count();
    info!(path = %path.display(), cells = logs.len(), passed, "cycle report written");
    Ok(path)
}

#[cfg(feature = "storage_csv")]
fn write_csv(path: &Path, logs: &BTreeMap<Cell, DpsLog>) -> AppResult<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for log in logs.values() {
        writer.serialize(ReportRow::from_log(log))?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(not(feature = "storage_csv"))]
fn write_csv(_path: &Path, _logs: &BTreeMap<Cell, DpsLog>) -> AppResult<()> {
    Err(crate::error::CncError::Report(
        "CSV support not enabled. Rebuild with --features storage_csv".to_string(),
    ))
}
