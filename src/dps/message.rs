//! Operator-facing text for finished cells.

use std::fmt::Write;

use crate::config::FirmwareConfig;

use super::log::{Check, DpsLog};

/// Builds the messages shown to the operator for a finished cell.
pub struct MessageFormatter;

impl MessageFormatter {
    /// Summary of a passing cell.
    pub fn ok_message(firmware: &FirmwareConfig, log: &DpsLog) -> String {
        let mut message = format!(
            "[{},{}] [programming]: uploaded {}\n",
            log.cell.column,
            log.cell.row,
            firmware.file_name()
        );
        let lines = [
            ("LED current (mode 1)", log.results.led_current_primary, "mA"),
            ("LED current (mode 2)", log.results.led_current_secondary, "mA"),
            ("button LED voltage", log.results.button_led_voltage, "mV"),
            ("feedback resistor voltage", log.results.feedback_voltage, "mV"),
        ];
        for (name, check, unit) in lines {
            if let Some(check) = check {
                let _ = writeln!(
                    message,
                    "[{},{}] [testing]: {name} {} {unit}",
                    log.cell.column,
                    log.cell.row,
                    format_value(&check)
                );
            }
        }
        message
    }

    /// Every problem of a failed cell, one line each. Empty for a passing
    /// cell.
    pub fn error_message(log: &DpsLog) -> String {
        let (column, row) = (log.cell.column, log.cell.row);
        if !log.fw_uploaded {
            return format!(
                "ERROR [{column},{row}] [programming]: {}\n",
                log.fw_upload_message.trim()
            );
        }

        let mut message = String::new();
        if let Some(error) = &log.fixture_error {
            let _ = writeln!(message, "ERROR [{column},{row}] [testing]: {error}");
        }
        let checks = [
            ("LED current (mode 1)", log.results.led_current_primary, "mA"),
            ("LED current (mode 2)", log.results.led_current_secondary, "mA"),
            ("button LED voltage", log.results.button_led_voltage, "mV"),
            ("feedback resistor voltage", log.results.feedback_voltage, "mV"),
        ];
        for (name, check, unit) in checks {
            let Some(check) = check else { continue };
            if !check.passed {
                let _ = writeln!(
                    message,
                    "ERROR [{column},{row}] [testing]: {name} out of spec {} {unit} x ({}, {}) {unit}",
                    format_value(&check),
                    check.range.low,
                    check.range.high
                );
            }
        }
        message
    }
}

fn format_value(check: &Check) -> String {
    match check.value {
        Some(value) => format!("{value:.0}"),
        None => "unavailable".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FirmwareKind, Range};
    use crate::runner::Cell;
    use std::path::PathBuf;

    fn firmware() -> FirmwareConfig {
        FirmwareConfig {
            path: PathBuf::from("/srv/fw/thule_flash.hex"),
            kind: FirmwareKind::Flash,
            button_hold_ms: 300,
            led_current_primary_ma: Range::new(90.0, 110.0),
            led_current_secondary_ma: Some(Range::new(40.0, 60.0)),
            button_led_voltage_mv: Range::new(1800.0, 2200.0),
            feedback_voltage_mv: Range::new(100.0, 140.0),
        }
    }

    #[test]
    fn test_upload_error_message() {
        let mut log = DpsLog::new(Cell::new(2, 1));
        log.fw_upload_message = "Device ID mismatch\n".to_string();

        assert_eq!(
            MessageFormatter::error_message(&log),
            "ERROR [2,1] [programming]: Device ID mismatch\n"
        );
    }

    #[test]
    fn test_failed_checks_listed() {
        let fw = firmware();
        let mut log = DpsLog::new(Cell::new(0, 2));
        log.fw_uploaded = true;
        log.results.led_current_primary =
            Some(Check::evaluate(Some(100.0), fw.led_current_primary_ma));
        log.results.led_current_secondary = Some(Check::evaluate(
            Some(72.4),
            fw.led_current_secondary_ma.unwrap(),
        ));
        log.results.feedback_voltage = Some(Check::evaluate(None, fw.feedback_voltage_mv));

        let message = MessageFormatter::error_message(&log);
        let lines: Vec<&str> = message.lines().collect();
        assert_eq!(
            lines,
            vec![
                "ERROR [0,2] [testing]: LED current (mode 2) out of spec 72 mA x (40, 60) mA",
                "ERROR [0,2] [testing]: feedback resistor voltage out of spec unavailable mV x (100, 140) mV",
            ]
        );
    }

    #[test]
    fn test_ok_message() {
        let fw = firmware();
        let mut log = DpsLog::new(Cell::new(1, 0));
        log.fw_uploaded = true;
        log.results.led_current_primary =
            Some(Check::evaluate(Some(101.2), fw.led_current_primary_ma));

        let message = MessageFormatter::ok_message(&fw, &log);
        assert!(message.starts_with("[1,0] [programming]: uploaded thule_flash.hex\n"));
        assert!(message.contains("LED current (mode 1) 101 mA"));
        assert!(MessageFormatter::error_message(&log).is_empty());
    }
}
