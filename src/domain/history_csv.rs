//! History CSV format
//!
//! Persisted recordings are CSV files with a fixed header:
//!
//! ```text
//! Time,Oxygen Level,Pulse Rate,Motion,O2 Reminder,PR Reminder
//! 01:34:42 Oct 21 2025,97,62,0,0,0
//! ```
//!
//! Files live under a patient directory and are named
//! `O2Ring <serial suffix>_<YYYYMMDDhhmmss>.csv`. The 14-digit suffix equals
//! the identifier the ring firmware assigns to the recording, which is how
//! already-downloaded files are recognised.

use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone};

pub const CSV_HEADER: &str = "Time,Oxygen Level,Pulse Rate,Motion,O2 Reminder,PR Reminder";

/// Legacy row time format, e.g. `01:34:42 Oct 21 2025`
pub const LEGACY_TIME_FORMAT: &str = "%H:%M:%S %b %d %Y";
/// Alternate row time format, e.g. `01:34:42 21/10/2025`
pub const DMY_TIME_FORMAT: &str = "%H:%M:%S %d/%m/%Y";
const FILE_STAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const FILE_LABEL: &str = "O2Ring";

/// Zone used to render recording times as wall-clock values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalZone {
    #[default]
    Host,
    Fixed(FixedOffset),
}

impl LocalZone {
    /// Offsets beyond a day fall back to the host zone
    pub fn from_offset_minutes(minutes: Option<i32>) -> Self {
        minutes
            .and_then(|m| m.checked_mul(60))
            .and_then(FixedOffset::east_opt)
            .map(Self::Fixed)
            .unwrap_or(Self::Host)
    }

    pub fn utc() -> Self {
        Self::from_offset_minutes(Some(0))
    }

    /// Wall-clock time for a Unix timestamp in seconds
    pub fn to_local(&self, epoch_secs: i64) -> Option<NaiveDateTime> {
        let utc = DateTime::from_timestamp(epoch_secs, 0)?;
        Some(match self {
            Self::Host => utc.with_timezone(&Local).naive_local(),
            Self::Fixed(offset) => utc.with_timezone(offset).naive_local(),
        })
    }

    /// Unix seconds of a wall-clock time in this zone
    pub fn to_epoch(&self, local: &NaiveDateTime) -> Option<i64> {
        match self {
            Self::Host => Local.from_local_datetime(local).earliest().map(|t| t.timestamp()),
            Self::Fixed(offset) => offset.from_local_datetime(local).single().map(|t| t.timestamp()),
        }
    }

    fn convert<Tz: TimeZone>(&self, time: &DateTime<Tz>) -> NaiveDateTime {
        match self {
            Self::Host => time.with_timezone(&Local).naive_local(),
            Self::Fixed(offset) => time.with_timezone(offset).naive_local(),
        }
    }
}

pub fn format_row_time(time: &NaiveDateTime) -> String {
    time.format(LEGACY_TIME_FORMAT).to_string()
}

/// Filename for a recording, or `None` when the start time is out of range
pub fn history_file_name(serial_suffix: &str, start_time: i64, zone: LocalZone) -> Option<String> {
    let local = zone.to_local(start_time)?;
    Some(format!(
        "{} {}_{}.csv",
        FILE_LABEL,
        serial_suffix,
        local.format(FILE_STAMP_FORMAT)
    ))
}

/// Recording start encoded in a 14-digit firmware file identifier
pub fn file_stamp_to_epoch(stamp: &str, zone: LocalZone) -> Option<i64> {
    let local = NaiveDateTime::parse_from_str(stamp.trim(), FILE_STAMP_FORMAT).ok()?;
    zone.to_epoch(&local)
}

/// The 14-digit timestamp after the last `_` of a `.csv` filename
pub fn timestamp_suffix(file_name: &str) -> Option<&str> {
    let lower = file_name.to_ascii_lowercase();
    if !lower.ends_with(".csv") {
        return None;
    }
    let base = &file_name[..file_name.len() - 4];
    let core = base.rsplit('_').next().unwrap_or(base).trim();

    if core.len() == 14 && core.bytes().all(|b| b.is_ascii_digit()) {
        Some(core)
    } else {
        None
    }
}

/// Parse a Time column value in any of the accepted formats
pub fn parse_row_time(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, LEGACY_TIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(value, DMY_TIME_FORMAT))
        .ok()
}

/// Rewrite ISO-8601 Time values to the legacy format so every persisted file
/// parses with [`parse_row_time`]. Other lines pass through untouched.
pub fn normalize_times(csv: &str, zone: LocalZone) -> String {
    csv.lines()
        .map(|line| {
            let (first, rest) = match line.split_once(',') {
                Some((first, rest)) => (first, Some(rest)),
                None => (line, None),
            };
            match DateTime::parse_from_rfc3339(first.trim()) {
                Ok(time) => {
                    let local = format_row_time(&zone.convert(&time));
                    match rest {
                        Some(rest) => format!("{},{}", local, rest),
                        None => local,
                    }
                }
                Err(_) => line.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// One chartable row of a history CSV
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CsvRow {
    pub time: NaiveDateTime,
    pub spo2: u16,
    pub pulse_rate: u16,
}

/// Parse a history CSV for display. Columns are located by header name,
/// rows that do not parse are skipped.
pub fn parse_rows(csv: &str) -> Vec<CsvRow> {
    let normalized = csv.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines = normalized.lines().filter(|l| !l.trim().is_empty());

    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let columns: Vec<String> = header.split(',').map(|h| h.trim().to_ascii_lowercase()).collect();
    let find = |name: &str| columns.iter().position(|c| c == name);
    let (Some(idx_time), Some(idx_spo2), Some(idx_pr)) =
        (find("time"), find("oxygen level"), find("pulse rate"))
    else {
        return Vec::new();
    };
    let width = idx_time.max(idx_spo2).max(idx_pr);

    lines
        .filter_map(|line| {
            let cols: Vec<&str> = line.split(',').collect();
            if cols.len() <= width {
                return None;
            }
            Some(CsvRow {
                time: parse_row_time(cols[idx_time])?,
                spo2: leading_number(cols[idx_spo2])?,
                pulse_rate: leading_number(cols[idx_pr])?,
            })
        })
        .collect()
}

/// First run of digits (and dots) in a cell, rounded
fn leading_number(cell: &str) -> Option<u16> {
    let start = cell.find(|c: char| c.is_ascii_digit() || c == '.')?;
    let run: String = cell[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let value: f64 = run.parse().ok()?;
    Some(value.round().clamp(0.0, f64::from(u16::MAX)) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, hh: u32, mm: u32, ss: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(hh, mm, ss)
            .unwrap()
    }

    #[test]
    fn test_timestamp_suffix() {
        assert_eq!(
            timestamp_suffix("O2Ring 1A2B_20251126132744.csv"),
            Some("20251126132744")
        );
        assert_eq!(timestamp_suffix("20251126132744.CSV"), Some("20251126132744"));
        assert_eq!(timestamp_suffix("O2Ring_2025112613274.csv"), None);
        assert_eq!(timestamp_suffix("O2Ring_20251126132744.txt"), None);
        assert_eq!(timestamp_suffix("notes_final.csv"), None);
    }

    #[test]
    fn test_history_file_name_round_trips_suffix() {
        // 2025-11-26 13:27:44 UTC
        let name = history_file_name("1A2B", 1_764_163_664, LocalZone::utc()).unwrap();
        assert_eq!(name, "O2Ring 1A2B_20251126132744.csv");
        assert_eq!(timestamp_suffix(&name), Some("20251126132744"));

        let plus_two = LocalZone::from_offset_minutes(Some(120));
        let name = history_file_name("1A2B", 1_764_163_664, plus_two).unwrap();
        assert_eq!(name, "O2Ring 1A2B_20251126152744.csv");
    }

    #[test]
    fn test_file_stamp_to_epoch() {
        assert_eq!(
            file_stamp_to_epoch("20251126132744", LocalZone::utc()),
            Some(1_764_163_664)
        );
        let plus_two = LocalZone::from_offset_minutes(Some(120));
        assert_eq!(
            file_stamp_to_epoch("20251126152744", plus_two),
            Some(1_764_163_664)
        );
        assert_eq!(file_stamp_to_epoch("not-a-stamp", LocalZone::utc()), None);
    }

    #[test]
    fn test_out_of_range_offsets_use_host_zone() {
        assert_eq!(LocalZone::from_offset_minutes(Some(50_000_000)), LocalZone::Host);
        assert_eq!(LocalZone::from_offset_minutes(Some(i32::MIN)), LocalZone::Host);
        assert_eq!(LocalZone::from_offset_minutes(Some(24 * 60)), LocalZone::Host);
        assert_eq!(LocalZone::from_offset_minutes(None), LocalZone::Host);
        assert_eq!(
            LocalZone::from_offset_minutes(Some(-330)),
            LocalZone::Fixed(FixedOffset::west_opt(330 * 60).unwrap())
        );
    }

    #[test]
    fn test_parse_both_time_formats() {
        assert_eq!(
            parse_row_time("01:34:42 Oct 21 2025"),
            Some(at(2025, 10, 21, 1, 34, 42))
        );
        assert_eq!(
            parse_row_time("01:34:42 21/10/2025"),
            Some(at(2025, 10, 21, 1, 34, 42))
        );
        assert_eq!(parse_row_time("2025-10-21 01:34"), None);
    }

    #[test]
    fn test_normalize_iso_times() {
        let csv = format!(
            "{}\n2025-10-21T01:34:42+00:00,97,62,0,0,0\n2025-10-21T01:34:46Z,96,61,1,0,1",
            CSV_HEADER
        );
        let out = normalize_times(&csv, LocalZone::utc());
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], "01:34:42 Oct 21 2025,97,62,0,0,0");
        assert_eq!(lines[2], "01:34:46 Oct 21 2025,96,61,1,0,1");
    }

    #[test]
    fn test_parse_rows_skips_bad_lines() {
        let csv = "Time, Oxygen Level ,Pulse Rate,Motion\r\n\
                   01:34:42 Oct 21 2025,97%,62 bpm,0\r\n\
                   garbage,1,2,3\r\n\
                   01:34:46 21/10/2025,96,61,1\r\n\
                   01:34:50 Oct 21 2025,95\r\n";
        let rows = parse_rows(csv);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].spo2, 97);
        assert_eq!(rows[0].pulse_rate, 62);
        assert_eq!(rows[1].time, at(2025, 10, 21, 1, 34, 46));
    }

    #[test]
    fn test_parse_rows_requires_header_columns() {
        assert!(parse_rows("Time,Pulse Rate\n01:34:42 Oct 21 2025,60").is_empty());
        assert!(parse_rows("").is_empty());
    }
}
