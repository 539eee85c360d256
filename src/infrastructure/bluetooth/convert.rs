//! Firmware recording to CSV
//!
//! A recording is resampled onto a fixed 4 second grid. Bucket `i` of `N`
//! takes the waveform point at `round((len - 1) * i / (N - 1))`, and rows
//! whose values look like firmware placeholders are dropped.

use crate::domain::history_csv::{self, LocalZone, CSV_HEADER};
use crate::domain::models::{DeviceError, ErrorCode};
use crate::infrastructure::bluetooth::sdk::{OxyFile, OxySample};
use chrono::{DateTime, SecondsFormat};

/// Seconds covered by one CSV row
pub const BUCKET_SECONDS: u32 = 4;

/// How the Time column is rendered by a platform's converter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowTimeFormat {
    /// `HH:MM:SS Mon DD YYYY` in local time
    #[default]
    Legacy,
    /// RFC 3339 in UTC; rewritten to the legacy form before it is persisted
    Iso8601,
}

/// Waveform index represented by bucket `bucket` of `buckets`
pub fn bucket_index(bucket: usize, buckets: usize, len: usize) -> usize {
    if buckets <= 1 || len == 0 {
        return 0;
    }
    let scaled = (len - 1) as f64 * bucket as f64 / (buckets - 1) as f64;
    (scaled.round() as usize).min(len - 1)
}

/// Whether a sample carries a real reading. Either value in range keeps it.
pub fn is_plausible(sample: &OxySample) -> bool {
    (1..=149).contains(&sample.spo2) || (1..=349).contains(&sample.pulse_rate)
}

pub fn oxy_file_to_csv(
    file: &OxyFile,
    zone: LocalZone,
    format: RowTimeFormat,
) -> Result<String, DeviceError> {
    let mut lines = vec![CSV_HEADER.to_string()];
    let samples = &file.samples;
    if samples.is_empty() {
        return Ok(lines.join("\n"));
    }

    let duration = match file.recording_seconds {
        0 => samples.len() as u64 * u64::from(BUCKET_SECONDS),
        secs => u64::from(secs),
    };
    let buckets = (duration / u64::from(BUCKET_SECONDS)).max(1) as usize;

    for bucket in 0..buckets {
        let sample = &samples[bucket_index(bucket, buckets, samples.len())];
        if !is_plausible(sample) {
            continue;
        }
        let at = file
            .start_time
            .saturating_add(bucket as i64 * i64::from(BUCKET_SECONDS));
        lines.push(format!(
            "{},{},{},{},{},{}",
            render_time(at, zone, format)?,
            sample.spo2,
            sample.pulse_rate,
            sample.motion,
            u8::from(sample.spo2_warning),
            u8::from(sample.pr_warning),
        ));
    }

    Ok(lines.join("\n"))
}

fn render_time(epoch_secs: i64, zone: LocalZone, format: RowTimeFormat) -> Result<String, DeviceError> {
    let invalid = || {
        DeviceError::new(
            ErrorCode::ReadFileError,
            format!("Invalid recording timestamp {}", epoch_secs),
        )
    };
    match format {
        RowTimeFormat::Legacy => {
            let local = zone.to_local(epoch_secs).ok_or_else(invalid)?;
            Ok(history_csv::format_row_time(&local))
        }
        RowTimeFormat::Iso8601 => {
            let utc = DateTime::from_timestamp(epoch_secs, 0).ok_or_else(invalid)?;
            Ok(utc.to_rfc3339_opts(SecondsFormat::Secs, true))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::history_csv::{normalize_times, parse_rows};

    fn sample(spo2: u16, pulse_rate: u16) -> OxySample {
        OxySample {
            spo2,
            pulse_rate,
            ..Default::default()
        }
    }

    #[test]
    fn test_forty_seconds_makes_ten_buckets() {
        assert_eq!(bucket_index(0, 10, 37), 0);
        assert_eq!(bucket_index(9, 10, 37), 36);
        assert_eq!(bucket_index(0, 1, 37), 0);

        let samples: Vec<_> = (0..37).map(|i| sample(90, 50 + i)).collect();
        let file = OxyFile {
            start_time: 1_764_163_664,
            recording_seconds: 40,
            samples,
        };
        let csv = oxy_file_to_csv(&file, LocalZone::utc(), RowTimeFormat::Legacy).unwrap();
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines.len(), 11);
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], "13:27:44 Nov 26 2025,90,50,0,0,0");
        assert_eq!(lines[10], "13:28:20 Nov 26 2025,90,86,0,0,0");
    }

    #[test]
    fn test_implausible_rows_are_dropped() {
        assert!(is_plausible(&sample(0, 60)));
        assert!(is_plausible(&sample(97, 0)));
        assert!(!is_plausible(&sample(0, 0)));
        assert!(!is_plausible(&sample(255, 511)));
        assert!(is_plausible(&sample(149, 350)));
        assert!(!is_plausible(&sample(150, 350)));

        let file = OxyFile {
            start_time: 1_764_163_664,
            recording_seconds: 12,
            samples: vec![sample(97, 62), sample(255, 511), sample(96, 61)],
        };
        let csv = oxy_file_to_csv(&file, LocalZone::utc(), RowTimeFormat::Legacy).unwrap();
        assert_eq!(csv.lines().count(), 3);
        assert!(!csv.contains(",255,"));
    }

    #[test]
    fn test_empty_and_unsized_recordings() {
        let empty = OxyFile::default();
        assert_eq!(
            oxy_file_to_csv(&empty, LocalZone::utc(), RowTimeFormat::Legacy).unwrap(),
            CSV_HEADER
        );

        // No duration reported: one bucket per sample
        let file = OxyFile {
            start_time: 1_764_163_664,
            recording_seconds: 0,
            samples: vec![sample(97, 62), sample(96, 61), sample(95, 60)],
        };
        let csv = oxy_file_to_csv(&file, LocalZone::utc(), RowTimeFormat::Legacy).unwrap();
        assert_eq!(csv.lines().count(), 4);
    }

    #[test]
    fn test_iso_rows_normalize_to_legacy() {
        let file = OxyFile {
            start_time: 1_764_163_664,
            recording_seconds: 8,
            samples: vec![sample(97, 62), sample(96, 61)],
        };
        let csv = oxy_file_to_csv(&file, LocalZone::utc(), RowTimeFormat::Iso8601).unwrap();
        assert!(csv.contains("2025-11-26T13:27:44Z,97,62"));

        let normalized = normalize_times(&csv, LocalZone::utc());
        let rows = parse_rows(&normalized);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].pulse_rate, 61);
    }

    #[test]
    fn test_out_of_range_start_is_a_read_error() {
        let file = OxyFile {
            start_time: i64::MAX,
            recording_seconds: 4,
            samples: vec![sample(97, 62)],
        };
        let err = oxy_file_to_csv(&file, LocalZone::utc(), RowTimeFormat::Legacy).unwrap_err();
        assert_eq!(err.code, ErrorCode::ReadFileError);
    }
}
