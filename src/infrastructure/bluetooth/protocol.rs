//! O2Ring protocol helpers
//!
//! Normalisation of the loosely typed values the vendor SDKs hand back:
//! advertised names, comma separated file lists, progress reported either
//! as a fraction or as a percentage, numbers embedded in strings.

/// Name fragments identifying a ring among generic BLE advertisers
pub const SUPPORTED_NAME_TOKENS: &[&str] = &["o2ring", "o2 ring"];

/// Name used when a device advertises none
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown";

/// Whether an advertised name belongs to a supported ring
pub fn matches_ring_name(raw: &str) -> bool {
    let normalized = raw.trim().to_lowercase();
    if normalized.is_empty() {
        return false;
    }
    SUPPORTED_NAME_TOKENS
        .iter()
        .any(|token| normalized.contains(token))
}

/// Split the firmware file list on `,`, `;` or newlines
pub fn parse_file_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c == ';' || c == '\n' || c == '\r')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Unit an SDK reports read progress in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUnit {
    /// 0-100
    Percent,
    /// 0.0-1.0. Values above 1.0 are taken as percentages already.
    Fraction,
}

/// Progress as a 0-100 percentage. A reported `1.0` means done for a
/// fraction SDK and one percent for a percentage SDK.
pub fn normalize_progress(progress: f64, unit: ProgressUnit) -> u8 {
    if !progress.is_finite() {
        return 0;
    }
    let percent = match unit {
        ProgressUnit::Fraction if progress <= 1.0 => progress * 100.0,
        ProgressUnit::Fraction | ProgressUnit::Percent => progress,
    };
    percent.round().clamp(0.0, 100.0) as u8
}

/// Integer from a firmware string field. Falls back to the digits (and a
/// minus sign) it contains when the whole value does not parse.
pub fn parse_integer(raw: &str) -> Option<i32> {
    let trimmed = raw.trim();
    if let Ok(value) = trimmed.parse() {
        return Some(value);
    }
    let digits: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_ring_name() {
        assert!(matches_ring_name("O2Ring 1A2B"));
        assert!(matches_ring_name("  o2 ring"));
        assert!(!matches_ring_name("Heart Strap"));
        assert!(!matches_ring_name(""));
    }

    #[test]
    fn test_parse_file_list() {
        assert_eq!(
            parse_file_list("20251126132744, 20251127010203;\n20251128020304,,"),
            vec!["20251126132744", "20251127010203", "20251128020304"]
        );
        assert!(parse_file_list(" , ").is_empty());
    }

    #[test]
    fn test_normalize_fraction_progress() {
        assert_eq!(normalize_progress(0.5, ProgressUnit::Fraction), 50);
        assert_eq!(normalize_progress(1.0, ProgressUnit::Fraction), 100);
        assert_eq!(normalize_progress(42.4, ProgressUnit::Fraction), 42);
        assert_eq!(normalize_progress(-3.0, ProgressUnit::Fraction), 0);
        assert_eq!(normalize_progress(f64::NAN, ProgressUnit::Fraction), 0);
    }

    #[test]
    fn test_percent_progress_keeps_small_values() {
        assert_eq!(normalize_progress(1.0, ProgressUnit::Percent), 1);
        assert_eq!(normalize_progress(0.4, ProgressUnit::Percent), 0);
        assert_eq!(normalize_progress(42.4, ProgressUnit::Percent), 42);
        assert_eq!(normalize_progress(250.0, ProgressUnit::Percent), 100);
        assert_eq!(normalize_progress(f64::INFINITY, ProgressUnit::Percent), 0);
    }

    #[test]
    fn test_parse_integer() {
        assert_eq!(parse_integer(" 87 "), Some(87));
        assert_eq!(parse_integer("87%"), Some(87));
        assert_eq!(parse_integer("n/a"), None);
    }
}
