//! RF unit helpers for the operator console
//!
//! Attribute values stay opaque strings inside the context manager; these
//! helpers only convert them for display and back.

/// Convert a GHz display string to the kHz integer the device expects
pub fn ghz_to_khz(value: &str) -> Option<String> {
    let ghz: f64 = value.trim().parse().ok()?;
    if !ghz.is_finite() {
        return None;
    }
    Some(((ghz * 1_000_000.0).round() as i64).to_string())
}

/// Inverse of [`ghz_to_khz`]
pub fn khz_to_ghz(value: &str) -> Option<String> {
    let raw: i64 = value.trim().parse().ok()?;
    Some(format_ghz(raw as f64 / 1_000_000.0))
}

fn format_ghz(ghz: f64) -> String {
    if ghz.fract() == 0.0 {
        format!("{:.1}", ghz)
    } else {
        let s = format!("{:.6}", ghz);
        s.trim_end_matches('0').to_string()
    }
}

/// Parse a space-separated `*_available` list, dropping zero entries
pub fn parse_vco_list(value: &str) -> Vec<String> {
    value
        .split_whitespace()
        .filter(|f| *f != "0")
        .filter_map(khz_to_ghz)
        .collect()
}

/// Temperature band label for a raw sensor reading.
///
/// Codes 0-2, 3-6 and 7-14 are the three sensor bands; anything above is hot.
pub fn temperature_band(raw: u32) -> &'static str {
    match raw {
        0..=2 => "(below -20 °C)",
        3..=6 => "(-20...+10 °C)",
        7..=14 => "(+10...+45 °C)",
        _ => "(above +45 °C)",
    }
}

/// Scaled detector output in millivolts from `raw` and `scale` channel attributes
pub fn detector_millivolts(raw: &str, scale: &str) -> Option<i64> {
    let raw: f64 = raw.trim().parse().ok()?;
    let scale: f64 = scale.trim().parse().ok()?;
    Some((raw * scale) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ghz_round_trip() {
        assert_eq!(ghz_to_khz("58.5").as_deref(), Some("58500000"));
        assert_eq!(khz_to_ghz("58500000").as_deref(), Some("58.5"));
        assert_eq!(khz_to_ghz("60000000").as_deref(), Some("60.0"));
        assert!(ghz_to_khz("abc").is_none());
        assert!(khz_to_ghz("58.5").is_none());
    }

    #[test]
    fn test_vco_list() {
        assert_eq!(
            parse_vco_list("57000000 0 58500000 0"),
            vec!["57.0".to_string(), "58.5".to_string()]
        );
        assert!(parse_vco_list("").is_empty());
    }

    #[test]
    fn test_temperature_band() {
        assert_eq!(temperature_band(0), "(below -20 °C)");
        // Band edges are inclusive, no gaps between bands
        assert_eq!(temperature_band(2), "(below -20 °C)");
        assert_eq!(temperature_band(6), "(-20...+10 °C)");
        assert_eq!(temperature_band(14), "(+10...+45 °C)");
        assert_eq!(temperature_band(5), "(-20...+10 °C)");
        assert_eq!(temperature_band(10), "(+10...+45 °C)");
        assert_eq!(temperature_band(15), "(above +45 °C)");
    }

    #[test]
    fn test_detector_millivolts() {
        assert_eq!(detector_millivolts("512", "0.5"), Some(256));
        assert_eq!(detector_millivolts("x", "0.5"), None);
    }
}
