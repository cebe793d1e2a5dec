//! Fractional-second duration strings ("500ms", "30s", "30m", "1.5h",
//! "2d"); a bare number means seconds.

use crate::errno::Error;

pub fn parse_duration(s: &str) -> Result<f64, Error> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::invalid("empty duration"));
    }
    let (num, multiplier) = if let Some(num) = s.strip_suffix("ms") {
        (num, 0.001)
    } else if let Some(num) = s.strip_suffix('s') {
        (num, 1.0)
    } else if let Some(num) = s.strip_suffix('m') {
        (num, 60.0)
    } else if let Some(num) = s.strip_suffix('h') {
        (num, 3600.0)
    } else if let Some(num) = s.strip_suffix('d') {
        (num, 86400.0)
    } else {
        (s, 1.0)
    };
    let value: f64 = num
        .parse()
        .map_err(|_| Error::invalid(format!("malformed duration '{s}'")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(Error::invalid(format!("malformed duration '{s}'")));
    }
    Ok(value * multiplier)
}

pub fn format_duration(secs: f64) -> String {
    if secs < 0.001 && secs > 0.0 {
        return format!("{secs}s");
    }
    if secs < 1.0 && secs > 0.0 {
        return format!("{}ms", secs * 1000.0);
    }
    if secs < 60.0 {
        return format!("{secs}s");
    }
    if secs < 3600.0 {
        return format!("{}m", secs / 60.0);
    }
    if secs < 86400.0 {
        return format!("{}h", secs / 3600.0);
    }
    format!("{}d", secs / 86400.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_forms() {
        assert_eq!(parse_duration("0").unwrap(), 0.0);
        assert_eq!(parse_duration("30").unwrap(), 30.0);
        assert_eq!(parse_duration("0.5").unwrap(), 0.5);
        assert_eq!(parse_duration("500ms").unwrap(), 0.5);
        assert_eq!(parse_duration("30s").unwrap(), 30.0);
        assert_eq!(parse_duration("30m").unwrap(), 1800.0);
        assert_eq!(parse_duration("1.5h").unwrap(), 5400.0);
        assert_eq!(parse_duration("2d").unwrap(), 172800.0);
    }

    #[test]
    fn rejects_malformed() {
        for s in ["", "x", "-1", "-1s", "1q", "1mss", "nan", "inf"] {
            assert!(parse_duration(s).is_err(), "expected {s:?} to be rejected");
        }
    }

    #[test]
    fn format_picks_a_unit() {
        assert_eq!(format_duration(0.5), "500ms");
        assert_eq!(format_duration(30.0), "30s");
        assert_eq!(format_duration(1800.0), "30m");
    }
}
