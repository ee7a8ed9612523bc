//! Formatting and parsing of sizes, fractions and time values

use std::time::Duration;

const BYTE_UNITS: &[(&str, u64)] = &[
    ("pb", 1 << 50),
    ("tb", 1 << 40),
    ("gb", 1 << 30),
    ("mb", 1 << 20),
    ("kb", 1 << 10),
];

/// Byte size in the largest unit that keeps the value >= 1, e.g. `1.5gb`.
/// Whole values print without decimals.
pub fn format_bytes(bytes: u64) -> String {
    for (unit, size) in BYTE_UNITS {
        if bytes >= *size {
            if bytes % size == 0 {
                return format!("{}{}", bytes / size, unit);
            }
            return format!("{:.1}{}", bytes as f64 / *size as f64, unit);
        }
    }
    format!("{}b", bytes)
}

/// Format a fraction in [0, 1] as a percentage
pub fn format_percent(fraction: f64) -> String {
    format!("{:.1}%", fraction * 100.0)
}

/// Parses a time value such as `500ms`, `30s`, `5m`, `1h` or `7d`
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| crate::Error::InvalidConfig(format!("time value [{}] has no unit", s)))?;
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid time value [{}]", s)))?;

    let duration = match unit {
        "nanos" => Duration::from_nanos(value),
        "micros" => Duration::from_micros(value),
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        "d" => Duration::from_secs(value * 86400),
        other => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown time unit [{}] in [{}]",
                other, s
            )))
        }
    };
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0b");
        assert_eq!(format_bytes(1023), "1023b");
        assert_eq!(format_bytes(1024), "1kb");
        assert_eq!(format_bytes(1536), "1.5kb");
        assert_eq!(format_bytes(20 << 30), "20gb");
    }

    #[test]
    fn test_format_percent() {
        assert_eq!(format_percent(0.875), "87.5%");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration(" 30s ").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2micros").unwrap(), Duration::from_micros(2));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
    }
}
