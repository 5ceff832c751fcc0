//! Duration strings such as `30s`, `5m` or `1h30m`.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static WHOLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\d+(?:ms|h|m|s))+$").unwrap());

static PART_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)(ms|h|m|s)").unwrap());

/// Parse a duration made of `<number><unit>` parts, units being `h`, `m`,
/// `s` and `ms`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if !WHOLE_REGEX.is_match(input) {
        return Err(format!("invalid duration: '{}'", input));
    }

    let mut total = Duration::ZERO;
    for caps in PART_REGEX.captures_iter(input) {
        let amount: u64 = caps[1]
            .parse()
            .map_err(|_| format!("duration out of range: '{}'", input))?;
        let part = match &caps[2] {
            "h" => Duration::from_secs(amount.saturating_mul(3600)),
            "m" => Duration::from_secs(amount.saturating_mul(60)),
            "s" => Duration::from_secs(amount),
            _ => Duration::from_millis(amount),
        };
        total = total.saturating_add(part);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn test_compound() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(
            parse_duration(" 1m500ms ").unwrap(),
            Duration::from_millis(60_500)
        );
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("5 minutes").is_err());
        assert!(parse_duration("m5").is_err());
        assert!(parse_duration("5d").is_err());
    }
}
