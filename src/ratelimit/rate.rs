//! Rate limit expressions such as `"10 per minute"` or `"100/2 hours"`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};

/// Delimiters accepted between multiple expressions in one string.
const DELIMITERS: &[char] = &[';', ',', '|'];

/// Time granularity of a rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
    Month,
    Year,
}

impl Granularity {
    /// Length of one unit of this granularity in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            Granularity::Second => 1,
            Granularity::Minute => 60,
            Granularity::Hour => 60 * 60,
            Granularity::Day => 60 * 60 * 24,
            Granularity::Month => 60 * 60 * 24 * 30,
            Granularity::Year => 60 * 60 * 24 * 30 * 12,
        }
    }

    /// Lowercase singular name, as used in rendered limits and storage keys.
    pub fn name(&self) -> &'static str {
        match self {
            Granularity::Second => "second",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Month => "month",
            Granularity::Year => "year",
        }
    }

    /// Match a (case insensitive, optionally plural) unit name.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        let singular = name.strip_suffix('s').unwrap_or(&name);
        match singular {
            "second" => Some(Granularity::Second),
            "minute" => Some(Granularity::Minute),
            "hour" => Some(Granularity::Hour),
            "day" => Some(Granularity::Day),
            "month" => Some(Granularity::Month),
            "year" => Some(Granularity::Year),
            _ => None,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single parsed quota: `amount` events per `multiple` units of `granularity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateLimitItem {
    amount: u64,
    multiple: u64,
    granularity: Granularity,
}

impl RateLimitItem {
    /// Create a new item. Both `amount` and `multiple` must be positive.
    pub fn new(amount: u64, multiple: u64, granularity: Granularity) -> Result<Self> {
        if amount == 0 {
            return Err(LimiterError::MalformedLimit(format!(
                "amount must be positive in '{} per {} {}'",
                amount, multiple, granularity
            )));
        }
        if multiple == 0 {
            return Err(LimiterError::MalformedLimit(format!(
                "window multiple must be positive in '{} per {} {}'",
                amount, multiple, granularity
            )));
        }
        Ok(Self {
            amount,
            multiple,
            granularity,
        })
    }

    pub fn per_second(amount: u64) -> Result<Self> {
        Self::new(amount, 1, Granularity::Second)
    }

    pub fn per_minute(amount: u64) -> Result<Self> {
        Self::new(amount, 1, Granularity::Minute)
    }

    pub fn per_hour(amount: u64) -> Result<Self> {
        Self::new(amount, 1, Granularity::Hour)
    }

    pub fn per_day(amount: u64) -> Result<Self> {
        Self::new(amount, 1, Granularity::Day)
    }

    /// Maximum number of events allowed within one window.
    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// Number of granularity units in one window.
    pub fn multiple(&self) -> u64 {
        self.multiple
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Length of the window in seconds.
    pub fn expiry_secs(&self) -> u64 {
        self.multiple * self.granularity.seconds()
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs())
    }

    /// Segment identifying this item inside a storage key.
    pub fn discriminator(&self) -> String {
        format!("{}/{}/{}", self.amount, self.multiple, self.granularity)
    }

    /// Order by window length only, the "smaller granularity first" ordering.
    pub fn cmp_window(&self, other: &Self) -> Ordering {
        self.expiry_secs().cmp(&other.expiry_secs())
    }
}

impl fmt::Display for RateLimitItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} per {} {}", self.amount, self.multiple, self.granularity)
    }
}

impl FromStr for RateLimitItem {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self> {
        parse(s)
    }
}

/// Parse a single expression such as `"10/minute"`, `"10 per minute"` or
/// `"5 per 2 hours"`.
pub fn parse(expression: &str) -> Result<RateLimitItem> {
    let malformed = |reason: &str| {
        LimiterError::MalformedLimit(format!("'{}': {}", expression.trim(), reason))
    };

    let lowered = expression.trim().to_ascii_lowercase();
    let (amount, window) = if let Some((amount, window)) = lowered.split_once('/') {
        (amount, window)
    } else if let Some((amount, window)) = lowered.split_once(" per ") {
        (amount, window)
    } else {
        return Err(malformed("expected '<amount> per <window>' or '<amount>/<window>'"));
    };

    let amount: u64 = amount
        .trim()
        .parse()
        .map_err(|_| malformed("amount is not a number"))?;

    let window = window.trim();
    let digits = window
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(window.len());
    let (multiple, unit) = window.split_at(digits);
    let multiple = if multiple.is_empty() {
        1
    } else {
        multiple
            .parse()
            .map_err(|_| malformed("window multiple is not a number"))?
    };

    let granularity =
        Granularity::from_name(unit).ok_or_else(|| malformed("unknown time granularity"))?;

    RateLimitItem::new(amount, multiple, granularity)
}

/// Parse one or more expressions separated by `;`, `,` or `|`.
///
/// Every expression must be valid; an empty string yields no items.
pub fn parse_many(expressions: &str) -> Result<Vec<RateLimitItem>> {
    expressions
        .split(DELIMITERS)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_granularity_seconds() {
        assert_eq!(Granularity::Second.seconds(), 1);
        assert_eq!(Granularity::Minute.seconds(), 60);
        assert_eq!(Granularity::Hour.seconds(), 3600);
        assert_eq!(Granularity::Day.seconds(), 86400);
        assert_eq!(Granularity::Month.seconds(), 86400 * 30);
        assert_eq!(Granularity::Year.seconds(), 86400 * 360);
    }

    #[test]
    fn test_parse_singles() {
        for expression in ["1 per hour", "1/HOUR", "1/Hour", "1 / hour"] {
            assert_eq!(parse(expression).unwrap(), RateLimitItem::per_hour(1).unwrap());
        }
        for expression in ["1 per second", "1/SECOND", "1 / Second"] {
            assert_eq!(parse(expression).unwrap(), RateLimitItem::per_second(1).unwrap());
        }
        assert_eq!(parse("1 per day").unwrap(), RateLimitItem::per_day(1).unwrap());
    }

    #[test]
    fn test_parse_multiples() {
        assert_eq!(parse("1 per 3 hour").unwrap().expiry_secs(), 3 * 60 * 60);
        assert_eq!(parse("1 per 2 hours").unwrap().expiry_secs(), 2 * 60 * 60);
        assert_eq!(parse("1/2 day").unwrap().expiry_secs(), 2 * 24 * 60 * 60);
        assert_eq!(parse("10/5minutes").unwrap().expiry_secs(), 300);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse("1 per millenium").is_err());
        assert!(parse("many per second").is_err());
        assert!(parse("0 per second").is_err());
        assert!(parse("1 per 0 seconds").is_err());
        assert!(parse("per second").is_err());
        assert!(matches!(parse("ten"), Err(LimiterError::MalformedLimit(_))));
    }

    #[test]
    fn test_parse_many() {
        let items = parse_many("200 per day; 50 per hour").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], RateLimitItem::per_day(200).unwrap());
        assert_eq!(items[1], RateLimitItem::per_hour(50).unwrap());

        assert_eq!(parse_many("1/second, 10/minute | 100/hour").unwrap().len(), 3);
        assert!(parse_many("").unwrap().is_empty());
        assert!(parse_many("1/second; bogus").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(RateLimitItem::per_day(1).unwrap().to_string(), "1 per 1 day");
        assert_eq!(parse("5 per 2 hours").unwrap().to_string(), "5 per 2 hour");
        assert_eq!(parse("10/minute").unwrap().discriminator(), "10/1/minute");
    }

    #[test]
    fn test_window_ordering() {
        let second = RateLimitItem::per_second(100).unwrap();
        let minute = RateLimitItem::per_minute(1).unwrap();
        assert_eq!(second.cmp_window(&minute), Ordering::Less);
        assert_eq!(minute.cmp_window(&parse("60/60 seconds").unwrap()), Ordering::Equal);
    }
}
