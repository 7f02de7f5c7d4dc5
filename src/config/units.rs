//! Human-readable sizes and durations.
//!
//! - Byte sizes: `1024`, `512K`, `512M`, `18G`, `2T` (binary multiples, an
//!   optional trailing `B`, case-insensitive)
//! - Durations: `500ms`, `30s`, `10m`, `720h`, `2d`, and sequences such as
//!   `1h30m`; a bare number is seconds
//!
//! Both serialize back to their canonical string form so a value survives a
//! round trip through the config layers.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Error parsing a size or duration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} '{input}'")]
pub struct UnitError {
    kind: &'static str,
    input: String,
}

impl UnitError {
    fn size(input: &str) -> Self {
        Self {
            kind: "size",
            input: input.to_string(),
        }
    }

    fn duration(input: &str) -> Self {
        Self {
            kind: "duration",
            input: input.to_string(),
        }
    }
}

const KIB: u64 = 1024;
const SIZE_SUFFIXES: &[(&str, u64)] = &[
    ("T", KIB * KIB * KIB * KIB),
    ("G", KIB * KIB * KIB),
    ("M", KIB * KIB),
    ("K", KIB),
];

/// A size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const fn gib(n: u64) -> Self {
        Self(n * KIB * KIB * KIB)
    }

    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let upper = trimmed.to_ascii_uppercase();
        let body = upper.strip_suffix('B').unwrap_or(&upper);
        let (digits, multiplier) = SIZE_SUFFIXES
            .iter()
            .find_map(|(suffix, mult)| body.strip_suffix(suffix).map(|d| (d, *mult)))
            .unwrap_or((body, 1));
        let n: u64 = digits.trim().parse().map_err(|_| UnitError::size(s))?;
        n.checked_mul(multiplier).map(ByteSize).ok_or_else(|| UnitError::size(s))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (suffix, mult) in SIZE_SUFFIXES {
            if self.0 != 0 && self.0 % mult == 0 {
                return write!(f, "{}{}", self.0 / mult, suffix);
            }
        }
        write!(f, "{}", self.0)
    }
}

/// A duration written in human units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub const fn secs(n: u64) -> Self {
        Self(Duration::from_secs(n))
    }

    pub fn get(self) -> Duration {
        self.0
    }
}

impl From<HumanDuration> for Duration {
    fn from(d: HumanDuration) -> Self {
        d.0
    }
}

fn unit_millis(unit: &str) -> Option<u64> {
    Some(match unit {
        "ms" => 1,
        "s" | "" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return None,
    })
}

impl FromStr for HumanDuration {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        if input.is_empty() {
            return Err(UnitError::duration(s));
        }

        let mut total: u64 = 0;
        let mut rest = input;
        while !rest.is_empty() {
            let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
            if digits_end == 0 {
                return Err(UnitError::duration(s));
            }
            let n: u64 = rest[..digits_end].parse().map_err(|_| UnitError::duration(s))?;
            rest = &rest[digits_end..];

            let unit_end = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
            let unit = &rest[..unit_end];
            rest = &rest[unit_end..];
            // A bare number is only allowed on its own.
            if unit.is_empty() && total != 0 {
                return Err(UnitError::duration(s));
            }

            let millis = unit_millis(unit).ok_or_else(|| UnitError::duration(s))?;
            total = n
                .checked_mul(millis)
                .and_then(|v| total.checked_add(v))
                .ok_or_else(|| UnitError::duration(s))?;
        }
        Ok(HumanDuration(Duration::from_millis(total)))
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.0.as_millis() as u64;
        if millis == 0 {
            return f.write_str("0s");
        }
        for (unit, size) in [("d", 86_400_000u64), ("h", 3_600_000), ("m", 60_000), ("s", 1_000)] {
            if millis % size == 0 {
                return write!(f, "{}{}", millis / size, unit);
            }
        }
        write!(f, "{}ms", millis)
    }
}

macro_rules! human_serde {
    ($ty:ty, $expecting:literal, $from_int:expr) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct HumanVisitor;

                impl<'de> Visitor<'de> for HumanVisitor {
                    type Value = $ty;

                    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.write_str($expecting)
                    }

                    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                        v.parse().map_err(E::custom)
                    }

                    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                        Ok($from_int(v))
                    }

                    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                        u64::try_from(v)
                            .map($from_int)
                            .map_err(|_| E::custom("value must not be negative"))
                    }
                }

                deserializer.deserialize_any(HumanVisitor)
            }
        }
    };
}

human_serde!(ByteSize, "a byte size such as 18G or 1048576", ByteSize);
human_serde!(HumanDuration, "a duration such as 10m or 720h", HumanDuration::secs);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sizes() {
        assert_eq!("1024".parse::<ByteSize>().unwrap(), ByteSize(1024));
        assert_eq!("512K".parse::<ByteSize>().unwrap(), ByteSize(512 * 1024));
        assert_eq!("512M".parse::<ByteSize>().unwrap(), ByteSize(512 * 1024 * 1024));
        assert_eq!("18G".parse::<ByteSize>().unwrap(), ByteSize::gib(18));
        assert_eq!("18gb".parse::<ByteSize>().unwrap(), ByteSize::gib(18));
        assert_eq!("2T".parse::<ByteSize>().unwrap(), ByteSize(2 << 40));
    }

    #[test]
    fn test_reject_bad_sizes() {
        assert!("".parse::<ByteSize>().is_err());
        assert!("G".parse::<ByteSize>().is_err());
        assert!("1.5G".parse::<ByteSize>().is_err());
        assert!("-1".parse::<ByteSize>().is_err());
        assert!("99999999999T".parse::<ByteSize>().is_err());
    }

    #[test]
    fn test_size_display_round_trip() {
        for s in ["20G", "512M", "7K", "1000", "3T"] {
            let size: ByteSize = s.parse().unwrap();
            assert_eq!(size.to_string(), s);
        }
        assert_eq!(ByteSize(1536).to_string(), "1536");
    }

    #[test]
    fn test_parse_durations() {
        assert_eq!("500ms".parse::<HumanDuration>().unwrap().get(), Duration::from_millis(500));
        assert_eq!("30s".parse::<HumanDuration>().unwrap().get(), Duration::from_secs(30));
        assert_eq!("10m".parse::<HumanDuration>().unwrap().get(), Duration::from_secs(600));
        assert_eq!("720h".parse::<HumanDuration>().unwrap().get(), Duration::from_secs(720 * 3600));
        assert_eq!("2d".parse::<HumanDuration>().unwrap().get(), Duration::from_secs(2 * 86400));
        assert_eq!("1h30m".parse::<HumanDuration>().unwrap().get(), Duration::from_secs(5400));
        assert_eq!("45".parse::<HumanDuration>().unwrap().get(), Duration::from_secs(45));
    }

    #[test]
    fn test_reject_bad_durations() {
        for bad in ["", "m", "10x", "1h30", "ten minutes", "5 s"] {
            assert!(bad.parse::<HumanDuration>().is_err(), "{} should not parse", bad);
        }
    }

    #[test]
    fn test_duration_display() {
        assert_eq!(HumanDuration::secs(600).to_string(), "10m");
        assert_eq!(HumanDuration::secs(720 * 3600).to_string(), "30d");
        assert_eq!(HumanDuration(Duration::from_millis(1500)).to_string(), "1500ms");
        assert_eq!(HumanDuration::secs(0).to_string(), "0s");
    }

    #[test]
    fn test_deserialize_string_or_integer() {
        let size: ByteSize = serde_json::from_str("\"18G\"").unwrap();
        assert_eq!(size, ByteSize::gib(18));
        let size: ByteSize = serde_json::from_str("4096").unwrap();
        assert_eq!(size, ByteSize(4096));
        let d: HumanDuration = serde_json::from_str("\"10m\"").unwrap();
        assert_eq!(d, HumanDuration::secs(600));
        let d: HumanDuration = serde_json::from_str("90").unwrap();
        assert_eq!(d, HumanDuration::secs(90));
        assert!(serde_json::from_str::<ByteSize>("-5").is_err());
    }
}
