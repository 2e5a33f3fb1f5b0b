use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SchedulerError};

pub const DEFAULT_INTERVAL_SECS: u64 = 300;

/// Time between two worker runs, in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval(u64);

impl Interval {
    pub fn from_secs(secs: u64) -> Result<Self> {
        if secs == 0 {
            return Err(SchedulerError::InvalidSpec(
                "interval must be at least one second".to_string(),
            ));
        }
        Ok(Self(secs))
    }

    pub fn from_minutes(minutes: u64) -> Result<Self> {
        let secs = minutes
            .checked_mul(60)
            .ok_or_else(|| SchedulerError::InvalidSpec(format!("interval of {}m overflows", minutes)))?;
        Self::from_secs(secs)
    }

    /// Parses `"300"`, `"300s"`, `"5m"` or `"1h"`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || SchedulerError::InvalidSpec(format!("invalid interval: {:?}", s));
        if s.is_empty() {
            return Err(invalid());
        }

        let (num, multiplier) = match s.chars().last() {
            Some('s') => (&s[..s.len() - 1], 1),
            Some('m') => (&s[..s.len() - 1], 60),
            Some('h') => (&s[..s.len() - 1], 3600),
            Some(c) if c.is_ascii_digit() => (s, 1),
            _ => return Err(invalid()),
        };
        let n: u64 = num.trim().parse().map_err(|_| invalid())?;
        let secs = n.checked_mul(multiplier).ok_or_else(invalid)?;
        Self::from_secs(secs)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// Some only when the interval is an exact number of minutes.
    pub fn whole_minutes(&self) -> Option<u64> {
        (self.0 % 60 == 0).then_some(self.0 / 60)
    }
}

impl Default for Interval {
    fn default() -> Self {
        Self(DEFAULT_INTERVAL_SECS)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 3600 == 0 {
            write!(f, "{}h", self.0 / 3600)
        } else if self.0 % 60 == 0 {
            write!(f, "{}m", self.0 / 60)
        } else {
            write!(f, "{}s", self.0)
        }
    }
}

impl FromStr for Interval {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Interval::from_secs(secs),
            Raw::Text(text) => Interval::parse(&text),
        }
        .map_err(serde::de::Error::custom)
    }
}
