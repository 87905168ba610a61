use crate::dag::HeaderMatch;
use anyhow::{bail, Result};
use std::{
    collections::{BTreeMap, BTreeSet},
    time,
};

/// A tri-state timeout setting.
///
/// `Default` defers to whatever the proxy would do with no value configured;
/// `Disabled` means the timeout must not fire at all. The two are distinct
/// states because the proxy treats an absent field and an explicit zero
/// differently depending on the timeout.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Timeout {
    #[default]
    Default,
    Duration(time::Duration),
    Disabled,
}

// === impl Timeout ===

impl Timeout {
    /// Parses a timeout string.
    ///
    /// An empty string leaves the setting unset. The literal `infinite`
    /// disables the timeout. Anything else must be a duration; a zero
    /// duration maps back to the proxy default rather than to "fire
    /// immediately".
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim() {
            "" => Ok(Self::Default),
            "infinite" => Ok(Self::Disabled),
            s => {
                let d = parse_duration(s)?;
                if d.is_zero() {
                    Ok(Self::Default)
                } else {
                    Ok(Self::Duration(d))
                }
            }
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Self::Default)
    }

    pub fn duration(&self) -> Option<time::Duration> {
        match self {
            Self::Duration(d) => Some(*d),
            _ => None,
        }
    }
}

/// Parses a Go-style duration: one or more `<integer><unit>` segments, e.g.
/// `90s` or `1m30s`. A bare number carries no unit and is rejected.
pub fn parse_duration(s: &str) -> Result<time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty duration");
    }

    let mut nanos: u64 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            bail!("invalid duration {s:?}");
        }
        let (magnitude, tail) = rest.split_at(digits);
        let magnitude = magnitude.parse::<u64>()?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let mul: u64 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            "" => bail!("missing unit in duration {s:?}"),
            _ => bail!("unknown unit {unit:?} in duration {s:?}"),
        };
        nanos = magnitude
            .checked_mul(mul)
            .and_then(|n| nanos.checked_add(n))
            .ok_or_else(|| anyhow::anyhow!("duration {s:?} overflows"))?;
        rest = tail;
    }

    Ok(time::Duration::from_nanos(nanos))
}

/// Response and idle timeouts for a route.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub response: Timeout,
    pub idle: Timeout,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_on: String,
    pub num_retries: u32,
    pub per_try_timeout: Timeout,
    pub retriable_status_codes: Vec<u32>,
}

/// Backend selection strategy. Anything the proxy does not recognize by one
/// of these names falls back to its default selection.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LoadBalancerStrategy {
    #[default]
    Default,
    WeightedLeastRequest,
    Random,
    Cookie,
    RequestHash,
}

/// Header mutations applied to requests or responses.
///
/// Keys are canonicalized header names; values have already had dynamic
/// tokens substituted and literal `%` escaped, so renderers emit them
/// verbatim.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeadersPolicy {
    pub set: BTreeMap<String, String>,
    pub remove: BTreeSet<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub local: Option<LocalRateLimitPolicy>,
    pub global: Option<GlobalRateLimitPolicy>,
}

/// Token-bucket parameters derived from a requests-per-unit policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalRateLimitPolicy {
    pub max_tokens: u32,
    pub tokens_per_fill: u32,
    pub fill_interval: time::Duration,
    pub response_status_code: Option<u32>,
    pub response_headers_to_add: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalRateLimitPolicy {
    pub descriptors: Vec<RateLimitDescriptor>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitDescriptor {
    pub entries: Vec<RateLimitDescriptorEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateLimitDescriptorEntry {
    GenericKey {
        key: Option<String>,
        value: String,
    },
    RemoteAddress,
    RequestHeader {
        header_name: String,
        descriptor_key: String,
    },
    HeaderValueMatch {
        headers: Vec<HeaderMatch>,
        expect_match: bool,
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn durations_parse_go_style() {
        assert_eq!(parse_duration("90s").unwrap(), time::Duration::from_secs(90));
        assert_eq!(
            parse_duration("1m30s").unwrap(),
            time::Duration::from_secs(90)
        );
        assert_eq!(
            parse_duration("2h45m").unwrap(),
            time::Duration::from_secs(2 * 3600 + 45 * 60)
        );
        assert_eq!(
            parse_duration("250ms").unwrap(),
            time::Duration::from_millis(250)
        );
        assert_eq!(parse_duration("0s").unwrap(), time::Duration::ZERO);
    }

    #[test]
    fn durations_require_units() {
        assert!(parse_duration("90").is_err());
        assert!(parse_duration("1m30").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10parsecs").is_err());
    }

    #[test]
    fn timeout_sentinels() {
        assert_eq!(Timeout::parse("").unwrap(), Timeout::Default);
        assert_eq!(Timeout::parse("infinite").unwrap(), Timeout::Disabled);
        // An explicit zero defers to the proxy default; it is not "disabled".
        assert_eq!(Timeout::parse("0s").unwrap(), Timeout::Default);
        assert_eq!(
            Timeout::parse("1m30s").unwrap(),
            Timeout::Duration(time::Duration::from_secs(90))
        );
        assert!(Timeout::parse("90").is_err());
    }
}
