//! Rate-limit reset parsing
//!
//! Backends report when a rate limit lifts in free text. These parsers pull a
//! wait duration out of that text. Results are hints: the manager clamps them
//! and falls back to a fixed cooldown when nothing parses.

use std::fmt::Debug;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime, TimeZone};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Extracts a wait duration from backend error text
pub trait ResetParser: Send + Sync + Debug {
    fn parse(&self, text: &str, now: DateTime<Local>) -> Option<Duration>;
}

/// Which parser an adapter uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResetParserKind {
    /// Relative hints first, then clock times
    #[default]
    Auto,
    Clock,
    RetryAfter,
    None,
}

impl ResetParserKind {
    pub fn build(self) -> Box<dyn ResetParser> {
        match self {
            ResetParserKind::Auto => Box::new(ChainParser::new(vec![
                Box::new(RetryAfterParser),
                Box::new(ClockResetParser),
            ])),
            ResetParserKind::Clock => Box::new(ClockResetParser),
            ResetParserKind::RetryAfter => Box::new(RetryAfterParser),
            ResetParserKind::None => Box::new(NoResetParser),
        }
    }
}

static RELATIVE_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:retry[- ]after|try again in|wait|resets? in)[:\s]*(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|secs?|seconds?|m|mins?|minutes?|h|hrs?|hours?)?\b",
    )
    .ok()
});

static CLOCK_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)resets?\s+(?:at\s+)?(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\b").ok()
});

/// "retry after 30s", "try again in 5 minutes", "retry-after: 12"
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryAfterParser;

impl ResetParser for RetryAfterParser {
    fn parse(&self, text: &str, _now: DateTime<Local>) -> Option<Duration> {
        let caps = RELATIVE_RE.as_ref()?.captures(text)?;
        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
        let unit = caps.get(2).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
        let secs = match unit.as_str() {
            u if u.starts_with("ms") || u.starts_with("milli") => value / 1000.0,
            u if u.starts_with('h') => value * 3600.0,
            u if u.starts_with('m') => value * 60.0,
            // bare numbers are seconds, as in the Retry-After header
            _ => value,
        };
        debug!(value, %unit, secs, "RetryAfterParser::parse: matched");
        (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
    }
}

/// "resets 4am", "resets at 4:30 pm", "resets 16:00"
///
/// The time is read as local wall-clock time and resolved to its next
/// occurrence after `now`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockResetParser;

impl ResetParser for ClockResetParser {
    fn parse(&self, text: &str, now: DateTime<Local>) -> Option<Duration> {
        let caps = CLOCK_RE.as_ref()?.captures(text)?;
        let mut hour: u32 = caps.get(1)?.as_str().parse().ok()?;
        let minute: u32 = caps.get(2).map(|m| m.as_str().parse()).transpose().ok()?.unwrap_or(0);
        let meridiem = caps.get(3).map(|m| m.as_str().to_lowercase());

        match meridiem.as_deref() {
            Some(m) => {
                if !(1..=12).contains(&hour) {
                    return None;
                }
                hour %= 12;
                if m == "pm" {
                    hour += 12;
                }
            }
            // without am/pm require an explicit minute so "resets 5" is ignored
            None if caps.get(2).is_none() => return None,
            None => {}
        }

        let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
        let today = now.date_naive();
        for offset in 0..=1 {
            let date = today + chrono::Duration::days(offset);
            let Some(at) = Local.from_local_datetime(&date.and_time(time)).earliest() else {
                continue;
            };
            if at > now {
                let wait = (at - now).to_std().ok()?;
                debug!(%at, wait_secs = wait.as_secs(), "ClockResetParser::parse: matched");
                return Some(wait);
            }
        }
        None
    }
}

/// Tries each parser in order
#[derive(Debug)]
pub struct ChainParser {
    parsers: Vec<Box<dyn ResetParser>>,
}

impl ChainParser {
    pub fn new(parsers: Vec<Box<dyn ResetParser>>) -> Self {
        Self { parsers }
    }
}

impl ResetParser for ChainParser {
    fn parse(&self, text: &str, now: DateTime<Local>) -> Option<Duration> {
        self.parsers.iter().find_map(|p| p.parse(text, now))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoResetParser;

impl ResetParser for NoResetParser {
    fn parse(&self, _text: &str, _now: DateTime<Local>) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(hour: u32, minute: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 6, 10, hour, minute, 0).earliest().unwrap()
    }

    #[test]
    fn test_retry_after_units() {
        let now = at(12, 0);
        let p = RetryAfterParser;
        assert_eq!(p.parse("Please retry after 30s", now), Some(Duration::from_secs(30)));
        assert_eq!(p.parse("try again in 5 minutes", now), Some(Duration::from_secs(300)));
        assert_eq!(p.parse("Retry-After: 12", now), Some(Duration::from_secs(12)));
        assert_eq!(p.parse("retry after 250ms", now), Some(Duration::from_millis(250)));
        assert_eq!(p.parse("try again in 2 hours", now), Some(Duration::from_secs(7200)));
        assert_eq!(p.parse("connection reset", now), None);
    }

    #[test]
    fn test_clock_reset_later_today() {
        let p = ClockResetParser;
        let wait = p.parse("Your limit will reset at 4pm", at(12, 0)).unwrap();
        assert_eq!(wait, Duration::from_secs(4 * 3600));

        let wait = p.parse("usage limit reached, resets 16:30", at(16, 0)).unwrap();
        assert_eq!(wait, Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_clock_reset_rolls_to_tomorrow() {
        let p = ClockResetParser;
        let wait = p.parse("limit resets 4am", at(12, 0)).unwrap();
        assert_eq!(wait, Duration::from_secs(16 * 3600));

        let wait = p.parse("resets at 12:15 am", at(23, 0)).unwrap();
        assert_eq!(wait, Duration::from_secs(75 * 60));
    }

    #[test]
    fn test_clock_reset_rejects_nonsense() {
        let p = ClockResetParser;
        assert_eq!(p.parse("resets 13pm", at(12, 0)), None);
        assert_eq!(p.parse("resets 5", at(12, 0)), None);
        assert_eq!(p.parse("resets 25:00", at(12, 0)), None);
    }

    #[test]
    fn test_auto_prefers_relative_hint() {
        let parser = ResetParserKind::Auto.build();
        let wait = parser.parse("rate limited; retry after 10s (limit resets 4am)", at(12, 0));
        assert_eq!(wait, Some(Duration::from_secs(10)));

        let wait = parser.parse("limit resets 1pm", at(12, 0));
        assert_eq!(wait, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_none_parser() {
        let parser = ResetParserKind::None.build();
        assert_eq!(parser.parse("retry after 10s", at(12, 0)), None);
    }

    #[test]
    fn test_kind_from_yaml() {
        let kind: ResetParserKind = serde_yaml::from_str("retry-after").unwrap();
        assert_eq!(kind, ResetParserKind::RetryAfter);
    }
}
