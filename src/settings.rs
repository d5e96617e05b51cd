//! Environment-driven settings.
//!
//! All knobs share one parser pair so boolean spellings and non-negative
//! integers behave identically everywhere. Unparseable values fall back to
//! the documented default instead of failing startup.

use std::env;
use std::time::Duration;

pub const LONGRUN_NOTIFY_ENABLED: &str = "RUNQ_LONGRUN_NOTIFY_ENABLED";
pub const LONGRUN_NOTIFY_AFTER_MS: &str = "RUNQ_LONGRUN_NOTIFY_AFTER_MS";
pub const LONGRUN_NOTIFY_INTERVAL_MS: &str = "RUNQ_LONGRUN_NOTIFY_INTERVAL_MS";
pub const LONGRUN_NOTIFY_MAX: &str = "RUNQ_LONGRUN_NOTIFY_MAX";
pub const DOCS_UPDATE_ENABLED: &str = "RUNQ_DOCS_UPDATE_ENABLED";

const DEFAULT_INITIAL_DELAY_MS: u64 = 300_000; // 5 minutes
const DEFAULT_INTERVAL_MS: u64 = 600_000; // 10 minutes
const DEFAULT_MAX_NOTIFICATIONS: u64 = 3;

/// Parses a boolean flag. Accepts `1`/`true`/`yes`/`on` and
/// `0`/`false`/`no`/`off` after trimming and lowercasing; anything else
/// keeps the default.
pub fn parse_bool_setting(value: Option<&str>, default: bool) -> bool {
    let Some(raw) = value else { return default };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

/// Parses a non-negative integer, keeping the default on missing, empty, or
/// malformed input.
pub fn parse_non_negative_int(value: Option<&str>, default: u64) -> u64 {
    value
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(default)
}

/// Long-run notification knobs, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongRunNotifyConfig {
    pub enabled: bool,
    /// Delay before the first notification for a running job.
    pub initial_delay: Duration,
    /// Gap between repeat notifications; `None` means notify once and stop.
    pub interval: Option<Duration>,
    /// Cap on notifications per job; `None` means unlimited.
    pub max_notifications: Option<u32>,
}

impl Default for LongRunNotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            interval: Some(Duration::from_millis(DEFAULT_INTERVAL_MS)),
            max_notifications: Some(DEFAULT_MAX_NOTIFICATIONS as u32),
        }
    }
}

impl LongRunNotifyConfig {
    /// Resolves the configuration through `lookup`, applying defaults and
    /// the zero mappings: interval `0` means one-shot, max `0` means
    /// unlimited.
    pub fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = parse_bool_setting(lookup(LONGRUN_NOTIFY_ENABLED).as_deref(), true);
        let initial_delay_ms = parse_non_negative_int(
            lookup(LONGRUN_NOTIFY_AFTER_MS).as_deref(),
            DEFAULT_INITIAL_DELAY_MS,
        );
        let interval_ms = parse_non_negative_int(
            lookup(LONGRUN_NOTIFY_INTERVAL_MS).as_deref(),
            DEFAULT_INTERVAL_MS,
        );
        let max_notifications = parse_non_negative_int(
            lookup(LONGRUN_NOTIFY_MAX).as_deref(),
            DEFAULT_MAX_NOTIFICATIONS,
        );

        Self {
            enabled,
            initial_delay: Duration::from_millis(initial_delay_ms),
            interval: (interval_ms > 0).then(|| Duration::from_millis(interval_ms)),
            max_notifications: (max_notifications > 0)
                .then(|| u32::try_from(max_notifications).unwrap_or(u32::MAX)),
        }
    }

    /// Resolves from the process environment.
    pub fn from_env() -> Self {
        Self::resolve(|key| env::var(key).ok())
    }
}

/// Whether documentation-update runs are requested by default when the
/// submitter does not say. Consumed by the submission front end; shares the
/// boolean parser with every other flag.
pub fn docs_update_enabled_by_default() -> bool {
    parse_bool_setting(env::var(DOCS_UPDATE_ENABLED).ok().as_deref(), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn bool_parser_accepts_documented_spellings() {
        for raw in ["1", "true", "YES", " on "] {
            assert!(parse_bool_setting(Some(raw), false), "{raw} should be true");
        }
        for raw in ["0", "false", "No", "OFF"] {
            assert!(!parse_bool_setting(Some(raw), true), "{raw} should be false");
        }
    }

    #[test]
    fn bool_parser_falls_back_on_unknown_input() {
        assert!(parse_bool_setting(None, true));
        assert!(parse_bool_setting(Some("definitely"), true));
        assert!(!parse_bool_setting(Some(""), false));
    }

    #[test]
    fn int_parser_rejects_negative_and_garbage() {
        assert_eq!(parse_non_negative_int(Some("250"), 7), 250);
        assert_eq!(parse_non_negative_int(Some(" 250 "), 7), 250);
        assert_eq!(parse_non_negative_int(Some("-3"), 7), 7);
        assert_eq!(parse_non_negative_int(Some("abc"), 7), 7);
        assert_eq!(parse_non_negative_int(Some(""), 7), 7);
        assert_eq!(parse_non_negative_int(None, 7), 7);
    }

    #[test]
    fn config_defaults_match_documented_values() {
        let config = LongRunNotifyConfig::resolve(|_| None);
        assert!(config.enabled);
        assert_eq!(config.initial_delay, Duration::from_millis(300_000));
        assert_eq!(config.interval, Some(Duration::from_millis(600_000)));
        assert_eq!(config.max_notifications, Some(3));
        assert_eq!(config, LongRunNotifyConfig::default());
    }

    #[test]
    fn zero_interval_means_one_shot() {
        let pairs = [(LONGRUN_NOTIFY_INTERVAL_MS, "0")];
        let config = LongRunNotifyConfig::resolve(lookup_from(&pairs));
        assert_eq!(config.interval, None);
    }

    #[test]
    fn zero_max_means_unlimited() {
        let pairs = [(LONGRUN_NOTIFY_MAX, "0")];
        let config = LongRunNotifyConfig::resolve(lookup_from(&pairs));
        assert_eq!(config.max_notifications, None);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let pairs = [
            (LONGRUN_NOTIFY_ENABLED, "off"),
            (LONGRUN_NOTIFY_AFTER_MS, "5000"),
            (LONGRUN_NOTIFY_INTERVAL_MS, "10000"),
            (LONGRUN_NOTIFY_MAX, "2"),
        ];
        let config = LongRunNotifyConfig::resolve(lookup_from(&pairs));
        assert!(!config.enabled);
        assert_eq!(config.initial_delay, Duration::from_millis(5000));
        assert_eq!(config.interval, Some(Duration::from_millis(10_000)));
        assert_eq!(config.max_notifications, Some(2));
    }

    #[test]
    fn malformed_values_keep_per_key_defaults() {
        let pairs = [
            (LONGRUN_NOTIFY_AFTER_MS, "five minutes"),
            (LONGRUN_NOTIFY_MAX, "-1"),
        ];
        let config = LongRunNotifyConfig::resolve(lookup_from(&pairs));
        assert_eq!(config.initial_delay, Duration::from_millis(300_000));
        assert_eq!(config.max_notifications, Some(3));
    }
}
