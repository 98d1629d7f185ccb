//! TOML config file loading, validation, and profile seeding.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use time::UtcOffset;

use crate::controller::DEFAULT_DRY_THRESHOLD;
use crate::session::SessionSettings;
use crate::store::{Profile, Store};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub weather: Option<WeatherSection>,
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    pub auto_delay_sec: u64,
    pub poll_interval_ms: u64,
    pub dry_threshold: f64,
    pub request_timeout_ms: u64,
    pub utc_offset_hours: i8,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            auto_delay_sec: 30,
            poll_interval_ms: 2000,
            dry_threshold: DEFAULT_DRY_THRESHOLD,
            request_timeout_ms: 5000,
            utc_offset_hours: 8,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WeatherSection {
    pub api_key: String,
    pub location: String,
    #[serde(default = "default_refresh_min")]
    pub refresh_min: u64,
}

fn default_refresh_min() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
pub struct UserEntry {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub device_address: Option<String>,
}

// ---------------------------------------------------------------------------
// Bounds
// ---------------------------------------------------------------------------

const POLL_INTERVAL_RANGE_MS: std::ops::RangeInclusive<u64> = 1000..=10_000;

/// Real-world UTC offsets run from -12:00 to +14:00.
const UTC_OFFSET_RANGE: std::ops::RangeInclusive<i8> = -12..=14;

/// Characters that would break an MQTT topic level.
const TOPIC_RESERVED: &[char] = &['/', '+', '#'];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_controller(&mut errors);
        self.validate_weather(&mut errors);
        self.validate_users(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_controller(&self, errors: &mut Vec<String>) {
        let c = &self.controller;

        if c.auto_delay_sec == 0 {
            errors.push("controller: auto_delay_sec must be positive".into());
        }
        if !POLL_INTERVAL_RANGE_MS.contains(&c.poll_interval_ms) {
            errors.push(format!(
                "controller: poll_interval_ms {} out of range [{}, {}]",
                c.poll_interval_ms,
                POLL_INTERVAL_RANGE_MS.start(),
                POLL_INTERVAL_RANGE_MS.end()
            ));
        }
        if !(0.0..=100.0).contains(&c.dry_threshold) {
            errors.push(format!(
                "controller: dry_threshold {} out of range [0, 100]",
                c.dry_threshold
            ));
        }
        if c.request_timeout_ms == 0 {
            errors.push("controller: request_timeout_ms must be positive".into());
        } else if c.request_timeout_ms >= c.poll_interval_ms.saturating_mul(5) {
            errors.push(format!(
                "controller: request_timeout_ms ({}) must be less than 5 x poll_interval_ms ({})",
                c.request_timeout_ms, c.poll_interval_ms
            ));
        }
        if !UTC_OFFSET_RANGE.contains(&c.utc_offset_hours) {
            errors.push(format!(
                "controller: utc_offset_hours {} out of range [-12, 14]",
                c.utc_offset_hours
            ));
        }
    }

    fn validate_weather(&self, errors: &mut Vec<String>) {
        let Some(w) = &self.weather else {
            return;
        };
        if w.api_key.trim().is_empty() {
            errors.push("weather: api_key is empty".into());
        }
        if w.location.trim().is_empty() {
            errors.push("weather: location is empty".into());
        }
        if w.refresh_min == 0 {
            errors.push("weather: refresh_min must be positive".into());
        }
    }

    fn validate_users(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, u) in self.users.iter().enumerate() {
            let ctx = || {
                if u.user_id.is_empty() {
                    format!("users[{i}]")
                } else {
                    format!("user '{}'", u.user_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if u.user_id.trim().is_empty() {
                errors.push(format!("{}: user_id is empty", ctx()));
            } else if !seen_ids.insert(&u.user_id) {
                errors.push(format!("{}: duplicate user_id", ctx()));
            } else if u
                .user_id
                .chars()
                .any(|ch| ch.is_whitespace() || TOPIC_RESERVED.contains(&ch))
            {
                errors.push(format!(
                    "{}: user_id must not contain whitespace, '/', '+' or '#'",
                    ctx()
                ));
            }

            if u.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── Device address ──────────────────────────────────
            if let Some(addr) = &u.device_address {
                if let Err(why) = check_device_address(addr) {
                    errors.push(format!("{}: device_address '{addr}' {why}", ctx()));
                }
            }
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        let c = &self.controller;
        SessionSettings {
            poll_interval: Duration::from_millis(c.poll_interval_ms),
            request_timeout: Duration::from_millis(c.request_timeout_ms),
            auto_delay: Duration::from_secs(c.auto_delay_sec),
            dry_threshold: c.dry_threshold,
        }
    }

    pub fn utc_offset(&self) -> Result<UtcOffset> {
        UtcOffset::from_hms(self.controller.utc_offset_hours, 0, 0)
            .context("invalid controller.utc_offset_hours")
    }
}

/// Accepts `host`, `host:port`, or an `http(s)://` base URL.
fn check_device_address(addr: &str) -> Result<(), &'static str> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err("is empty");
    }
    if addr.chars().any(char::is_whitespace) {
        return Err("contains whitespace");
    }
    let host_port = addr
        .strip_prefix("http://")
        .or_else(|| addr.strip_prefix("https://"))
        .unwrap_or(addr)
        .trim_end_matches('/');
    let (host, port) = match host_port.rsplit_once(':') {
        Some((h, p)) => (h, Some(p)),
        None => (host_port, None),
    };
    if host.is_empty() {
        return Err("has no host");
    }
    if let Some(p) = port {
        match p.parse::<u16>() {
            Ok(n) if n > 0 => {}
            _ => return Err("has an invalid port"),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all users from the config into the store.
pub async fn apply<S: Store>(config: &Config, store: &S) -> Result<()> {
    for u in &config.users {
        store
            .upsert_profile(&Profile {
                user_id: u.user_id.clone(),
                name: u.name.clone(),
                device_address: u
                    .device_address
                    .as_deref()
                    .map(str::trim)
                    .map(str::to_string),
            })
            .await
            .with_context(|| format!("failed to upsert user '{}'", u.user_id))?;
    }

    tracing::info!(users = config.users.len(), "config applied");

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    // -- Helper: build a valid baseline config that passes validation ------

    fn valid_user() -> UserEntry {
        UserEntry {
            user_id: "farmer-1".into(),
            name: "Juan".into(),
            device_address: Some("192.168.1.55".into()),
        }
    }

    fn valid_config() -> Config {
        Config {
            controller: ControllerSection::default(),
            weather: None,
            users: vec![valid_user()],
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[controller]
auto_delay_sec = 15
poll_interval_ms = 3000
dry_threshold = 70
request_timeout_ms = 2500
utc_offset_hours = 8

[weather]
api_key = "abc"
location = "Compostela"

[[users]]
user_id = "farmer-1"
name = "Juan"
device_address = "192.168.1.55"

[[users]]
user_id = "farmer-2"
name = "Maria"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.controller.auto_delay_sec, 15);
        assert_eq!(config.controller.dry_threshold, 70.0);
        assert_eq!(config.weather.as_ref().unwrap().refresh_min, 30);
        assert_eq!(config.users.len(), 2);
        assert_eq!(config.users[1].device_address, None);
        config.validate().unwrap();
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.controller.auto_delay_sec, 30);
        assert_eq!(config.controller.poll_interval_ms, 2000);
        assert_eq!(config.controller.dry_threshold, 75.0);
        assert!(config.weather.is_none());
        assert!(config.users.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn partial_controller_section_keeps_other_defaults() {
        let config: Config = toml::from_str("[controller]\nauto_delay_sec = 15\n").unwrap();
        assert_eq!(config.controller.auto_delay_sec, 15);
        assert_eq!(config.controller.request_timeout_ms, 5000);
    }

    #[test]
    fn session_settings_from_controller() {
        let s = valid_config().session_settings();
        assert_eq!(s.auto_delay, Duration::from_secs(30));
        assert_eq!(s.poll_interval, Duration::from_millis(2000));
        assert_eq!(s.request_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn utc_offset_hours() {
        let offset = valid_config().utc_offset().unwrap();
        assert_eq!(offset.whole_hours(), 8);
    }

    // -- Validation: controller --------------------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn auto_delay_zero_rejected() {
        let mut cfg = valid_config();
        cfg.controller.auto_delay_sec = 0;
        assert_validation_err(&cfg, "auto_delay_sec must be positive");
    }

    #[test]
    fn poll_interval_bounds() {
        let mut cfg = valid_config();
        cfg.controller.poll_interval_ms = 999;
        assert_validation_err(&cfg, "poll_interval_ms 999 out of range");
        cfg.controller.poll_interval_ms = 10_001;
        assert_validation_err(&cfg, "poll_interval_ms 10001 out of range");
        cfg.controller.poll_interval_ms = 1000;
        cfg.controller.request_timeout_ms = 1000;
        cfg.validate().unwrap();
    }

    #[test]
    fn dry_threshold_out_of_range() {
        let mut cfg = valid_config();
        cfg.controller.dry_threshold = 120.0;
        assert_validation_err(&cfg, "dry_threshold 120 out of range");
    }

    #[test]
    fn request_timeout_must_stay_below_five_polls() {
        let mut cfg = valid_config();
        cfg.controller.request_timeout_ms = 10_000;
        assert_validation_err(&cfg, "must be less than 5 x poll_interval_ms");
        cfg.controller.request_timeout_ms = 0;
        assert_validation_err(&cfg, "request_timeout_ms must be positive");
    }

    #[test]
    fn utc_offset_out_of_range() {
        let mut cfg = valid_config();
        cfg.controller.utc_offset_hours = 15;
        assert_validation_err(&cfg, "utc_offset_hours 15 out of range");
    }

    // -- Validation: weather ------------------------------------------------

    #[test]
    fn weather_fields_required() {
        let mut cfg = valid_config();
        cfg.weather = Some(WeatherSection {
            api_key: " ".into(),
            location: "".into(),
            refresh_min: 0,
        });
        assert_validation_err(&cfg, "weather: api_key is empty");
        assert_validation_err(&cfg, "weather: location is empty");
        assert_validation_err(&cfg, "weather: refresh_min must be positive");
    }

    // -- Validation: users --------------------------------------------------

    #[test]
    fn user_empty_id_rejected() {
        let mut cfg = valid_config();
        cfg.users[0].user_id = "".into();
        assert_validation_err(&cfg, "users[0]: user_id is empty");
    }

    #[test]
    fn user_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.users.push(valid_user());
        assert_validation_err(&cfg, "user 'farmer-1': duplicate user_id");
    }

    #[test]
    fn user_id_with_topic_separator_rejected() {
        let mut cfg = valid_config();
        cfg.users[0].user_id = "farm/1".into();
        assert_validation_err(&cfg, "must not contain whitespace");
    }

    #[test]
    fn user_empty_name_rejected() {
        let mut cfg = valid_config();
        cfg.users[0].name = "  ".into();
        assert_validation_err(&cfg, "name is empty");
    }

    #[test]
    fn device_address_forms() {
        for ok in [
            "192.168.1.55",
            "127.0.0.1:8081",
            "localhost",
            "http://10.0.0.2:80/",
        ] {
            assert!(check_device_address(ok).is_ok(), "{ok} should be accepted");
        }
        assert_eq!(check_device_address(""), Err("is empty"));
        assert_eq!(check_device_address("10.0.0.2:0"), Err("has an invalid port"));
        assert_eq!(check_device_address("10.0.0.2:http"), Err("has an invalid port"));
        assert_eq!(check_device_address(":8081"), Err("has no host"));
        assert_eq!(check_device_address("10.0 .0.2"), Err("contains whitespace"));
    }

    #[test]
    fn bad_device_address_rejected() {
        let mut cfg = valid_config();
        cfg.users[0].device_address = Some("10.0.0.2:99999".into());
        assert_validation_err(&cfg, "device_address '10.0.0.2:99999' has an invalid port");
    }

    #[test]
    fn multiple_errors_collected() {
        let cfg = Config {
            controller: ControllerSection {
                auto_delay_sec: 0,
                poll_interval_ms: 50,
                dry_threshold: -1.0,
                request_timeout_ms: 0,
                utc_offset_hours: 0,
            },
            weather: None,
            users: vec![UserEntry {
                user_id: "".into(),
                name: "".into(),
                device_address: None,
            }],
        };
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        // Should report many errors, not bail after the first
        assert!(msg.contains("auto_delay_sec"), "missing delay error in: {msg}");
        assert!(msg.contains("dry_threshold"), "missing threshold error in: {msg}");
        assert!(msg.contains("user_id is empty"), "missing user error in: {msg}");
    }

    // -- Store seeding ----------------------------------------------------

    #[tokio::test]
    async fn apply_seeds_profiles() {
        let store = MemoryStore::new();
        let mut config = valid_config();
        config.users[0].device_address = Some(" 192.168.1.55 ".into());
        config.validate().unwrap();

        apply(&config, &store).await.unwrap();

        let profiles = store.load_profiles().await.unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].user_id, "farmer-1");
        assert_eq!(profiles[0].device_address.as_deref(), Some("192.168.1.55"));
    }
}
