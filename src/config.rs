use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::{Duration, NaiveDate, NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::model::hhmm;

/// Business-hour and admission rules for the counter.
///
/// Defaults describe the reference deployment. Any subset of fields can be
/// overridden from a JSON file (`COUNTERBOOK_SCHEDULE_FILE`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    #[serde(with = "hhmm")]
    pub morning_start: NaiveTime,
    #[serde(with = "hhmm")]
    pub morning_end: NaiveTime,
    #[serde(with = "hhmm")]
    pub afternoon_start: NaiveTime,
    #[serde(with = "hhmm")]
    pub afternoon_end: NaiveTime,
    /// Length of one slot in minutes.
    pub slot_minutes: u32,
    /// Weekday with no afternoon shift.
    pub short_day: Weekday,
    /// Closed weekdays.
    pub holidays: Vec<NaiveDate>,
    /// Inclusive numeric range of postal codes that count as local.
    pub local_postal_range: (u32, u32),
    /// Max same-day scheduled bookings from outside the local range.
    pub neighbor_quota: usize,
    /// How long before the appointment a citizen may still cancel.
    pub cancellation_lead_hours: i64,
    /// IANA zone the counter operates in.
    pub timezone: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        let hm = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN);
        Self {
            morning_start: hm(8, 0),
            morning_end: hm(11, 0),
            afternoon_start: hm(14, 10),
            afternoon_end: hm(15, 30),
            slot_minutes: 20,
            short_day: Weekday::Fri,
            holidays: Vec::new(),
            local_postal_range: (62_955_000, 62_959_999),
            neighbor_quota: 2,
            cancellation_lead_hours: 24,
            timezone: "America/Fortaleza".into(),
        }
    }
}

impl ScheduleConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: ScheduleConfig = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| ConfigError::Json(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_minutes == 0 {
            return Err(ConfigError::Invalid("slot_minutes must be positive".into()));
        }
        let (low, high) = self.local_postal_range;
        if low > high {
            return Err(ConfigError::Invalid(format!(
                "local_postal_range is inverted: {low} > {high}"
            )));
        }
        if self.cancellation_lead_hours < 0 {
            return Err(ConfigError::Invalid(
                "cancellation_lead_hours must not be negative".into(),
            ));
        }
        self.tz()?;
        Ok(())
    }

    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("unknown time zone: {}", self.timezone)))
    }

    pub fn slot_length(&self) -> Duration {
        Duration::minutes(i64::from(self.slot_minutes))
    }

    pub fn cancellation_lead(&self) -> Duration {
        Duration::hours(self.cancellation_lead_hours)
    }

    /// `postal_code` must already be digits only.
    pub fn is_local_postal_code(&self, postal_code: &str) -> bool {
        let (low, high) = self.local_postal_range;
        postal_code
            .parse::<u32>()
            .is_ok_and(|n| (low..=high).contains(&n))
    }
}

/// Process-level settings, read from `COUNTERBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    /// Connections logged in as this user cancel as administrators.
    pub admin_user: String,
    /// Separate password for `admin_user`. Falls back to `password`.
    pub admin_password: Option<String>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub reconcile_interval: StdDuration,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub schedule: ScheduleConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let schedule = match std::env::var("COUNTERBOOK_SCHEDULE_FILE") {
            Ok(path) => ScheduleConfig::load(Path::new(&path))?,
            Err(_) => ScheduleConfig::default(),
        };

        Ok(Self {
            port: env_parse("COUNTERBOOK_PORT", 5433),
            bind: env_or("COUNTERBOOK_BIND", "0.0.0.0"),
            data_dir: PathBuf::from(env_or("COUNTERBOOK_DATA_DIR", "./data")),
            password: env_or("COUNTERBOOK_PASSWORD", "counterbook"),
            admin_user: env_or("COUNTERBOOK_ADMIN_USER", "admin"),
            admin_password: std::env::var("COUNTERBOOK_ADMIN_PASSWORD")
                .ok()
                .filter(|p| !p.is_empty()),
            max_connections: env_parse("COUNTERBOOK_MAX_CONNECTIONS", 256),
            compact_threshold: env_parse("COUNTERBOOK_COMPACT_THRESHOLD", 1000),
            reconcile_interval: StdDuration::from_secs(env_parse("COUNTERBOOK_RECONCILE_SECS", 60)),
            tls_cert: std::env::var("COUNTERBOOK_TLS_CERT").ok(),
            tls_key: std::env::var("COUNTERBOOK_TLS_KEY").ok(),
            metrics_port: std::env::var("COUNTERBOOK_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            schedule,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("counterbook.wal")
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.into())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, io::Error),
    Json(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "cannot read {}: {e}", path.display()),
            ConfigError::Json(e) => write!(f, "bad schedule file: {e}"),
            ConfigError::Invalid(msg) => write!(f, "invalid schedule: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
