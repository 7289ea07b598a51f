use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime, Time, UtcOffset};

mod schedule;

pub use schedule::next_run_after;

pub const DEFAULT_BACKUP_PREFIX: &str = "gym_backup";
pub const BACKUP_EXTENSION: &str = "db";
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

pub const TOKEN_LEN: usize = 6;
pub const TOKEN_MIN: u32 = 100_000;
pub const TOKEN_MAX: u32 = 999_999;

pub const INSTRUCTOR_KEY_DOMAIN: &str = "instructores.gym.local";
const INSTRUCTOR_KEY_FALLBACK: &str = "instructor";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
}

/// Archive bucket a backup file lives in. Each category maps to one
/// subdirectory of the backups root.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackupCategory {
    Manual,
    Automatic,
}

impl BackupCategory {
    pub const ALL: [Self; 2] = [Self::Manual, Self::Automatic];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Automatic => "automatic",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(Self::Manual),
            "automatic" => Some(Self::Automatic),
            _ => None,
        }
    }
}

impl Display for BackupCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One archived copy of the live database file.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BackupRecord {
    pub name: String,
    pub category: BackupCategory,
    pub path: PathBuf,
    pub size_bytes: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackupFrequency {
    Diario,
    Semanal,
    Mensual,
}

impl BackupFrequency {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Diario => "diario",
            Self::Semanal => "semanal",
            Self::Mensual => "mensual",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "diario" => Some(Self::Diario),
            "semanal" => Some(Self::Semanal),
            "mensual" => Some(Self::Mensual),
            _ => None,
        }
    }
}

/// Time of day (`HH:MM`, 24h clock) at which scheduled backups fire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct BackupTime {
    hour: u8,
    minute: u8,
}

impl BackupTime {
    /// # Errors
    /// Returns [`CoreError::Validation`] when `hour` > 23 or `minute` > 59.
    pub fn new(hour: u8, minute: u8) -> Result<Self, CoreError> {
        if hour > 23 || minute > 59 {
            return Err(CoreError::Validation(format!(
                "hora MUST be a valid HH:MM time, got {hour:02}:{minute:02}"
            )));
        }
        Ok(Self { hour, minute })
    }

    #[must_use]
    pub fn hour(self) -> u8 {
        self.hour
    }

    #[must_use]
    pub fn minute(self) -> u8 {
        self.minute
    }

    #[must_use]
    pub fn as_time(self) -> Time {
        Time::from_hms(self.hour, self.minute, 0).unwrap_or(Time::MIDNIGHT)
    }
}

impl Default for BackupTime {
    fn default() -> Self {
        Self { hour: 3, minute: 0 }
    }
}

impl FromStr for BackupTime {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::Validation(format!("hora MUST be formatted as HH:MM, got {value:?}"));
        let (hour, minute) = value.trim().split_once(':').ok_or_else(invalid)?;
        let two_digits = |part: &str| part.len() == 2 && part.bytes().all(|byte| byte.is_ascii_digit());
        if !two_digits(hour) || !two_digits(minute) {
            return Err(invalid());
        }
        let hour = hour.parse::<u8>().map_err(|_| invalid())?;
        let minute = minute.parse::<u8>().map_err(|_| invalid())?;
        Self::new(hour, minute)
    }
}

impl TryFrom<String> for BackupTime {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackupTime> for String {
    fn from(value: BackupTime) -> Self {
        value.to_string()
    }
}

impl Display for BackupTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Singleton scheduling record read by whatever process triggers automatic
/// backups.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BackupConfig {
    pub frecuencia: BackupFrequency,
    pub hora: BackupTime,
    pub mantener_backups: u32,
    pub activo: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            frecuencia: BackupFrequency::Diario,
            hora: BackupTime::default(),
            mantener_backups: DEFAULT_RETENTION_DAYS,
            activo: true,
        }
    }
}

impl BackupConfig {
    /// # Errors
    /// Returns [`CoreError::Validation`] when the retention window is zero days.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.mantener_backups == 0 {
            return Err(CoreError::Validation(
                "mantener_backups MUST be at least 1 day".to_string(),
            ));
        }
        Ok(())
    }
}

/// Build `<prefix>_YYYY-MM-DDTHH-MM-SS.db` for the given instant, rendered in
/// UTC at second precision.
#[must_use]
pub fn backup_file_name(prefix: &str, at: OffsetDateTime) -> String {
    let at = at.to_offset(UtcOffset::UTC);
    format!(
        "{prefix}_{:04}-{:02}-{:02}T{:02}-{:02}-{:02}.{BACKUP_EXTENSION}",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute(),
        at.second(),
    )
}

/// Recover the embedded timestamp from a backup file name, or `None` when the
/// name does not follow the archive naming scheme.
#[must_use]
pub fn parse_backup_file_name(prefix: &str, name: &str) -> Option<OffsetDateTime> {
    let stamp = name
        .strip_prefix(prefix)?
        .strip_prefix('_')?
        .strip_suffix(BACKUP_EXTENSION)?
        .strip_suffix('.')?;

    let bytes = stamp.as_bytes();
    if bytes.len() != 19 {
        return None;
    }
    for (index, byte) in bytes.iter().enumerate() {
        let ok = match index {
            4 | 7 | 13 | 16 => *byte == b'-',
            10 => *byte == b'T',
            _ => byte.is_ascii_digit(),
        };
        if !ok {
            return None;
        }
    }

    let year = stamp[0..4].parse::<i32>().ok()?;
    let month = Month::try_from(stamp[5..7].parse::<u8>().ok()?).ok()?;
    let day = stamp[8..10].parse::<u8>().ok()?;
    let hour = stamp[11..13].parse::<u8>().ok()?;
    let minute = stamp[14..16].parse::<u8>().ok()?;
    let second = stamp[17..19].parse::<u8>().ok()?;

    let date = Date::from_calendar_date(year, month, day).ok()?;
    let time = Time::from_hms(hour, minute, second).ok()?;
    Some(date.with_time(time).assume_utc())
}

/// A check-in token is exactly six ASCII digits.
#[must_use]
pub fn is_valid_token(value: &str) -> bool {
    value.len() == TOKEN_LEN && value.bytes().all(|byte| byte.is_ascii_digit())
}

/// Last six digits of the Unix-epoch millisecond clock, used when random
/// draws keep colliding.
#[must_use]
pub fn fallback_token(now: OffsetDateTime) -> String {
    let millis = now.unix_timestamp_nanos() / 1_000_000;
    format!("{:06}", millis.rem_euclid(1_000_000))
}

/// Lookup key for an instructor known only by free text: the first word of
/// the name, ASCII-folded and lowercased, as an email-like identifier.
///
/// Two instructors sharing a first name map to the same key.
#[must_use]
pub fn derive_instructor_key(name: &str) -> String {
    let first_word = name.split_whitespace().next().unwrap_or_default();
    let mut local = String::with_capacity(first_word.len());
    for ch in first_word.chars().flat_map(char::to_lowercase) {
        let folded = fold_ascii(ch);
        if folded.is_ascii_alphanumeric() {
            local.push(folded);
        }
    }
    if local.is_empty() {
        local.push_str(INSTRUCTOR_KEY_FALLBACK);
    }
    format!("{local}@{INSTRUCTOR_KEY_DOMAIN}")
}

fn fold_ascii(ch: char) -> char {
    match ch {
        'á' | 'à' | 'ä' | 'â' | 'ã' | 'å' => 'a',
        'é' | 'è' | 'ë' | 'ê' => 'e',
        'í' | 'ì' | 'ï' | 'î' => 'i',
        'ó' | 'ò' | 'ö' | 'ô' | 'õ' => 'o',
        'ú' | 'ù' | 'ü' | 'û' => 'u',
        'ñ' => 'n',
        'ç' => 'c',
        other => other,
    }
}
