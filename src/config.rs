use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDate};
use clap::Args;
use std::path::PathBuf;

use crate::db::Database;
use crate::lifecycle::DEFAULT_SOON_DAYS;

/// Flags shared by every subcommand; each falls back to an environment variable.
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Path to the SQLite database
    #[arg(long, env = "JOBTRACK_DB", global = true)]
    pub db: Option<PathBuf>,

    /// Days ahead an interview counts as "soon"
    #[arg(long, env = "JOBTRACK_SOON_DAYS", global = true)]
    pub soon_days: Option<i64>,

    /// Treat this date (YYYY-MM-DD) as today
    #[arg(long, global = true)]
    pub today: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub soon_days: i64,
    pub today: NaiveDate,
}

impl ConfigArgs {
    pub fn resolve(self) -> Result<Config> {
        let soon_days = self.soon_days.unwrap_or(DEFAULT_SOON_DAYS);
        if soon_days < 0 {
            return Err(anyhow!("--soon-days must not be negative (got {})", soon_days));
        }

        let today = match self.today.as_deref() {
            Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .with_context(|| format!("--today '{}' is not a YYYY-MM-DD date", raw))?,
            None => Local::now().date_naive(),
        };

        Ok(Config {
            db_path: self.db.unwrap_or_else(Database::default_path),
            soon_days,
            today,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConfigArgs::default().resolve().unwrap();
        assert_eq!(config.soon_days, DEFAULT_SOON_DAYS);
        assert!(config.db_path.ends_with("jobtrack.db"));
        assert_eq!(config.today, Local::now().date_naive());
    }

    #[test]
    fn test_overrides() {
        let config = ConfigArgs {
            db: Some(PathBuf::from("/tmp/jt.db")),
            soon_days: Some(5),
            today: Some("2024-01-10".to_string()),
        }
        .resolve()
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/jt.db"));
        assert_eq!(config.soon_days, 5);
        assert_eq!(config.today, NaiveDate::from_ymd_opt(2024, 1, 10).unwrap());
    }

    #[test]
    fn test_rejects_bad_values() {
        let negative = ConfigArgs {
            soon_days: Some(-1),
            ..Default::default()
        };
        assert!(negative.resolve().is_err());

        let bad_day = ConfigArgs {
            today: Some("10/01/2024".to_string()),
            ..Default::default()
        };
        assert!(bad_day.resolve().is_err());
    }
}
