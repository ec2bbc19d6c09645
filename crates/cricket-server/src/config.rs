// Configuration loading and validation (config/server.toml).

use std::path::{Path, PathBuf};

use cricket_core::room::RoomConfig;
use cricket_core::rules::{AuctionRules, BID_UNIT_LAKHS};
use serde::Deserialize;
use thiserror::Error;

const CONFIG_FILE: &str = "server.toml";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// server.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub auction: AuctionSection,
    pub scoring: ScoringSection,
    pub data: DataSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    pub port: u16,
}

fn default_bind() -> String {
    "127.0.0.1".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSection {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuctionSection {
    pub bid_window_secs: u64,
    pub result_window_secs: u64,
    pub tick_interval_ms: u64,
    pub initial_purse_lakhs: u32,
    pub time_bank_seconds: u32,
    pub time_bank_step_secs: u32,
    pub max_squad_size: usize,
}

/// Defaults applied to every newly created room.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoringSection {
    pub season: String,
    pub cf1: f64,
    pub cf2: f64,
    pub cf3: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataSection {
    pub seasons_dir: PathBuf,
}

impl Config {
    /// Timing and money rules handed to the auction core.
    pub fn rules(&self) -> AuctionRules {
        let a = &self.auction;
        AuctionRules {
            bid_window_ms: (a.bid_window_secs * 1_000) as i64,
            result_window_ms: (a.result_window_secs * 1_000) as i64,
            initial_purse_lakhs: a.initial_purse_lakhs,
            time_bank_seconds: a.time_bank_seconds,
            time_bank_step_secs: a.time_bank_step_secs,
            max_squad_size: a.max_squad_size,
        }
    }

    /// Season and coefficients a new room starts with.
    pub fn room_defaults(&self) -> RoomConfig {
        RoomConfig {
            season: self.scoring.season.clone(),
            cf1: self.scoring.cf1,
            cf2: self.scoring.cf2,
            cf3: self.scoring.cf3,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate `config/server.toml` relative to `base_dir`. Does not
/// copy defaults; see [`load_config`].
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let path = base_dir.join("config").join(CONFIG_FILE);
    let text = read_file(&path)?;
    let mut config: Config = toml::from_str(&text).map_err(|e| ConfigError::ParseError {
        path: path.clone(),
        source: e,
    })?;

    if config.data.seasons_dir.is_relative() {
        config.data.seasons_dir = base_dir.join(&config.data.seasons_dir);
    }

    validate(&config)?;
    Ok(config)
}

/// Seed `config/server.toml` from `defaults/server.toml` on first run.
///
/// An existing `config/server.toml` is never touched, even when `defaults/`
/// is absent. Returns the path written, if any.
pub fn ensure_server_config(base_dir: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let target = base_dir.join("config").join(CONFIG_FILE);
    if target.is_file() {
        return Ok(None);
    }

    let source = base_dir.join("defaults").join(CONFIG_FILE);
    let content = std::fs::read(&source).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!(
            "no config/{CONFIG_FILE} in {} and defaults/{CONFIG_FILE} is unreadable ({e}); \
             run from the server directory",
            base_dir.display()
        ),
    })?;

    if let Some(dir) = target.parent() {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("failed to create {}: {e}", dir.display()),
        })?;
    }

    // create_new: a file that appeared since the check above wins.
    let mut dest = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&target)
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => {
            return Err(ConfigError::DefaultsCopyError {
                message: format!("failed to create {}: {e}", target.display()),
            })
        }
    };
    std::io::Write::write_all(&mut dest, &content).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to write {}: {e}", target.display()),
    })?;
    Ok(Some(target))
}

/// Load config relative to the working directory, copying defaults first.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_server_config(&cwd)?;
    load_config_from(&cwd)
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.into(),
        message: message.into(),
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let a = &config.auction;
    let positive: &[(&str, u64)] = &[
        ("auction.bid_window_secs", a.bid_window_secs),
        ("auction.result_window_secs", a.result_window_secs),
        ("auction.tick_interval_ms", a.tick_interval_ms),
        ("auction.time_bank_step_secs", u64::from(a.time_bank_step_secs)),
        ("auction.max_squad_size", a.max_squad_size as u64),
    ];
    for (name, val) in positive {
        if *val == 0 {
            return Err(invalid(name, "must be > 0"));
        }
    }

    if a.initial_purse_lakhs == 0 || a.initial_purse_lakhs % BID_UNIT_LAKHS != 0 {
        return Err(invalid(
            "auction.initial_purse_lakhs",
            format!(
                "must be a positive multiple of {BID_UNIT_LAKHS}, got {}",
                a.initial_purse_lakhs
            ),
        ));
    }

    let s = &config.scoring;
    if s.season.trim().is_empty() {
        return Err(invalid("scoring.season", "must not be empty"));
    }
    for (name, val) in [("scoring.cf1", s.cf1), ("scoring.cf2", s.cf2), ("scoring.cf3", s.cf3)] {
        if !val.is_finite() {
            return Err(invalid(name, format!("must be a finite number, got {val}")));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// The cricket-server crate root, wherever `cargo test` was started.
    fn project_root() -> PathBuf {
        let cwd = std::env::current_dir().unwrap();
        if cwd.join("defaults").exists() {
            cwd
        } else if cwd.join("crates/cricket-server/defaults").exists() {
            cwd.join("crates/cricket-server")
        } else {
            panic!("Cannot locate defaults/ directory from CWD {:?}", cwd);
        }
    }

    fn default_text() -> String {
        fs::read_to_string(project_root().join("defaults").join(CONFIG_FILE)).unwrap()
    }

    /// Write `text` as config/server.toml under a fresh temp dir.
    fn temp_config(name: &str, text: &str) -> PathBuf {
        let tmp = std::env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(tmp.join("config")).unwrap();
        fs::write(tmp.join("config").join(CONFIG_FILE), text).unwrap();
        tmp
    }

    fn expect_invalid(name: &str, text: &str, field: &str) {
        let tmp = temp_config(name, text);
        match load_config_from(&tmp).unwrap_err() {
            ConfigError::ValidationError { field: f, .. } => assert_eq!(f, field),
            other => panic!("expected ValidationError, got: {other}"),
        }
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn default_config_loads() {
        let tmp = temp_config("cricket_config_defaults", &default_text());
        let config = load_config_from(&tmp).expect("defaults should be valid");

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.listen_addr(), "127.0.0.1:9100");
        assert_eq!(config.database.path, "cricket-auction.db");
        assert_eq!(config.auction.tick_interval_ms, 300);
        assert_eq!(config.scoring.season, "2024");
        assert_eq!(config.data.seasons_dir, tmp.join("data/seasons"));

        let rules = config.rules();
        assert_eq!(rules, AuctionRules::default());

        let room = config.room_defaults();
        assert_eq!(room.cf1, 30.0);
        assert_eq!(room.cf2, 2000.0);
        assert_eq!(room.cf3, 1.0);

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_zero_bid_window() {
        let text = default_text().replace("bid_window_secs = 30", "bid_window_secs = 0");
        expect_invalid("cricket_config_zero_window", &text, "auction.bid_window_secs");
    }

    #[test]
    fn rejects_zero_tick() {
        let text = default_text().replace("tick_interval_ms = 300", "tick_interval_ms = 0");
        expect_invalid("cricket_config_zero_tick", &text, "auction.tick_interval_ms");
    }

    #[test]
    fn rejects_purse_off_bid_unit() {
        let text =
            default_text().replace("initial_purse_lakhs = 10000", "initial_purse_lakhs = 10025");
        expect_invalid("cricket_config_bad_purse", &text, "auction.initial_purse_lakhs");
    }

    #[test]
    fn rejects_non_finite_coefficient() {
        let text = default_text().replace("cf2 = 2000.0", "cf2 = nan");
        expect_invalid("cricket_config_nan_cf2", &text, "scoring.cf2");
    }

    #[test]
    fn parse_error_for_invalid_toml() {
        let tmp = temp_config("cricket_config_bad_toml", "[server\nport = ");
        match load_config_from(&tmp).unwrap_err() {
            ConfigError::ParseError { path, .. } => assert!(path.ends_with(CONFIG_FILE)),
            other => panic!("expected ParseError, got: {other}"),
        }
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn file_not_found_without_config() {
        let tmp = std::env::temp_dir().join("cricket_config_missing");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        match load_config_from(&tmp).unwrap_err() {
            ConfigError::FileNotFound { path } => assert!(path.ends_with(CONFIG_FILE)),
            other => panic!("expected FileNotFound, got: {other}"),
        }
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn absolute_seasons_dir_is_kept() {
        let text = default_text().replace(
            "seasons_dir = \"data/seasons\"",
            "seasons_dir = \"/srv/cricket/seasons\"",
        );
        let tmp = temp_config("cricket_config_abs_seasons", &text);
        let config = load_config_from(&tmp).unwrap();
        assert_eq!(config.data.seasons_dir, PathBuf::from("/srv/cricket/seasons"));
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn server_config_seeded_once_from_defaults() {
        let tmp = std::env::temp_dir().join("cricket_config_ensure");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(tmp.join("defaults")).unwrap();
        fs::write(tmp.join("defaults").join(CONFIG_FILE), default_text()).unwrap();

        let written = ensure_server_config(&tmp).unwrap();
        assert_eq!(written, Some(tmp.join("config").join(CONFIG_FILE)));
        assert!(load_config_from(&tmp).is_ok());

        fs::write(tmp.join("config").join(CONFIG_FILE), "# custom\n").unwrap();
        assert_eq!(ensure_server_config(&tmp).unwrap(), None);
        let content = fs::read_to_string(tmp.join("config").join(CONFIG_FILE)).unwrap();
        assert_eq!(content, "# custom\n");

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn existing_server_config_needs_no_defaults() {
        let tmp = std::env::temp_dir().join("cricket_config_no_defaults");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(tmp.join("config")).unwrap();
        fs::write(tmp.join("config").join(CONFIG_FILE), default_text()).unwrap();

        assert_eq!(ensure_server_config(&tmp).unwrap(), None);
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn missing_config_and_defaults_is_an_error() {
        let tmp = std::env::temp_dir().join("cricket_config_both_missing");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        match ensure_server_config(&tmp).unwrap_err() {
            ConfigError::DefaultsCopyError { message } => {
                assert!(message.contains("defaults/server.toml"));
            }
            other => panic!("expected DefaultsCopyError, got: {other}"),
        }
        assert!(!tmp.join("config").exists());
        let _ = fs::remove_dir_all(&tmp);
    }
}
