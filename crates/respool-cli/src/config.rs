//! Driver configuration with file persistence

use anyhow::{Context, anyhow, bail};
use respool_core::config::PoolConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest table the driver sets up
pub const MAX_PHILOSOPHERS: usize = 100;

/// respool driver configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dinner: DinnerConfig,
    pub pool: PoolConfig,
}

/// Dining philosophers workload settings, all durations in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DinnerConfig {
    pub philosophers: usize,
    pub forks_per_philosopher: usize,
    /// Total time the table is open
    pub dining_ms: u64,
    /// Minimum eat time, 0 turns eating delays off
    pub eat_ms: u64,
    /// Random extra eat time, below this value
    pub eat_random_ms: u64,
    /// Think time between meals, 0 turns thinking delays off
    pub think_ms: u64,
    /// How long to wait for forks per attempt, 0 waits forever
    pub max_wait_ms: u64,
    /// Philosophers pick up their first forks one by one
    pub ordered_start: bool,
    /// Seed for eat times, random if unset
    pub seed: Option<u64>,
}

impl Default for DinnerConfig {
    fn default() -> Self {
        Self {
            philosophers: 5,
            forks_per_philosopher: 2,
            dining_ms: 3_000,
            eat_ms: 50,
            eat_random_ms: 20,
            think_ms: 25,
            max_wait_ms: 71,
            ordered_start: true,
            seed: None,
        }
    }
}

impl DinnerConfig {
    /// Lock timeout per attempt, `None` waits forever
    pub fn max_wait(&self) -> Option<Duration> {
        (self.max_wait_ms > 0).then(|| Duration::from_millis(self.max_wait_ms))
    }

    /// Forks used by philosopher `number` (1-based), wrapping around the table
    pub fn forks_of(&self, number: usize) -> Vec<String> {
        (0..self.forks_per_philosopher)
            .map(|offset| format!("F{}", (number - 1 + offset) % self.philosophers + 1))
            .collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1..=MAX_PHILOSOPHERS).contains(&self.philosophers) {
            bail!(
                "philosophers must be between 1 and {}, got {}",
                MAX_PHILOSOPHERS,
                self.philosophers
            );
        }
        if !(1..=self.philosophers).contains(&self.forks_per_philosopher) {
            bail!(
                "forks_per_philosopher must be between 1 and the number of philosophers ({}), got {}",
                self.philosophers,
                self.forks_per_philosopher
            );
        }
        Ok(())
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("RESPOOL_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("respool")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load the default config file, or defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load a specific config file, which must exist
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default config file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        fs::write(&path, self.to_toml()?)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.dinner.validate()?;
        self.pool.validate()?;
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        let d = &self.dinner;
        let value = match key {
            "dinner.philosophers" => d.philosophers.to_string(),
            "dinner.forks_per_philosopher" => d.forks_per_philosopher.to_string(),
            "dinner.dining_ms" => d.dining_ms.to_string(),
            "dinner.eat_ms" => d.eat_ms.to_string(),
            "dinner.eat_random_ms" => d.eat_random_ms.to_string(),
            "dinner.think_ms" => d.think_ms.to_string(),
            "dinner.max_wait_ms" => d.max_wait_ms.to_string(),
            "dinner.ordered_start" => d.ordered_start.to_string(),
            "dinner.seed" => d.seed.map_or_else(|| "(random)".to_string(), |s| s.to_string()),
            "pool.event_capacity" => self.pool.event_capacity.to_string(),
            _ => bail!(
                "Unknown configuration key: {}. Use `respool config list` to see available keys.",
                key
            ),
        };
        Ok(value)
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let d = &mut self.dinner;
        match key {
            "dinner.philosophers" => d.philosophers = parse(key, value)?,
            "dinner.forks_per_philosopher" => d.forks_per_philosopher = parse(key, value)?,
            "dinner.dining_ms" => d.dining_ms = parse(key, value)?,
            "dinner.eat_ms" => d.eat_ms = parse(key, value)?,
            "dinner.eat_random_ms" => d.eat_random_ms = parse(key, value)?,
            "dinner.think_ms" => d.think_ms = parse(key, value)?,
            "dinner.max_wait_ms" => d.max_wait_ms = parse(key, value)?,
            "dinner.ordered_start" => d.ordered_start = parse(key, value)?,
            "dinner.seed" => {
                d.seed = match value.trim() {
                    "" | "random" | "(random)" => None,
                    seed => Some(parse(key, seed)?),
                }
            }
            "pool.event_capacity" => self.pool.event_capacity = parse(key, value)?,
            _ => bail!(
                "Unknown configuration key: {}. Use `respool config list` to see available keys.",
                key
            ),
        }
        self.validate()
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        const KEYS: [&str; 10] = [
            "dinner.philosophers",
            "dinner.forks_per_philosopher",
            "dinner.dining_ms",
            "dinner.eat_ms",
            "dinner.eat_random_ms",
            "dinner.think_ms",
            "dinner.max_wait_ms",
            "dinner.ordered_start",
            "dinner.seed",
            "pool.event_capacity",
        ];

        KEYS.into_iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

fn parse<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Invalid {} value: {}", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forks_wrap_around_table() {
        let dinner = DinnerConfig {
            philosophers: 5,
            forks_per_philosopher: 2,
            ..DinnerConfig::default()
        };
        assert_eq!(dinner.forks_of(1), vec!["F1", "F2"]);
        assert_eq!(dinner.forks_of(5), vec!["F5", "F1"]);

        let greedy = DinnerConfig {
            philosophers: 3,
            forks_per_philosopher: 3,
            ..DinnerConfig::default()
        };
        assert_eq!(greedy.forks_of(2), vec!["F2", "F3", "F1"]);
    }

    #[test]
    fn test_validation_limits() {
        let mut dinner = DinnerConfig::default();
        assert!(dinner.validate().is_ok());

        dinner.philosophers = 0;
        assert!(dinner.validate().is_err());
        dinner.philosophers = MAX_PHILOSOPHERS + 1;
        assert!(dinner.validate().is_err());

        dinner.philosophers = 3;
        dinner.forks_per_philosopher = 4;
        assert!(dinner.validate().is_err());
        dinner.forks_per_philosopher = 0;
        assert!(dinner.validate().is_err());
    }

    #[test]
    fn test_max_wait_zero_means_forever() {
        let mut dinner = DinnerConfig::default();
        assert_eq!(dinner.max_wait(), Some(Duration::from_millis(71)));
        dinner.max_wait_ms = 0;
        assert!(dinner.max_wait().is_none());
    }

    #[test]
    fn test_get_set_list() {
        let mut config = Config::default();
        config.set("dinner.philosophers", "7").unwrap();
        assert_eq!(config.get("dinner.philosophers").unwrap(), "7");

        assert!(config.set("dinner.philosophers", "many").is_err());
        assert!(config.set("dinner.forks_per_philosopher", "9").is_err());
        assert!(config.get("dinner.unknown").is_err());

        let items = config.list().unwrap();
        assert_eq!(items.len(), 10);
        assert!(items.contains(&("dinner.seed".to_string(), "(random)".to_string())));
    }

    #[test]
    fn test_seed_can_be_unset() {
        let mut config = Config::default();
        config.set("dinner.seed", "42").unwrap();
        assert_eq!(config.dinner.seed, Some(42));
        assert_eq!(config.get("dinner.seed").unwrap(), "42");

        config.set("dinner.seed", "random").unwrap();
        assert!(config.dinner.seed.is_none());
        assert_eq!(config.get("dinner.seed").unwrap(), "(random)");

        config.set("dinner.seed", "7").unwrap();
        config.set("dinner.seed", "").unwrap();
        assert!(config.dinner.seed.is_none());
        assert!(config.set("dinner.seed", "sometimes").is_err());
    }

    #[test]
    fn test_toml_round_trip_with_partial_file() {
        let config: Config = toml::from_str("[dinner]\nphilosophers = 3\n").unwrap();
        assert_eq!(config.dinner.philosophers, 3);
        assert_eq!(config.dinner.eat_ms, 50);
        assert_eq!(config.pool, PoolConfig::default());

        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("philosophers = 3"));
    }

    #[test]
    fn test_load_from_rejects_invalid_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[dinner]\nphilosophers = 0\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("philosophers"));
        assert!(Config::load_from(&dir.path().join("missing.toml")).is_err());
    }
}
