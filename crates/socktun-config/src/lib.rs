use std::fs;
use std::path::{Path, PathBuf};
use directories::BaseDirs;
use socktun_traits::config::{Config, ConfigError, ConfigService};

pub use socktun_traits::config::{HostKeyPolicy, SessionConfig, Timings};

pub struct ConfigServiceImpl;

impl ConfigService for ConfigServiceImpl {
    fn load_from_paths() -> Result<Config, ConfigError> {
        let home_dir_path = BaseDirs::new().map(|dirs| {
            dirs.home_dir().join(".socktun/config.json")
        });

        let current_dir_path = Path::new("./socktun.json").to_path_buf();

        let paths_to_check = [
            home_dir_path,
            Some(current_dir_path)
        ];

        for path in paths_to_check.iter().flatten() {
            if path.exists() {
                return Self::load_from(path);
            }
        }

        // No config file anywhere: every field stays unset so defaults and flags decide.
        Ok(Config::empty())
    }

    fn load_from<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    fn expand_tilde<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
        let path = path.as_ref();
        let Ok(rest) = path.strip_prefix("~") else {
            return Some(path.to_path_buf());
        };

        BaseDirs::new().map(|dirs| dirs.home_dir().join(rest))
    }
}

pub fn load_from_paths() -> Result<Config, ConfigError> {
    ConfigServiceImpl::load_from_paths()
}

pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    ConfigServiceImpl::load_from(path)
}

pub fn expand_tilde<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    ConfigServiceImpl::expand_tilde(path)
}
