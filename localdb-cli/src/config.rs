use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use localdb_core::{Scope, DEFAULT_PROGRAM};
use serde::{Deserialize, Serialize};

pub const ENV_UTILITY: &str = "EPHEMERAL_LOCALDB_UTILITY";
pub const ENV_SCOPE: &str = "EPHEMERAL_LOCALDB_SCOPE";
pub const ENV_TIMEOUT_SECS: &str = "EPHEMERAL_LOCALDB_TIMEOUT_SECS";
pub const ENV_DEBUG: &str = "EPHEMERAL_LOCALDB_DEBUG";

const LOCAL_CONFIG_FILE: &str = "ephemeral-localdb.toml";

/// Where config files were found, and what went wrong reading them.
///
/// Settings load before tracing is up, so the caller logs this afterwards.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub warnings: Vec<String>,
}

/// Load `./.env` into the process environment (existing vars win)
pub fn load_dotenv(report: &mut LoadReport) {
    if let Ok(path) = dotenvy::dotenv() {
        report.loaded.push(format!(".env ({})", path.display()));
    }
}

/// Get the config directory path (~/.ephemeral-localdb)
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ephemeral-localdb"))
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub utility: UtilitySettings,

    #[serde(default)]
    pub naming: NamingSettings,

    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UtilitySettings {
    /// SqlLocalDB executable, bare name or path
    #[serde(default = "default_program")]
    pub program: String,

    /// Per-invocation limit; unset waits indefinitely
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for UtilitySettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NamingSettings {
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LogSettings {
    #[serde(default)]
    pub debug: bool,
}

fn default_program() -> String {
    DEFAULT_PROGRAM.to_string()
}

/// One config file as written; absent sections leave earlier sources untouched
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct SettingsFile {
    pub utility: Option<UtilitySettings>,
    pub naming: Option<NamingSettings>,
    pub log: Option<LogSettings>,
}

impl SettingsFile {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Invalid settings TOML")
    }
}

impl Settings {
    /// Load settings from TOML files and the environment
    ///
    /// Priority order (highest to lowest):
    /// 1. EPHEMERAL_LOCALDB_* environment variables
    /// 2. ./ephemeral-localdb.toml
    /// 3. ~/.ephemeral-localdb/config.toml
    /// 4. Built-in defaults
    pub fn load(report: &mut LoadReport) -> Result<Self> {
        let mut settings = Settings::default();

        if let Some(global) = config_dir().map(|dir| dir.join("config.toml")) {
            if let Some(file) = read_file(&global, report) {
                settings = Self::merge(settings, file);
            }
        }

        if let Some(local) = read_file(Path::new(LOCAL_CONFIG_FILE), report) {
            settings = Self::merge(settings, local);
        }

        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        SettingsFile::from_toml_str(contents).map(|file| Self::merge(Self::default(), file))
    }

    /// Overlay the sections a file declares; the rest of `base` is kept
    fn merge(mut base: Self, overlay: SettingsFile) -> Self {
        if let Some(utility) = overlay.utility {
            base.utility = utility;
        }
        if let Some(naming) = overlay.naming {
            base.naming = naming;
        }
        if let Some(log) = overlay.log {
            base.log = log;
        }
        base
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(program) = lookup(ENV_UTILITY).filter(|v| !v.trim().is_empty()) {
            self.utility.program = program;
        }

        if let Some(scope) = lookup(ENV_SCOPE) {
            self.naming.scope = Some(scope);
        }

        if let Some(raw) = lookup(ENV_TIMEOUT_SECS) {
            let secs = raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("{} must be a whole number of seconds, got '{}'", ENV_TIMEOUT_SECS, raw))?;
            self.utility.timeout_secs = Some(secs);
        }

        if let Some(raw) = lookup(ENV_DEBUG) {
            self.log.debug = matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }

        Ok(())
    }

    /// Configured naming scope, or the built-in default
    pub fn scope(&self) -> Result<Scope> {
        match &self.naming.scope {
            Some(raw) => raw.parse::<Scope>().map_err(Into::into),
            None => Ok(Scope::DEFAULT),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.utility.timeout_secs.map(Duration::from_secs)
    }
}

fn read_file(path: &Path, report: &mut LoadReport) -> Option<SettingsFile> {
    if !path.exists() {
        return None;
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match SettingsFile::from_toml_str(&contents) {
            Ok(settings) => {
                report.loaded.push(path.display().to_string());
                Some(settings)
            }
            Err(e) => {
                report
                    .warnings
                    .push(format!("Failed to parse {}: {:#}", path.display(), e));
                None
            }
        },
        Err(e) => {
            report
                .warnings
                .push(format!("Failed to read {}: {}", path.display(), e));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.utility.program, "sqllocaldb");
        assert_eq!(settings.timeout(), None);
        assert_eq!(settings.scope().unwrap(), Scope::BinaryName);
        assert!(!settings.log.debug);
    }

    #[test]
    fn test_parse_toml() {
        let settings = Settings::from_toml_str(
            r#"
            [utility]
            program = 'C:\Program Files\Microsoft SQL Server\160\Tools\Binn\SqlLocalDB.exe'
            timeout_secs = 90

            [naming]
            scope = "random"
            "#,
        )
        .unwrap();

        assert!(settings.utility.program.ends_with("SqlLocalDB.exe"));
        assert_eq!(settings.timeout(), Some(Duration::from_secs(90)));
        assert_eq!(settings.scope().unwrap(), Scope::Random);
        assert!(!settings.log.debug);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        assert_eq!(Settings::from_toml_str("").unwrap(), Settings::default());
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(Settings::from_toml_str("[utility]\ntimeout_secs = 'soon'").is_err());
    }

    #[test]
    fn test_merge_local_over_global() {
        let global = Settings::from_toml_str("[utility]\nprogram = 'global'\n[log]\ndebug = true").unwrap();
        let local = SettingsFile::from_toml_str("[utility]\nprogram = 'local'").unwrap();

        let merged = Settings::merge(global, local);
        assert_eq!(merged.utility.program, "local");
        assert!(merged.log.debug);
    }

    #[test]
    fn test_local_file_keeps_sections_it_omits() {
        let global = Settings::from_toml_str(
            "[utility]\nprogram = 'global'\ntimeout_secs = 30\n[log]\ndebug = true",
        )
        .unwrap();
        let local = SettingsFile::from_toml_str("[naming]\nscope = 'random'").unwrap();
        assert_eq!(local.log, None);

        let merged = Settings::merge(global, local);
        assert_eq!(merged.scope().unwrap(), Scope::Random);
        assert!(merged.log.debug);
        assert_eq!(merged.utility.program, "global");
        assert_eq!(merged.timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = Settings::default();
        settings
            .apply_env(env(&[
                (ENV_UTILITY, "/opt/fake/sqllocaldb"),
                (ENV_SCOPE, "process-id"),
                (ENV_TIMEOUT_SECS, " 15 "),
                (ENV_DEBUG, "true"),
            ]))
            .unwrap();

        assert_eq!(settings.utility.program, "/opt/fake/sqllocaldb");
        assert_eq!(settings.scope().unwrap(), Scope::ProcessId);
        assert_eq!(settings.timeout(), Some(Duration::from_secs(15)));
        assert!(settings.log.debug);
    }

    #[test]
    fn test_blank_utility_env_ignored() {
        let mut settings = Settings::default();
        settings.apply_env(env(&[(ENV_UTILITY, "  ")])).unwrap();
        assert_eq!(settings.utility.program, "sqllocaldb");
    }

    #[test]
    fn test_bad_timeout_env_is_error() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env(env(&[(ENV_TIMEOUT_SECS, "forever")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_TIMEOUT_SECS));
    }

    #[test]
    fn test_unknown_scope_is_error() {
        let mut settings = Settings::default();
        settings.apply_env(env(&[(ENV_SCOPE, "assembly-name")])).unwrap();

        let err = settings.scope().unwrap_err();
        assert!(err.to_string().contains("unknown naming scope"));
    }

    #[test]
    fn test_config_dir_returns_path() {
        if let Some(path) = config_dir() {
            assert!(path.ends_with(".ephemeral-localdb"));
        }
    }
}
