//! Process-wide service settings, loaded from TOML once at startup and
//! immutable afterwards.

use std::path::{Path, PathBuf};
use std::{env, fs};

use serde::Deserialize;
use thiserror::Error;
use windows_sys::Win32::System::Threading::{
    ABOVE_NORMAL_PRIORITY_CLASS, BELOW_NORMAL_PRIORITY_CLASS, HIGH_PRIORITY_CLASS,
    IDLE_PRIORITY_CLASS, NORMAL_PRIORITY_CLASS,
};

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("I/O error while accessing `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Parse(toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Priority class the engine process is created with.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Idle,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    High,
}

impl PriorityClass {
    pub fn creation_flag(self) -> u32 {
        match self {
            PriorityClass::Idle => IDLE_PRIORITY_CLASS,
            PriorityClass::BelowNormal => BELOW_NORMAL_PRIORITY_CLASS,
            PriorityClass::Normal => NORMAL_PRIORITY_CLASS,
            PriorityClass::AboveNormal => ABOVE_NORMAL_PRIORITY_CLASS,
            PriorityClass::High => HIGH_PRIORITY_CLASS,
        }
    }
}

fn default_admin_group() -> String {
    "TunServ Administrators".to_string()
}

fn default_service_user() -> String {
    "SYSTEM".to_string()
}

/// Full service configuration, loaded from `tunserv.toml`.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Absolute path of the engine executable launched for clients.
    pub engine_path: PathBuf,
    /// Members of this group may run arbitrary engine options.
    #[serde(default = "default_admin_group")]
    pub admin_group: String,
    /// Account name treated like a group member.
    #[serde(default = "default_service_user")]
    pub service_user: String,
    /// Priority class for the engine process.
    #[serde(default)]
    pub priority: PriorityClass,
    /// Optional suffix distinguishing parallel service instances; becomes
    /// part of the pipe names.
    #[serde(default)]
    pub instance: String,
}

impl Settings {
    /// Load, parse and validate the settings file.
    pub fn load(path: &Path) -> Result<Settings, SettingsError> {
        let s = fs::read_to_string(path).map_err(|e| SettingsError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let settings: Settings = toml::from_str(&s).map_err(SettingsError::Parse)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if !self.engine_path.is_absolute() {
            return Err(SettingsError::Validation(format!(
                "engine_path must be absolute, got `{}`",
                self.engine_path.display()
            )));
        }
        if self.admin_group.trim().is_empty() {
            return Err(SettingsError::Validation("admin_group must not be empty".into()));
        }
        // The instance suffix lands inside pipe names; keep it boring.
        if !self
            .instance
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(SettingsError::Validation(format!(
                "instance suffix `{}` may only contain letters, digits, '-' and '_'",
                self.instance
            )));
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn from_str(toml: &str) -> Result<Settings, SettingsError> {
        let settings: Settings = toml::from_str(toml).map_err(SettingsError::Parse)?;
        settings.validate()?;
        Ok(settings)
    }
}

/// Find the settings file: an override environment variable first, then
/// `tunserv.toml` next to the running executable.
pub fn find_settings_file() -> PathBuf {
    if let Some(cfg) = env::var_os("TUNSERV_CONFIG") {
        return PathBuf::from(cfg);
    }

    let mut exe_path = env::current_exe().unwrap_or_else(|_| PathBuf::from("."));
    exe_path.pop();
    exe_path.push("tunserv.toml");
    exe_path
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
    engine_path = "C:\\Program Files\\TunServ\\engine.exe"
    admin_group = "Tunnel Operators"
    service_user = "LocalService"
    priority = "below_normal"
    instance = "-test"
    "#;

    #[test]
    fn parse_full_settings() {
        let s = Settings::from_str(SAMPLE).expect("should parse full sample");
        assert_eq!(
            s.engine_path,
            PathBuf::from("C:\\Program Files\\TunServ\\engine.exe")
        );
        assert_eq!(s.admin_group, "Tunnel Operators");
        assert_eq!(s.service_user, "LocalService");
        assert_eq!(s.priority, PriorityClass::BelowNormal);
        assert_eq!(s.instance, "-test");
    }

    #[test]
    fn optional_fields_have_defaults() {
        let s = Settings::from_str(r#"engine_path = "C:\\x\\engine.exe""#).unwrap();
        assert_eq!(s.admin_group, "TunServ Administrators");
        assert_eq!(s.service_user, "SYSTEM");
        assert_eq!(s.priority, PriorityClass::Normal);
        assert_eq!(s.instance, "");
    }

    #[test]
    fn relative_engine_path_is_rejected() {
        assert!(matches!(
            Settings::from_str(r#"engine_path = "engine.exe""#).unwrap_err(),
            SettingsError::Validation(_)
        ));
    }

    #[test]
    fn unknown_priority_is_a_parse_error() {
        let toml = r#"
        engine_path = "C:\\x\\engine.exe"
        priority = "turbo"
        "#;
        assert!(matches!(
            Settings::from_str(toml).unwrap_err(),
            SettingsError::Parse(_)
        ));
    }

    #[test]
    fn instance_suffix_is_restricted() {
        let toml = r#"
        engine_path = "C:\\x\\engine.exe"
        instance = "bad\\name"
        "#;
        assert!(matches!(
            Settings::from_str(toml).unwrap_err(),
            SettingsError::Validation(_)
        ));
    }
}
