//! Configuration loading and environment resolution.
//!
//! Settings come from three places, in increasing precedence: the JSON config
//! file, environment variables, and command-line flags. The result is a
//! [`ServerConfig`] that both the supervisor and each worker build the same way.
//!
//! ```json
//! {
//!   "app": { "env": "production", "port": 3000, "static_dir": "static" },
//!   "encryption": { "session": "change-me" },
//!   "session": { "store": "file", "dir": "/var/lib/webfleet/sessions", "ttl_secs": 86400 }
//! }
//! ```

use crate::cli::ServeArgs;
use crate::error::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Session secret used outside production.
pub const DEV_SESSION_SECRET: &str = "local-secret-is-not-so-secret";

/// Session cookie name in production.
pub const PROD_COOKIE_NAME: &str = "sid";

/// Session cookie name outside production.
pub const DEV_COOKIE_NAME: &str = "sid.local";

/// Deployment environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local mode: one worker, memory sessions, request logging.
    #[default]
    Development,
    /// Hosted mode: one worker per core, configured sessions.
    Production,
}

impl Environment {
    /// Resolve the environment from the `--dev` flag, the `WEBFLEET_ENV`
    /// value and the config file's `app.env`.
    ///
    /// Production is only selected when nothing asks for development and the
    /// environment variable explicitly says `production`.
    pub fn resolve(dev_flag: bool, env_var: Option<&str>, file_env: Option<&str>) -> Self {
        let wants_production = env_var
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);
        let file_says_dev = file_env
            .map(|v| v.eq_ignore_ascii_case("development"))
            .unwrap_or(false);

        if dev_flag || !wants_production || file_says_dev {
            Self::Development
        } else {
            Self::Production
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Process-local map. Sessions are not shared between workers.
    Memory,
    /// One JSON file per session in a shared directory.
    File,
}

/// Contents of the JSON config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub encryption: EncryptionSection,
    #[serde(default)]
    pub session: SessionSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSection {
    /// `development` forces local mode regardless of `WEBFLEET_ENV`.
    #[serde(default)]
    pub env: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
    /// Directory of `.html` views overriding the embedded ones.
    #[serde(default)]
    pub views_dir: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            env: None,
            host: default_host(),
            port: default_port(),
            static_dir: default_static_dir(),
            views_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionSection {
    /// Key used to sign session cookies.
    #[serde(default)]
    pub session: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default)]
    pub store: Option<StoreKind>,
    /// Directory for the `file` store.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            store: None,
            dir: None,
            ttl_secs: default_session_ttl(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

fn default_session_ttl() -> u64 {
    24 * 60 * 60
}

impl FileConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            FleetError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        serde_json::from_str(&content)
            .map_err(|e| FleetError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load the config file if it exists, otherwise fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file found, using defaults");
            Ok(Self::default())
        }
    }
}

/// Resolved session settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub cookie_name: &'static str,
    pub secure: bool,
    pub secret: String,
    pub store: StoreKind,
    pub dir: Option<PathBuf>,
    pub ttl: Duration,
}

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub environment: Environment,
    pub host: String,
    pub port: u16,
    /// Number of worker processes the supervisor keeps alive.
    pub workers: usize,
    pub static_dir: PathBuf,
    pub views_dir: Option<PathBuf>,
    pub session: SessionSettings,
}

impl ServerConfig {
    /// Combine the config file with command-line arguments.
    ///
    /// In production a missing session secret or store is a fatal error
    /// rather than a silent fallback to development defaults.
    pub fn resolve(file: FileConfig, args: &ServeArgs) -> Result<Self> {
        let environment = Environment::resolve(
            args.dev,
            args.environment.as_deref(),
            file.app.env.as_deref(),
        );

        let workers = match args.workers {
            Some(0) => {
                return Err(FleetError::Config(
                    "worker count must be at least 1".to_string(),
                ));
            }
            Some(n) => n,
            None if environment.is_production() => available_cores(),
            None => 1,
        };

        let session = if environment.is_production() {
            let secret = file
                .encryption
                .session
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| {
                    FleetError::Config("encryption.session must be set in production".to_string())
                })?;
            let store = file.session.store.ok_or_else(|| {
                FleetError::Config("session.store must be set in production".to_string())
            })?;
            if store == StoreKind::File && file.session.dir.is_none() {
                return Err(FleetError::Config(
                    "session.dir is required for the file session store".to_string(),
                ));
            }
            SessionSettings {
                cookie_name: PROD_COOKIE_NAME,
                secure: true,
                secret,
                store,
                dir: file.session.dir,
                ttl: Duration::from_secs(file.session.ttl_secs),
            }
        } else {
            SessionSettings {
                cookie_name: DEV_COOKIE_NAME,
                secure: false,
                secret: DEV_SESSION_SECRET.to_string(),
                store: StoreKind::Memory,
                dir: None,
                ttl: Duration::from_secs(file.session.ttl_secs),
            }
        };

        Ok(Self {
            environment,
            host: args.host.clone().unwrap_or(file.app.host),
            port: args.port.unwrap_or(file.app.port),
            workers,
            static_dir: file.app.static_dir,
            views_dir: file.app.views_dir,
            session,
        })
    }

    /// Address string for binding the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    fn serve_args(extra: &[&str]) -> ServeArgs {
        #[derive(Parser)]
        struct Wrapper {
            #[command(flatten)]
            serve: ServeArgs,
        }
        let mut argv = vec!["webfleet"];
        argv.extend_from_slice(extra);
        Wrapper::try_parse_from(argv).unwrap().serve
    }

    fn production_file() -> FileConfig {
        let mut file = FileConfig::default();
        file.encryption.session = Some("s3cret".to_string());
        file.session.store = Some(StoreKind::Memory);
        file
    }

    #[test]
    fn test_environment_resolution() {
        assert_eq!(
            Environment::resolve(false, Some("production"), None),
            Environment::Production
        );
        assert_eq!(
            Environment::resolve(true, Some("production"), None),
            Environment::Development
        );
        assert_eq!(
            Environment::resolve(false, None, None),
            Environment::Development
        );
        assert_eq!(
            Environment::resolve(false, Some("staging"), None),
            Environment::Development
        );
        assert_eq!(
            Environment::resolve(false, Some("PRODUCTION"), Some("development")),
            Environment::Development
        );
    }

    #[test]
    fn test_defaults() {
        let config = FileConfig::default();
        assert_eq!(config.app.port, 3000);
        assert_eq!(config.app.host, "0.0.0.0");
        assert_eq!(config.session.ttl_secs, 86400);
        assert!(config.session.store.is_none());
    }

    #[test]
    fn test_development_uses_fixed_session_defaults() {
        let config = ServerConfig::resolve(FileConfig::default(), &serve_args(&[])).unwrap();
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.workers, 1);
        assert_eq!(config.session.cookie_name, DEV_COOKIE_NAME);
        assert_eq!(config.session.secret, DEV_SESSION_SECRET);
        assert_eq!(config.session.store, StoreKind::Memory);
        assert!(!config.session.secure);
    }

    #[test]
    fn test_production_requires_session_secret() {
        let mut file = production_file();
        file.encryption.session = None;
        let err = ServerConfig::resolve(file, &serve_args(&["--env", "production"])).unwrap_err();
        assert!(err.to_string().contains("encryption.session"));
    }

    #[test]
    fn test_production_rejects_blank_secret() {
        let mut file = production_file();
        file.encryption.session = Some("   ".to_string());
        assert!(ServerConfig::resolve(file, &serve_args(&["--env", "production"])).is_err());
    }

    #[test]
    fn test_production_requires_store() {
        let mut file = production_file();
        file.session.store = None;
        let err = ServerConfig::resolve(file, &serve_args(&["--env", "production"])).unwrap_err();
        assert!(err.to_string().contains("session.store"));
    }

    #[test]
    fn test_file_store_requires_dir() {
        let mut file = production_file();
        file.session.store = Some(StoreKind::File);
        let err = ServerConfig::resolve(file, &serve_args(&["--env", "production"])).unwrap_err();
        assert!(err.to_string().contains("session.dir"));
    }

    #[test]
    fn test_production_settings() {
        let config =
            ServerConfig::resolve(production_file(), &serve_args(&["--env", "production"]))
                .unwrap();
        assert!(config.environment.is_production());
        assert_eq!(config.workers, available_cores());
        assert_eq!(config.session.cookie_name, PROD_COOKIE_NAME);
        assert_eq!(config.session.secret, "s3cret");
        assert!(config.session.secure);
    }

    #[test]
    fn test_cli_overrides_file() {
        let config = ServerConfig::resolve(
            FileConfig::default(),
            &serve_args(&["--host", "127.0.0.1", "--port", "9000", "--workers", "2"]),
        )
        .unwrap();
        assert_eq!(config.bind_addr(), "127.0.0.1:9000");
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(ServerConfig::resolve(FileConfig::default(), &serve_args(&["--workers", "0"])).is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "app": {{ "port": 4000, "env": "development" }}, "session": {{ "store": "file", "dir": "/tmp/s" }} }}"#
        )
        .unwrap();

        let config = FileConfig::from_file(file.path()).unwrap();
        assert_eq!(config.app.port, 4000);
        assert_eq!(config.app.env.as_deref(), Some("development"));
        assert_eq!(config.session.store, Some(StoreKind::File));
        assert_eq!(config.session.dir, Some(PathBuf::from("/tmp/s")));
        assert_eq!(config.session.ttl_secs, 86400);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileConfig::load(&dir.path().join("missing.json")).unwrap();
        assert_eq!(config.app.port, 3000);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = FileConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, FleetError::Config(_)));
    }
}
