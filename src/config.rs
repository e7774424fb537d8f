//! Connection configuration.
//!
//! A `BridgeConfig` says where the client runs, which engine it serves and
//! where the engine library lives. It can be built in code or loaded from
//! JSON, by default from `~/.config/meshbridge/config.json` (XDG on Linux,
//! `~/Library/Application Support` on macOS).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Environment variable naming the engine library directory.
pub const LIBRARY_ENV: &str = "MESHBRIDGE_ENGINE_LIB";

/// Environment variable naming the engine installation root; the library
/// lives in its `bin` directory.
pub const ENGINE_ROOT_ENV: &str = "CUBIT_ROOT";

/// Environment variable naming the client program.
pub const CLIENT_ENV: &str = "MESHBRIDGE_CLIENT";

/// File name of the client binary.
pub const CLIENT_PROGRAM: &str = "meshbridge-client";

/// Where the client process runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// A child process on this machine.
    Local {
        #[serde(default)]
        program: Option<PathBuf>,
    },
    /// A child process on another machine, reached through `ssh`.
    Ssh {
        destination: String,
        #[serde(default = "default_remote_program")]
        program: String,
        #[serde(default)]
        library_dirs: Vec<String>,
        #[serde(default = "default_ssh_program")]
        ssh_program: String,
    },
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Local { program: None }
    }
}

fn default_remote_program() -> String {
    CLIENT_PROGRAM.to_string()
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

fn default_engine() -> String {
    "sandbox".to_string()
}

/// Engine arguments used when none are configured.
pub fn default_engine_args() -> Vec<String> {
    ["-information", "Off", "-nojournal", "-noecho"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Everything `Connection::open` needs to start a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    /// Engine library directory; resolved from the environment when unset.
    #[serde(default)]
    pub library_path: Option<PathBuf>,
    /// Arguments passed to the engine after the program name.
    #[serde(default)]
    pub engine_args: Option<Vec<String>>,
    /// User-supplied diagnostic log. Disables the log bridge.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Engine binding the client serves (`sandbox` or `python`).
    #[serde(default = "default_engine")]
    pub engine: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            library_path: None,
            engine_args: None,
            log_path: None,
            engine: default_engine(),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            BridgeError::Configuration(format!("Invalid config {}: {}", path.display(), e))
        })
    }

    /// Load the default configuration file, or fall back to defaults when
    /// there is none.
    pub fn from_default_location() -> Result<Self> {
        match default_config_path() {
            Some(path) if path.exists() => {
                tracing::info!("Using config from {}", path.display());
                Self::load(path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_path = Some(path.into());
        self
    }

    pub fn with_engine_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.engine_args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    /// Engine arguments, or the quiet defaults.
    pub fn engine_args(&self) -> Vec<String> {
        self.engine_args.clone().unwrap_or_else(default_engine_args)
    }

    /// Resolve the engine library directory from the config and environment.
    pub fn resolve_library_path(&self) -> Result<PathBuf> {
        self.resolve_library_path_with(|key| std::env::var(key).ok())
    }

    fn resolve_library_path_with(&self, env: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
        // 1. Explicit configuration
        if let Some(path) = &self.library_path {
            return Ok(path.clone());
        }

        // 2. Dedicated environment variable
        if let Some(path) = env(LIBRARY_ENV).filter(|p| !p.is_empty()) {
            tracing::info!("Using engine library from {}: {}", LIBRARY_ENV, path);
            return Ok(PathBuf::from(path));
        }

        // 3. Installation root convention
        if let Some(root) = env(ENGINE_ROOT_ENV).filter(|p| !p.is_empty()) {
            let path = PathBuf::from(root).join("bin");
            tracing::info!("Using engine library from {}: {}", ENGINE_ROOT_ENV, path.display());
            return Ok(path);
        }

        Err(BridgeError::Configuration(format!(
            "Engine library path not set; configure library_path or set {} or {}",
            LIBRARY_ENV, ENGINE_ROOT_ENV
        )))
    }

    /// Resolve the local client program.
    pub fn resolve_client_program(&self) -> Result<PathBuf> {
        let configured = match &self.transport {
            TransportConfig::Local { program } => program.clone(),
            _ => None,
        };
        resolve_client_program_with(configured, |key| std::env::var(key).ok())
    }
}

fn resolve_client_program_with(
    configured: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<PathBuf> {
    if let Some(program) = configured {
        return Ok(program);
    }

    if let Some(program) = env(CLIENT_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(program));
    }

    // Installed side by side with the host binary.
    let exe = std::env::current_exe()?;
    let sibling = exe
        .parent()
        .map(|dir| dir.join(format!("{}{}", CLIENT_PROGRAM, std::env::consts::EXE_SUFFIX)));
    match sibling {
        Some(path) if path.exists() => Ok(path),
        _ => Err(BridgeError::Configuration(format!(
            "Cannot find {}; set {} or configure transport.program",
            CLIENT_PROGRAM, CLIENT_ENV
        ))),
    }
}

/// Default configuration file location.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("meshbridge").join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_explicit_library_path_wins() {
        let config = BridgeConfig::new().with_library_path("/opt/engine/bin");
        let env = env_from(&[(LIBRARY_ENV, "/elsewhere")]);
        assert_eq!(
            config.resolve_library_path_with(env).unwrap(),
            PathBuf::from("/opt/engine/bin")
        );
    }

    #[test]
    fn test_library_path_from_environment() {
        let config = BridgeConfig::new();
        assert_eq!(
            config
                .resolve_library_path_with(env_from(&[(LIBRARY_ENV, "/lib/engine")]))
                .unwrap(),
            PathBuf::from("/lib/engine")
        );
        assert_eq!(
            config
                .resolve_library_path_with(env_from(&[(ENGINE_ROOT_ENV, "/opt/cubit")]))
                .unwrap(),
            PathBuf::from("/opt/cubit/bin")
        );
    }

    #[test]
    fn test_unresolvable_library_path_is_configuration_error() {
        let err = BridgeConfig::new()
            .resolve_library_path_with(env_from(&[(LIBRARY_ENV, "")]))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Configuration(_)));
    }

    #[test]
    fn test_client_program_from_environment() {
        let program =
            resolve_client_program_with(None, env_from(&[(CLIENT_ENV, "/usr/bin/mbc")])).unwrap();
        assert_eq!(program, PathBuf::from("/usr/bin/mbc"));

        let program = resolve_client_program_with(
            Some(PathBuf::from("/custom/client")),
            env_from(&[(CLIENT_ENV, "/usr/bin/mbc")]),
        )
        .unwrap();
        assert_eq!(program, PathBuf::from("/custom/client"));
    }

    #[test]
    fn test_default_engine_args() {
        let config = BridgeConfig::new();
        assert_eq!(
            config.engine_args(),
            vec!["-information", "Off", "-nojournal", "-noecho"]
        );
        let config = config.with_engine_args(["-batch"]);
        assert_eq!(config.engine_args(), vec!["-batch"]);
    }

    #[test]
    fn test_load_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "transport": {"kind": "ssh", "destination": "mesher@cluster", "library_dirs": ["/opt/cubit/bin"]},
                "library_path": "/opt/cubit/bin",
                "engine": "python"
            }"#,
        )
        .unwrap();

        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(
            config.transport,
            TransportConfig::Ssh {
                destination: "mesher@cluster".to_string(),
                program: "meshbridge-client".to_string(),
                library_dirs: vec!["/opt/cubit/bin".to_string()],
                ssh_program: "ssh".to_string(),
            }
        );
        assert_eq!(config.engine, "python");
        assert_eq!(config.engine_args, None);
    }

    #[test]
    fn test_load_rejects_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            BridgeConfig::load(&path),
            Err(BridgeError::Configuration(_))
        ));
        assert!(matches!(
            BridgeConfig::load(dir.path().join("missing.json")),
            Err(BridgeError::Configuration(_))
        ));
    }
}
