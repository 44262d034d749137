use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Placeholder every path template must contain.
const REF_PLACEHOLDER: &str = "{ref}";

const SUPPORTED_BACKENDS: &[&str] = &["sqlite", "file", "memory"];

// ── Top-level config ──────────────────────────────────────────────

/// Top-level streamkeep configuration, loaded from `config.toml`.
///
/// Resolution order: `STREAMKEEP_CONFIG_DIR` env → `~/.streamkeep/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Path to config.toml - computed, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,
}

// ── Server ───────────────────────────────────────────────────────

/// Server that issues stream references and serves the streams.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ServerConfig {
    /// Base URL, e.g. `https://app.example.com`
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token sent with every request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Stream path template; `{ref}` is replaced by the stream reference
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
    /// `sources_ref` follow-up path template
    #[serde(default = "default_sources_path")]
    pub sources_path: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".into()
}

fn default_stream_path() -> String {
    "/api/streams/{ref}".into()
}

fn default_sources_path() -> String {
    "/api/sources/{ref}".into()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            stream_path: default_stream_path(),
            sources_path: default_sources_path(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct EngineConfig {
    /// Fail a stream that sends nothing for this many seconds (0 = never)
    #[serde(default)]
    pub idle_timeout_secs: u64,
}

// ── Persistence ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PersistenceConfig {
    /// "sqlite" | "file" | "memory"
    #[serde(default = "default_backend")]
    pub backend: String,
    /// State directory; relative paths are resolved against the config dir
    #[serde(default = "default_state_path")]
    pub path: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Per-tab (per-process) key under the namespace
    #[serde(default = "default_tab")]
    pub tab: String,
    /// Discard persisted sessions older than this on restore (0 = keep all)
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

fn default_backend() -> String {
    "sqlite".into()
}

fn default_state_path() -> String {
    "state".into()
}

fn default_namespace() -> String {
    "streamkeep.sessions.v1".into()
}

fn default_tab() -> String {
    "default".into()
}

fn default_max_age_secs() -> u64 {
    86_400
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_state_path(),
            namespace: default_namespace(),
            tab: default_tab(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

// ── Config impl ──────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());

        Self {
            config_path: home.join(".streamkeep").join("config.toml"),
            server: ServerConfig::default(),
            engine: EngineConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".streamkeep"))
}

fn resolve_config_dir() -> Result<PathBuf> {
    match std::env::var("STREAMKEEP_CONFIG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            Ok(PathBuf::from(shellexpand::tilde(dir.trim()).into_owned()))
        }
        _ => default_config_dir(),
    }
}

impl Config {
    pub async fn load_or_init() -> Result<Self> {
        let dir = resolve_config_dir()?;
        Self::load_or_init_in(&dir).await
    }

    /// Load `dir/config.toml`, writing a default file first if none exists.
    pub async fn load_or_init_in(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.toml");

        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        if config_path.exists() {
            // Warn if config file is world-readable (may contain an API key)
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = fs::metadata(&config_path).await {
                    if meta.permissions().mode() & 0o004 != 0 {
                        tracing::warn!(
                            "Config file {:?} is world-readable (mode {:o}). \
                             Consider restricting with: chmod 600 {:?}",
                            config_path,
                            meta.permissions().mode() & 0o777,
                            config_path,
                        );
                    }
                }
            }

            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path;
            config.apply_env_overrides();
            config.validate()?;
            tracing::info!(
                path = %config.config_path.display(),
                initialized = false,
                "Config loaded"
            );
            Ok(config)
        } else {
            let mut config = Config {
                config_path: config_path.clone(),
                ..Config::default()
            };
            config.save().await?;

            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                let _ = fs::set_permissions(&config_path, Permissions::from_mode(0o600)).await;
            }

            config.apply_env_overrides();
            config.validate()?;
            tracing::info!(
                path = %config.config_path.display(),
                initialized = true,
                "Config loaded"
            );
            Ok(config)
        }
    }

    /// Directory holding config.toml.
    pub fn config_dir(&self) -> PathBuf {
        self.config_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    }

    /// Directory for persisted session snapshots.
    pub fn state_dir(&self) -> PathBuf {
        let expanded = PathBuf::from(shellexpand::tilde(&self.persistence.path).into_owned());
        if expanded.is_absolute() {
            expanded
        } else {
            self.config_dir().join(expanded)
        }
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        // Server
        if self.server.base_url.trim().is_empty() {
            anyhow::bail!("server.base_url must not be empty");
        }
        if !self.server.stream_path.contains(REF_PLACEHOLDER) {
            anyhow::bail!("server.stream_path must contain {REF_PLACEHOLDER}");
        }
        if !self.server.sources_path.contains(REF_PLACEHOLDER) {
            anyhow::bail!("server.sources_path must contain {REF_PLACEHOLDER}");
        }

        // Persistence
        if !SUPPORTED_BACKENDS.contains(&self.persistence.backend.as_str()) {
            anyhow::bail!(
                "persistence.backend '{}' is not supported; expected one of {}",
                self.persistence.backend,
                SUPPORTED_BACKENDS.join(", ")
            );
        }
        if self.persistence.namespace.trim().is_empty() {
            anyhow::bail!("persistence.namespace must not be empty");
        }
        if self.persistence.tab.trim().is_empty() {
            anyhow::bail!("persistence.tab must not be empty");
        }

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("STREAMKEEP_SERVER_URL") {
            if !url.is_empty() {
                self.server.base_url = url;
            }
        }

        if let Ok(key) = std::env::var("STREAMKEEP_API_KEY") {
            if !key.is_empty() {
                self.server.api_key = Some(key);
            }
        }

        if let Ok(tab) = std::env::var("STREAMKEEP_TAB") {
            if !tab.is_empty() {
                self.persistence.tab = tab;
            }
        }

        if let Ok(secs) = std::env::var("STREAMKEEP_IDLE_TIMEOUT_SECS") {
            if let Ok(secs) = secs.trim().parse::<u64>() {
                self.engine.idle_timeout_secs = secs;
            }
        }
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;

        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        Ok(())
    }
}
