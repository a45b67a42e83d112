/*
 * depforge - Koji builds with automatic dependency resolution.
 * Copyright (C) 2025  depforge contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Configuration management with validation and defaults.
//!
//! Precedence, lowest to highest: built-in defaults, `/etc/koji.conf` and
//! `~/.koji/config` (connection settings only), `/etc/depforge/config.toml`,
//! `~/.config/depforge/config.toml`, `DEPFORGE_*` environment variables,
//! command-line flags.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_KOJI_SERVER: &str = "https://koji.fedoraproject.org/kojihub";
pub const DEFAULT_KOJI_WEB_URL: &str = "https://koji.fedoraproject.org/koji";

/// Main configuration structure for depforge
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Koji connection settings
    pub koji: KojiConfig,

    /// Build orchestration settings
    pub build: BuildConfig,

    /// Name resolution settings
    pub resolver: ResolverConfig,

    /// SRPM fetching settings
    pub fetch: FetchConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            koji: KojiConfig::default(),
            build: BuildConfig::default(),
            resolver: ResolverConfig::default(),
            fetch: FetchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Koji connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KojiConfig {
    /// Koji hub URL
    pub server: String,

    /// Koji web interface URL
    pub web_url: String,

    /// Default build target
    pub target: String,

    /// Tag whose membership defines "already available"
    pub build_tag: String,

    /// Client certificate for authentication
    pub cert: Option<PathBuf>,

    /// CA certificate for server verification
    pub serverca: Option<PathBuf>,

    /// Disable SSL certificate verification (insecure)
    pub no_ssl_verify: bool,
}

impl Default for KojiConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_KOJI_SERVER.to_string(),
            web_url: DEFAULT_KOJI_WEB_URL.to_string(),
            target: "fedora-target".to_string(),
            build_tag: "fedora-build".to_string(),
            cert: None,
            serverca: None,
            no_ssl_verify: false,
        }
    }
}

/// Build orchestration settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Submit scratch (untagged) builds
    pub scratch: bool,

    /// Submit and return without polling
    pub no_wait: bool,

    /// Upper bound on concurrent submissions within one level
    pub max_parallel_per_level: usize,

    /// Maximum time to wait for repo regeneration
    pub repo_timeout_secs: u64,

    /// Maximum time to wait for a single build task
    pub task_timeout_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            scratch: false,
            no_wait: false,
            max_parallel_per_level: 4,
            repo_timeout_secs: 1800,
            task_timeout_secs: 3600,
        }
    }
}

/// Name resolution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NameResolutionMode {
    /// Pass dependency tokens through untouched
    Off,
    /// Macro expansion and virtual-provide rewriting only
    RulesOnly,
    /// Rules first, similarity-model fallback second
    RulesMl,
}

/// Name resolution settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// How dependency tokens are canonicalized
    pub name_resolution: NameResolutionMode,

    /// Override path to the similarity model artifact
    pub ml_model_path: Option<PathBuf>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            name_resolution: NameResolutionMode::RulesMl,
            ml_model_path: None,
        }
    }
}

/// One upstream SRPM source
#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub id: String,
    pub base_url: String,
    pub priority: u32,
}

/// SRPM fetching settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// SRPM cache directory (default: $TMPDIR/depforge)
    pub download_dir: Option<PathBuf>,

    /// Release tag used by the dist-git fallback source
    pub fedora_release: String,

    /// Extra SRPM sources, tried by ascending priority
    pub sources: Vec<SourceEntry>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            download_dir: None,
            fedora_release: "rawhide".to_string(),
            sources: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (empty = no file logging)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from all sources in precedence order
    pub fn load() -> Self {
        let mut config = Config::default();

        // Koji's own config files supply connection defaults
        config.apply_koji_ini();

        let system_config = Path::new("/etc/depforge/config.toml");
        if system_config.exists() {
            if let Ok(content) = fs::read_to_string(system_config) {
                if let Ok(parsed) = toml::from_str::<Config>(&content) {
                    config = config.merge(parsed);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("depforge").join("config.toml");
            if user_config.exists() {
                if let Ok(content) = fs::read_to_string(&user_config) {
                    if let Ok(parsed) = toml::from_str::<Config>(&content) {
                        config = config.merge(parsed);
                    }
                }
            }
        }

        config.apply_env_overrides()
    }

    /// Pull server/cert defaults out of /etc/koji.conf and ~/.koji/config
    fn apply_koji_ini(&mut self) {
        let mut paths = vec![PathBuf::from("/etc/koji.conf")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".koji").join("config"));
        }

        for path in paths {
            if !path.exists() {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            for (key, value) in parse_ini_section(&content, "koji") {
                match key.as_str() {
                    "server" if self.koji.server == DEFAULT_KOJI_SERVER => {
                        self.koji.server = value;
                    }
                    "weburl" if self.koji.web_url == DEFAULT_KOJI_WEB_URL => {
                        self.koji.web_url = value;
                    }
                    "cert" if self.koji.cert.is_none() => {
                        self.koji.cert = Some(expand_tilde(&value));
                    }
                    "serverca" if self.koji.serverca.is_none() => {
                        self.koji.serverca = Some(expand_tilde(&value));
                    }
                    _ => {}
                }
            }
        }
    }

    /// Merge another config into this one (other takes precedence for non-default values)
    fn merge(mut self, other: Config) -> Self {
        let default = Config::default();

        if other.koji.server != default.koji.server {
            self.koji.server = other.koji.server;
        }
        if other.koji.web_url != default.koji.web_url {
            self.koji.web_url = other.koji.web_url;
        }
        if other.koji.target != default.koji.target {
            self.koji.target = other.koji.target;
        }
        if other.koji.build_tag != default.koji.build_tag {
            self.koji.build_tag = other.koji.build_tag;
        }
        if other.koji.cert.is_some() {
            self.koji.cert = other.koji.cert;
        }
        if other.koji.serverca.is_some() {
            self.koji.serverca = other.koji.serverca;
        }
        if other.koji.no_ssl_verify != default.koji.no_ssl_verify {
            self.koji.no_ssl_verify = other.koji.no_ssl_verify;
        }

        if other.build.scratch != default.build.scratch {
            self.build.scratch = other.build.scratch;
        }
        if other.build.no_wait != default.build.no_wait {
            self.build.no_wait = other.build.no_wait;
        }
        if other.build.max_parallel_per_level != default.build.max_parallel_per_level {
            self.build.max_parallel_per_level = other.build.max_parallel_per_level;
        }
        if other.build.repo_timeout_secs != default.build.repo_timeout_secs {
            self.build.repo_timeout_secs = other.build.repo_timeout_secs;
        }
        if other.build.task_timeout_secs != default.build.task_timeout_secs {
            self.build.task_timeout_secs = other.build.task_timeout_secs;
        }

        if other.resolver.name_resolution != default.resolver.name_resolution {
            self.resolver.name_resolution = other.resolver.name_resolution;
        }
        if other.resolver.ml_model_path.is_some() {
            self.resolver.ml_model_path = other.resolver.ml_model_path;
        }

        if other.fetch.download_dir.is_some() {
            self.fetch.download_dir = other.fetch.download_dir;
        }
        if other.fetch.fedora_release != default.fetch.fedora_release {
            self.fetch.fedora_release = other.fetch.fedora_release;
        }
        if !other.fetch.sources.is_empty() {
            self.fetch.sources = other.fetch.sources;
        }

        if other.logging.level != default.logging.level {
            self.logging.level = other.logging.level;
        }
        if other.logging.file.is_some() {
            self.logging.file = other.logging.file;
        }

        self
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("DEPFORGE_SERVER") {
            self.koji.server = val;
        }

        if let Ok(val) = std::env::var("DEPFORGE_BUILD_TAG") {
            self.koji.build_tag = val;
        }

        if let Ok(val) = std::env::var("DEPFORGE_MAX_PARALLEL") {
            if let Ok(n) = val.parse() {
                self.build.max_parallel_per_level = n;
            }
        }

        if let Ok(val) = std::env::var("DEPFORGE_NO_SSL_VERIFY") {
            self.koji.no_ssl_verify = val == "1" || val.to_lowercase() == "true";
        }

        if let Ok(val) = std::env::var("DEPFORGE_LOG_LEVEL") {
            self.logging.level = val;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.build.max_parallel_per_level == 0 {
            return Err("max_parallel_per_level must be at least 1".to_string());
        }
        if self.build.max_parallel_per_level > 32 {
            return Err("max_parallel_per_level must be at most 32".to_string());
        }
        if self.build.repo_timeout_secs == 0 {
            return Err("repo_timeout_secs must be positive".to_string());
        }
        if self.koji.server.is_empty() {
            return Err("koji server URL must not be empty".to_string());
        }
        Ok(())
    }
}

/// Parse key=value pairs from one section of an INI file
fn parse_ini_section(content: &str, section: &str) -> Vec<(String, String)> {
    let mut in_section = false;
    let mut pairs = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            in_section = line[1..line.len() - 1].trim() == section;
            continue;
        }
        if in_section {
            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim();
                if !value.is_empty() {
                    pairs.push((key.trim().to_string(), value.to_string()));
                }
            }
        }
    }

    pairs
}

/// Expand a leading ~ to the user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
