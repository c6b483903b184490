// SPDX-License-Identifier: MIT

//! Runtime configuration
//!
//! Loaded from an optional YAML file, then overridden from the environment:
//!
//! ```yaml
//! checkpoint_dir: .stepwise/checkpoints
//! command_timeout_ms: 900000
//! max_build_attempts: 4
//! platforms:
//!   web:
//!     build: { executable: npm, args: [run, build] }
//!     recovery:
//!       - name: missing-deps
//!         pattern: "Cannot find module"
//!         fix: { executable: npm, args: [install] }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::runtime::command::{Command, ExecOptions};
use crate::runtime::error::ConfigError;
use crate::runtime::progress::{
    build_progress_parser, PatternProgressParser, ProgressPattern, ProgressPatternDef,
};
use crate::stepwise::workflow::recovery::{RecoveryRule, RecoveryRuleDef};

pub const ENV_CHECKPOINT_DIR: &str = "STEPWISE_CHECKPOINT_DIR";
pub const ENV_COMMAND_TIMEOUT_MS: &str = "STEPWISE_COMMAND_TIMEOUT_MS";
pub const ENV_PROGRESS_DEBOUNCE_MS: &str = "STEPWISE_PROGRESS_DEBOUNCE_MS";
pub const ENV_MAX_BUILD_ATTEMPTS: &str = "STEPWISE_MAX_BUILD_ATTEMPTS";

/// Build and deploy commands for one target platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub build: Command,
    #[serde(default)]
    pub deploy: Option<Command>,
    #[serde(default)]
    pub recovery: Vec<RecoveryRuleDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepwiseConfig {
    pub checkpoint_dir: PathBuf,
    pub command_timeout_ms: u64,
    pub progress_debounce_ms: u64,
    pub term_grace_ms: u64,
    pub max_captured_bytes: usize,
    pub max_transitions: usize,
    pub max_build_attempts: u32,
    /// Replaces the built-in build progress patterns when non-empty
    pub progress_patterns: Vec<ProgressPatternDef>,
    pub platforms: BTreeMap<String, PlatformConfig>,
}

impl Default for StepwiseConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from(".stepwise/checkpoints"),
            command_timeout_ms: 10 * 60 * 1000,
            progress_debounce_ms: 1000,
            term_grace_ms: 2000,
            max_captured_bytes: 1024 * 1024,
            max_transitions: crate::stepwise::workflow::graph::DEFAULT_MAX_TRANSITIONS,
            max_build_attempts: 3,
            progress_patterns: Vec::new(),
            platforms: default_platforms(),
        }
    }
}

fn default_platforms() -> BTreeMap<String, PlatformConfig> {
    let mut platforms = BTreeMap::new();
    platforms.insert(
        "iOS".to_string(),
        PlatformConfig {
            build: Command::new("xcodebuild").args([
                "-scheme",
                "App",
                "-destination",
                "generic/platform=iOS Simulator",
                "build",
            ]),
            deploy: Some(Command::new("fastlane").arg("beta")),
            recovery: vec![RecoveryRuleDef {
                name: "pods-out-of-sync".to_string(),
                pattern: r"(?i)(no such module|sandbox is not in sync with the podfile\.lock)"
                    .to_string(),
                fix: Some(Command::new("pod").arg("install")),
            }],
        },
    );
    platforms.insert(
        "Android".to_string(),
        PlatformConfig {
            build: Command::new("./gradlew").arg("assembleDebug"),
            deploy: Some(Command::new("./gradlew").arg("publish")),
            recovery: vec![RecoveryRuleDef {
                name: "stale-gradle-cache".to_string(),
                pattern: r"(?i)(could not resolve all (files|dependencies)|corrupted cache)"
                    .to_string(),
                fix: Some(Command::new("./gradlew").args(["clean", "--refresh-dependencies"])),
            }],
        },
    );
    platforms.insert(
        "Web".to_string(),
        PlatformConfig {
            build: Command::new("npm").args(["run", "build"]),
            deploy: Some(Command::new("npm").args(["run", "deploy"])),
            recovery: vec![RecoveryRuleDef {
                name: "missing-node-modules".to_string(),
                pattern: r"(?i)(cannot find module|module not found)".to_string(),
                fix: Some(Command::new("npm").arg("install")),
            }],
        },
    );
    platforms
}

impl StepwiseConfig {
    /// Read `path` if given (defaults otherwise), then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides_from(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        log::debug!(
            "Loaded config from {} ({} platform(s))",
            path.display(),
            config.platforms.len()
        );
        Ok(config)
    }

    /// Apply overrides using `lookup` to read variables
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_CHECKPOINT_DIR).filter(|d| !d.trim().is_empty()) {
            self.checkpoint_dir = PathBuf::from(dir);
        }
        if let Some(ms) = parse_var(&lookup, ENV_COMMAND_TIMEOUT_MS)? {
            self.command_timeout_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, ENV_PROGRESS_DEBOUNCE_MS)? {
            self.progress_debounce_ms = ms;
        }
        if let Some(n) = parse_var(&lookup, ENV_MAX_BUILD_ATTEMPTS)? {
            self.max_build_attempts = n;
        }
        Ok(())
    }

    /// Case-insensitive lookup returning the configured key
    pub fn platform(&self, name: &str) -> Option<(&str, &PlatformConfig)> {
        self.platforms
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name.trim()))
            .map(|(key, platform)| (key.as_str(), platform))
    }

    pub fn platform_names(&self) -> Vec<&str> {
        self.platforms.keys().map(String::as_str).collect()
    }

    /// Execution options without progress wiring; a zero timeout disables it
    pub fn exec_options(&self) -> ExecOptions {
        ExecOptions {
            timeout: (self.command_timeout_ms > 0)
                .then(|| Duration::from_millis(self.command_timeout_ms)),
            progress_debounce: Duration::from_millis(self.progress_debounce_ms),
            term_grace: Duration::from_millis(self.term_grace_ms),
            max_captured_bytes: self.max_captured_bytes,
            ..ExecOptions::default()
        }
    }

    pub fn progress_parser(&self) -> Result<Arc<PatternProgressParser>, ConfigError> {
        if self.progress_patterns.is_empty() {
            return Ok(Arc::new(build_progress_parser()));
        }
        let patterns = self
            .progress_patterns
            .iter()
            .map(|def| {
                ProgressPattern::try_from(def).map_err(|source| ConfigError::Pattern {
                    pattern: def.pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(PatternProgressParser::new(patterns)))
    }

    /// Every platform's recovery rules, each scoped to its platform
    pub fn recovery_rules(&self) -> Result<Vec<RecoveryRule>, ConfigError> {
        let mut rules = Vec::new();
        for (platform, config) in &self.platforms {
            for def in &config.recovery {
                let rule = RecoveryRule::try_from(def.clone()).map_err(|source| {
                    ConfigError::Pattern {
                        pattern: def.pattern.clone(),
                        source,
                    }
                })?;
                rules.push(rule.scoped_to(platform.as_str()));
            }
        }
        Ok(rules)
    }
}

fn parse_var<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnv {
            var: var.to_string(),
            value,
        })
}
