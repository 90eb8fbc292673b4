use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_OUTPUT_LINE_CAP: usize = 1000;
pub const DEFAULT_OPERATION_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_WARNING_THRESHOLD: usize = 2;

const DEFAULT_BLOCKED_COMMANDS: &str = "format,shutdown,reboot,poweroff,halt,mkfs,fdisk,dd,diskpart";

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub output_line_cap: usize,
    pub operation_ttl: Duration,
    pub sweep_interval: Duration,
    pub cancel_policy: CancelPolicy,
    pub warning: MultiInstanceWarningConfig,
    pub warning_state_file: Option<PathBuf>,
    pub package_manager: String,
    pub default_shell: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub blocked_commands: Vec<Regex>,
}

/// What happens when a `success`/`error` result arrives for an operation
/// that was already cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelPolicy {
    /// The `cancelled` status sticks; late results are dropped.
    #[default]
    CancelWins,
    /// The late result replaces `cancelled`.
    LastWriteWins,
}

impl FromStr for CancelPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cancel-wins" | "cancel_wins" => Ok(CancelPolicy::CancelWins),
            "last-write-wins" | "last_write_wins" => Ok(CancelPolicy::LastWriteWins),
            _ => Err(anyhow::anyhow!("Invalid cancel policy: {}", s)),
        }
    }
}

/// Process-wide multi-instance warning settings. Persisted by a
/// [`crate::guard::WarningConfigStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiInstanceWarningConfig {
    pub enabled: bool,
    pub threshold: usize,
    pub dismissed: bool,
}

impl Default for MultiInstanceWarningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_WARNING_THRESHOLD,
            dismissed: false,
        }
    }
}

fn expand_tilde(path_str: &str) -> Result<PathBuf> {
    shellexpand::full(path_str)
        .map(|p| PathBuf::from(p.into_owned()))
        .map_err(|e| anyhow::anyhow!("Failed to expand tilde for path '{}': {}", path_str, e))
}

fn compile_blocked_commands(list: &str) -> Result<Vec<Regex>> {
    list.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        // Match command if it's the first word, possibly preceded by env vars
        .map(|s| {
            Regex::new(&format!(
                r"^(?:[a-zA-Z_][a-zA-Z0-9_]*=[^ ]* )*{}(?:\s.*|$)",
                regex::escape(s)
            ))
            .context(format!("Invalid regex for blocked command: {}", s))
        })
        .collect()
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid {}: '{}' ({})", key, raw, e)),
        _ => Ok(default),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            output_line_cap: DEFAULT_OUTPUT_LINE_CAP,
            operation_ttl: DEFAULT_OPERATION_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            cancel_policy: CancelPolicy::default(),
            warning: MultiInstanceWarningConfig::default(),
            warning_state_file: None,
            package_manager: "scoop".to_string(),
            default_shell: None,
            working_dir: None,
            blocked_commands: compile_blocked_commands(DEFAULT_BLOCKED_COMMANDS)
                .unwrap_or_default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let output_line_cap: usize =
            parse_var(&lookup, "OPERATION_OUTPUT_LINE_CAP", DEFAULT_OUTPUT_LINE_CAP)?;
        if output_line_cap == 0 {
            anyhow::bail!("OPERATION_OUTPUT_LINE_CAP must be at least 1");
        }

        let operation_ttl = Duration::from_secs(parse_var(
            &lookup,
            "OPERATION_TTL_SECS",
            DEFAULT_OPERATION_TTL.as_secs(),
        )?);
        let sweep_interval = Duration::from_secs(parse_var(
            &lookup,
            "OPERATION_SWEEP_INTERVAL_SECS",
            DEFAULT_SWEEP_INTERVAL.as_secs(),
        )?);
        if sweep_interval.is_zero() {
            anyhow::bail!("OPERATION_SWEEP_INTERVAL_SECS must be at least 1");
        }

        let cancel_policy = match lookup("CANCEL_POLICY") {
            Some(raw) if !raw.trim().is_empty() => CancelPolicy::from_str(raw.trim())?,
            _ => CancelPolicy::default(),
        };

        let mut threshold: usize = parse_var(
            &lookup,
            "MULTI_INSTANCE_WARNING_THRESHOLD",
            DEFAULT_WARNING_THRESHOLD,
        )?;
        if threshold == 0 {
            warn!("MULTI_INSTANCE_WARNING_THRESHOLD of 0 is meaningless, using 1");
            threshold = 1;
        }
        let warning = MultiInstanceWarningConfig {
            enabled: parse_var(&lookup, "MULTI_INSTANCE_WARNING_ENABLED", true)?,
            threshold,
            dismissed: false,
        };
        let warning_state_file = lookup("MULTI_INSTANCE_WARNING_FILE")
            .filter(|s| !s.trim().is_empty())
            .map(|s| expand_tilde(s.trim()))
            .transpose()?;

        let package_manager = lookup("PACKAGE_MANAGER")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "scoop".to_string());
        let default_shell = lookup("DEFAULT_SHELL").filter(|s| !s.is_empty());

        let working_dir = match lookup("WORKING_DIR").filter(|s| !s.trim().is_empty()) {
            Some(raw) => {
                let dir = expand_tilde(raw.trim())?;
                if !dir.is_dir() {
                    anyhow::bail!("WORKING_DIR is not a valid directory: {:?}", dir);
                }
                Some(dir)
            }
            None => None,
        };

        let blocked_commands_str =
            lookup("BLOCKED_COMMANDS").unwrap_or_else(|| DEFAULT_BLOCKED_COMMANDS.to_string());
        let blocked_commands = compile_blocked_commands(&blocked_commands_str)?;

        Ok(Config {
            log_level,
            output_line_cap,
            operation_ttl,
            sweep_interval,
            cancel_policy,
            warning,
            warning_state_file,
            package_manager,
            default_shell,
            working_dir,
            blocked_commands,
        })
    }

    pub fn is_command_blocked(&self, command_str: &str) -> bool {
        let effective_command = command_str
            .split_whitespace()
            .skip_while(|s| s.contains('=')) // Skip leading VAR=val assignments
            .collect::<Vec<_>>()
            .join(" ");

        self.blocked_commands
            .iter()
            .any(|regex| regex.is_match(&effective_command))
    }
}
