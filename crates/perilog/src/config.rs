use regex::Regex;
use serde_json::Value;

use canopy_core::{Error, fsd};

const DEFAULT_PROLOG_TIMEOUT: &str = "30m";
const DEFAULT_EPILOG_TIMEOUT: &str = "0";
const DEFAULT_KILL_TIMEOUT: f64 = 5.0;

/// One phase (prolog or epilog) of the configuration.
#[derive(Debug, Clone)]
pub struct PhaseConfig {
    pub command: Vec<String>,
    /// Seconds before the phase is terminated; 0 disables the timeout.
    pub timeout: f64,
    /// Launch on every rank of the allocation instead of rank 0 only.
    pub per_rank: bool,
}

#[derive(Debug)]
pub struct PerilogConfig {
    pub prolog: Option<PhaseConfig>,
    pub epilog: Option<PhaseConfig>,
    /// Grace period between SIGTERM and SIGKILL for a canceled or
    /// timed-out prolog.
    pub prolog_kill_timeout: f64,
    /// Captured output lines matching any of these are not logged.
    pub log_ignore: Vec<Regex>,
}

impl Default for PerilogConfig {
    fn default() -> Self {
        Self {
            prolog: None,
            epilog: None,
            prolog_kill_timeout: DEFAULT_KILL_TIMEOUT,
            log_ignore: vec![empty_line_pattern()],
        }
    }
}

fn empty_line_pattern() -> Regex {
    // cannot fail to compile
    Regex::new(r"^\s*$").unwrap()
}

fn parse_command(table: &Value, phase: &str) -> Result<Vec<String>, Error> {
    let command = table
        .get("command")
        .ok_or_else(|| Error::invalid(format!("[job-manager.{phase}] command is required")))?;
    let args = command
        .as_array()
        .filter(|args| !args.is_empty())
        .ok_or_else(|| Error::invalid(format!("[job-manager.{phase}] command malformed")))?;
    args.iter()
        .map(|arg| {
            arg.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::invalid(format!("[job-manager.{phase}] command malformed")))
        })
        .collect()
}

fn parse_phase(
    table: &Value,
    phase: &str,
    default_timeout: &str,
    extra_keys: &[&str],
) -> Result<PhaseConfig, Error> {
    if let Some(obj) = table.as_object() {
        for key in obj.keys() {
            if !["command", "timeout", "per-rank"].contains(&key.as_str())
                && !extra_keys.contains(&key.as_str())
            {
                return Err(Error::invalid(format!(
                    "[job-manager.{phase}] unknown key '{key}'"
                )));
            }
        }
    } else {
        return Err(Error::invalid(format!("[job-manager.{phase}] must be a table")));
    }
    let command = parse_command(table, phase)?;
    let timeout = match table.get("timeout") {
        Some(Value::String(s)) => fsd::parse_duration(s)
            .map_err(|_| Error::invalid(format!("[job-manager.{phase}] invalid timeout {s}")))?,
        Some(_) => {
            return Err(Error::invalid(format!(
                "[job-manager.{phase}] timeout must be a duration string"
            )));
        }
        None => fsd::parse_duration(default_timeout).unwrap_or(0.0),
    };
    let per_rank = match table.get("per-rank") {
        Some(Value::Bool(b)) => *b,
        Some(_) => {
            return Err(Error::invalid(format!(
                "[job-manager.{phase}] per-rank must be a boolean"
            )));
        }
        None => false,
    };
    Ok(PhaseConfig {
        command,
        timeout,
        per_rank,
    })
}

impl PerilogConfig {
    /// Parse the `[job-manager.prolog]`, `[job-manager.epilog]`, and
    /// `[job-manager.perilog]` tables of the broker configuration.
    pub fn from_value(conf: &Value) -> Result<Self, Error> {
        let mut config = PerilogConfig::default();
        let Some(jm) = conf.get("job-manager") else {
            return Ok(config);
        };

        if let Some(table) = jm.get("prolog") {
            config.prolog = Some(parse_phase(
                table,
                "prolog",
                DEFAULT_PROLOG_TIMEOUT,
                &["kill-timeout"],
            )?);
            if let Some(kt) = table.get("kill-timeout") {
                config.prolog_kill_timeout = kt.as_f64().filter(|v| *v > 0.0).ok_or_else(|| {
                    Error::invalid("[job-manager.prolog] kill-timeout must be positive")
                })?;
            }
        }
        if let Some(table) = jm.get("epilog") {
            config.epilog = Some(parse_phase(table, "epilog", DEFAULT_EPILOG_TIMEOUT, &[])?);
        }
        if let Some(patterns) = jm.pointer("/perilog/log-ignore") {
            let patterns = patterns
                .as_array()
                .ok_or_else(|| Error::invalid("[job-manager.perilog] log-ignore must be an array"))?;
            for pattern in patterns {
                let pattern = pattern.as_str().ok_or_else(|| {
                    Error::invalid("[job-manager.perilog] log-ignore entries must be strings")
                })?;
                let re = Regex::new(pattern).map_err(|_| {
                    Error::invalid(format!("failed to compile regex: {pattern}"))
                })?;
                config.log_ignore.push(re);
            }
        }
        Ok(config)
    }

    pub fn log_ignored(&self, line: &str) -> bool {
        self.log_ignore.iter().any(|re| re.is_match(line))
    }
}
