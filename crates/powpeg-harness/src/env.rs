//! Environment-driven settings shared by every runner and poller.

use powpeg_harness_core::HarnessError;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const BITCOIND_BIN_PATH: &str = "BITCOIND_BIN_PATH";
pub const JAVA_BIN_PATH: &str = "JAVA_BIN_PATH";
pub const POWPEG_NODE_JAR_PATH: &str = "POWPEG_NODE_JAR_PATH";
pub const LOG_HOME: &str = "LOG_HOME";
pub const EXEC_ENV: &str = "EXEC_ENV";
pub const WAIT_FOR_BLOCK_ATTEMPT_TIME_MILLIS: &str = "WAIT_FOR_BLOCK_ATTEMPT_TIME_MILLIS";
pub const WAIT_FOR_BLOCK_MAX_ATTEMPTS: &str = "WAIT_FOR_BLOCK_MAX_ATTEMPTS";

const DEFAULT_ATTEMPT_TIME_MILLIS: u64 = 200;
const DEFAULT_MAX_ATTEMPTS: u32 = 160;

/// Host flavour the harness runs on. Decides how protocol-2 HSM simulators
/// are launched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecEnv {
    #[default]
    Ubuntu,
    MacOs,
}

impl FromStr for ExecEnv {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UBUNTU" => Ok(ExecEnv::Ubuntu),
            "MACOS" => Ok(ExecEnv::MacOs),
            other => Err(HarnessError::InvalidArgument(format!(
                "{EXEC_ENV} must be UBUNTU or MACOS, got {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ExecEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecEnv::Ubuntu => f.write_str("UBUNTU"),
            ExecEnv::MacOs => f.write_str("MACOS"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessEnv {
    pub bitcoind_bin_path: Option<PathBuf>,
    pub java_bin_path: Option<PathBuf>,
    pub powpeg_node_jar_path: Option<PathBuf>,
    pub log_home: Option<PathBuf>,
    pub exec_env: ExecEnv,
    pub wait_for_block_attempt_time: Duration,
    pub wait_for_block_max_attempts: u32,
}

impl Default for HarnessEnv {
    fn default() -> Self {
        Self {
            bitcoind_bin_path: None,
            java_bin_path: None,
            powpeg_node_jar_path: None,
            log_home: None,
            exec_env: ExecEnv::default(),
            wait_for_block_attempt_time: Duration::from_millis(DEFAULT_ATTEMPT_TIME_MILLIS),
            wait_for_block_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl HarnessEnv {
    pub fn from_env() -> Result<Self, HarnessError> {
        Self::from_vars(std::env::vars())
    }

    /// Builds the settings from `(name, value)` pairs. Empty values count as
    /// unset.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, HarnessError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        let path = |name: &str| vars.get(name).map(PathBuf::from);

        let exec_env = match vars.get(EXEC_ENV) {
            Some(value) => value.parse()?,
            None => ExecEnv::default(),
        };
        let attempt_time = parse_number(&vars, WAIT_FOR_BLOCK_ATTEMPT_TIME_MILLIS)?
            .unwrap_or(DEFAULT_ATTEMPT_TIME_MILLIS);
        let max_attempts =
            parse_number(&vars, WAIT_FOR_BLOCK_MAX_ATTEMPTS)?.unwrap_or(DEFAULT_MAX_ATTEMPTS);

        Ok(Self {
            bitcoind_bin_path: path(BITCOIND_BIN_PATH),
            java_bin_path: path(JAVA_BIN_PATH),
            powpeg_node_jar_path: path(POWPEG_NODE_JAR_PATH),
            log_home: path(LOG_HOME),
            exec_env,
            wait_for_block_attempt_time: Duration::from_millis(attempt_time),
            wait_for_block_max_attempts: max_attempts,
        })
    }
}

fn parse_number<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
) -> Result<Option<T>, HarnessError> {
    vars.get(name)
        .map(|value| {
            value.trim().parse::<T>().map_err(|_| {
                HarnessError::InvalidArgument(format!("{name} must be a number, got {value:?}"))
            })
        })
        .transpose()
}

/// Reads a path-valued variable straight from the process environment
pub(crate) fn path_from_env(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_unset() {
        let env = HarnessEnv::from_vars(Vec::<(String, String)>::new()).unwrap();
        assert_eq!(env, HarnessEnv::default());
        assert_eq!(env.wait_for_block_attempt_time, Duration::from_millis(200));
        assert_eq!(env.wait_for_block_max_attempts, 160);
        assert_eq!(env.exec_env, ExecEnv::Ubuntu);
    }

    #[test]
    fn test_reads_all_variables() {
        let env = HarnessEnv::from_vars([
            (BITCOIND_BIN_PATH, "/opt/bitcoin/bin/bitcoind"),
            (JAVA_BIN_PATH, "/usr/bin/java"),
            (POWPEG_NODE_JAR_PATH, "/opt/powpeg/federate-node.jar"),
            (LOG_HOME, "/tmp/logs"),
            (EXEC_ENV, "macos"),
            (WAIT_FOR_BLOCK_ATTEMPT_TIME_MILLIS, "50"),
            (WAIT_FOR_BLOCK_MAX_ATTEMPTS, "7"),
        ])
        .unwrap();

        assert_eq!(
            env.bitcoind_bin_path.as_deref(),
            Some(std::path::Path::new("/opt/bitcoin/bin/bitcoind"))
        );
        assert_eq!(env.log_home, Some(PathBuf::from("/tmp/logs")));
        assert_eq!(env.exec_env, ExecEnv::MacOs);
        assert_eq!(env.wait_for_block_attempt_time, Duration::from_millis(50));
        assert_eq!(env.wait_for_block_max_attempts, 7);
    }

    #[test]
    fn test_empty_value_counts_as_unset() {
        let env = HarnessEnv::from_vars([(JAVA_BIN_PATH, ""), (EXEC_ENV, " ")]).unwrap();
        assert!(env.java_bin_path.is_none());
        assert_eq!(env.exec_env, ExecEnv::Ubuntu);
    }

    #[test]
    fn test_rejects_unknown_exec_env() {
        let err = HarnessEnv::from_vars([(EXEC_ENV, "WINDOWS")]).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidArgument(_)));
    }

    #[test]
    fn test_rejects_non_numeric_wait_settings() {
        let err =
            HarnessEnv::from_vars([(WAIT_FOR_BLOCK_MAX_ATTEMPTS, "forever")]).unwrap_err();
        assert!(err.to_string().contains(WAIT_FOR_BLOCK_MAX_ATTEMPTS));
    }
}
