use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// How often a running attempt reports that it is still alive.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for running one job function as a subprocess.
///
/// Built once at startup and shared read-only by every job. Mutable
/// state such as the error backoff lives in [`crate::worker::JobRunner`].
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Gearman function name this worker registers
    pub function_name: String,
    /// Program run for every attempt
    pub command: String,
    /// Split the payload into shell-style arguments instead of passing it raw
    pub parse_args: bool,
    /// Per-attempt timeout. Zero disables the timeout.
    pub cmd_timeout: Duration,
    /// Extra attempts after the first failure
    pub retry_count: u32,
    /// Number of trailing stderr lines reported as a warning
    pub warning_lines: usize,
    /// Time between SIGTERM and SIGKILL when halting a subprocess
    pub sigterm_grace_period: Duration,
    /// Initial sleep once every job in the backoff window has failed.
    /// Zero disables backoff.
    pub error_backoff_rate: Duration,
    /// Number of recent jobs in the backoff window. Zero disables backoff.
    pub error_backoff_count: usize,
    /// Parent directory for per-attempt work directories.
    /// Falls back to the system temp directory.
    pub sandbox_root: Option<PathBuf>,
    pub heartbeat_interval: Duration,
    /// Exit the whole worker after a halted subprocess is stopped, or when a
    /// stopped subprocess ends up in an indeterminate state.
    pub exit_on_stop: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            function_name: String::new(),
            command: String::new(),
            parse_args: true,
            cmd_timeout: Duration::ZERO,
            retry_count: 0,
            warning_lines: 5,
            sigterm_grace_period: Duration::from_secs(20),
            error_backoff_rate: Duration::from_secs(5),
            error_backoff_count: 5,
            sandbox_root: None,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            exit_on_stop: false,
        }
    }
}

impl ExecutionConfig {
    pub fn new(function_name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn sandbox_dir(&self) -> PathBuf {
        match &self.sandbox_root {
            Some(root) if !root.as_os_str().is_empty() => root.clone(),
            _ => std::env::temp_dir(),
        }
    }

    pub fn has_timeout(&self) -> bool {
        !self.cmd_timeout.is_zero()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.function_name.is_empty() {
            return Err(ConfigError::MissingFunctionName);
        }
        if self.command.is_empty() {
            return Err(ConfigError::MissingCommand);
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeatInterval);
        }
        Ok(())
    }
}

/// Exponential backoff applied when the broker connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Retries after the first failed reconnect
    pub attempts: u32,
    /// Delay before the first retry, doubled for each one after
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: Option<u16>,
    pub reconnect: ReconnectPolicy,
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::MissingBrokerAddress("host", "HOST"));
        }
        if self.port.is_none() {
            return Err(ConfigError::MissingBrokerAddress("port", "PORT"));
        }
        Ok(())
    }

    /// host:port, as accepted by `TcpStream::connect`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_config_default() {
        let cfg = ExecutionConfig::default();
        assert!(cfg.parse_args);
        assert_eq!(cfg.cmd_timeout, Duration::ZERO);
        assert!(!cfg.has_timeout());
        assert_eq!(cfg.retry_count, 0);
        assert_eq!(cfg.warning_lines, 5);
        assert_eq!(cfg.sigterm_grace_period, Duration::from_secs(20));
        assert_eq!(cfg.error_backoff_rate, Duration::from_secs(5));
        assert_eq!(cfg.error_backoff_count, 5);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(60));
        assert!(!cfg.exit_on_stop);
    }

    #[test]
    fn execution_config_new() {
        let cfg = ExecutionConfig::new("resize", "/usr/bin/resize");
        assert_eq!(cfg.function_name, "resize");
        assert_eq!(cfg.command, "/usr/bin/resize");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn execution_config_requires_name_and_command() {
        let cfg = ExecutionConfig::new("", "/bin/true");
        assert_eq!(cfg.validate(), Err(ConfigError::MissingFunctionName));

        let cfg = ExecutionConfig::new("name", "");
        assert_eq!(cfg.validate(), Err(ConfigError::MissingCommand));
    }

    #[test]
    fn execution_config_rejects_zero_heartbeat_interval() {
        let cfg = ExecutionConfig {
            heartbeat_interval: Duration::ZERO,
            ..ExecutionConfig::new("name", "/bin/true")
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroHeartbeatInterval));
    }

    #[test]
    fn sandbox_dir_falls_back_to_temp_dir() {
        let mut cfg = ExecutionConfig::default();
        assert_eq!(cfg.sandbox_dir(), std::env::temp_dir());

        cfg.sandbox_root = Some(PathBuf::new());
        assert_eq!(cfg.sandbox_dir(), std::env::temp_dir());

        cfg.sandbox_root = Some(PathBuf::from("/mnt/sandbox"));
        assert_eq!(cfg.sandbox_dir(), PathBuf::from("/mnt/sandbox"));
    }

    #[test]
    fn reconnect_policy_default() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(200));
    }

    #[test]
    fn broker_config_addr() {
        let cfg = BrokerConfig::new("gearmand.local", 4730);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.addr(), "gearmand.local:4730");
    }

    #[test]
    fn broker_config_requires_host_and_port() {
        let cfg = BrokerConfig::default();
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::MissingBrokerAddress("host", "HOST"))
        );

        let cfg = BrokerConfig {
            host: "localhost".to_string(),
            ..Default::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::MissingBrokerAddress("port", "PORT"))
        );
    }
}
