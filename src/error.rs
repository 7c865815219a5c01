use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Why a single attempt of a job did not succeed.
#[derive(Error, Debug)]
pub enum AttemptError {
    #[error("Failed to parse args: {0}")]
    ArgParse(#[from] ArgsError),

    #[error("Failed to create work directory: {0}")]
    WorkDir(#[source] io::Error),

    #[error("Failed to start process: {0}")]
    Spawn(#[source] ProcessError),

    #[error("{}", describe_status(.0))]
    Exit(ExitStatus),

    #[error("Failed to wait for process: {0}")]
    Wait(#[source] io::Error),

    #[error("process timed out after {}", humantime::format_duration(*.0))]
    TimedOut(Duration),

    #[error("killed process due to halt")]
    Halted,

    #[error("error stopping process: {0}")]
    Stop(#[from] ProcessError),

    #[error("Failed to stream process output: {0}")]
    Output(#[source] io::Error),

    #[error("Attempt panicked: {0}")]
    Panicked(String),
}

impl AttemptError {
    /// Whether the attempt ended because the worker is shutting down.
    pub fn is_halt(&self) -> bool {
        matches!(self, AttemptError::Halted)
    }
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Process {0} exited before its pid could be read")]
    MissingPid(String),

    #[error("unable to send SIGTERM, error: {0}")]
    Signal(#[from] nix::errno::Errno),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArgsError {
    #[error("unterminated quote or trailing escape in {0:?}")]
    Unbalanced(String),
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Disconnected from broker")]
    Disconnected,

    #[error("Broker I/O error: {0}")]
    Io(io::Error),

    #[error("Broker protocol error: {0}")]
    Protocol(String),

    #[error("Broker returned error {code}: {message}")]
    Server { code: String, message: String },
}

impl BrokerError {
    /// Errors raised by the transport itself, as opposed to the broker
    /// rejecting something we sent.
    pub fn is_network(&self) -> bool {
        matches!(self, BrokerError::Disconnected | BrokerError::Io(_))
    }

    pub fn is_temporary(&self) -> bool {
        match self {
            BrokerError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

impl From<io::Error> for BrokerError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => BrokerError::Disconnected,
            _ => BrokerError::Io(e),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("name not defined")]
    MissingFunctionName,

    #[error("cmd not defined")]
    MissingCommand,

    #[error("must either specify a {0} argument or set SERVICE_GEARMAND_TCP_{1}")]
    MissingBrokerAddress(&'static str, &'static str),

    #[error("heartbeat interval must be non-zero")]
    ZeroHeartbeatInterval,
}

pub type Result<T> = std::result::Result<T, BrokerError>;

fn describe_status(status: &ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit status {}", code),
        (None, Some(signal)) => format!("terminated by signal {}", signal),
        (None, None) => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_error_matches_shell_wording() {
        let err = AttemptError::Exit(ExitStatus::from_raw(2 << 8));
        assert_eq!(err.to_string(), "exit status 2");
    }

    #[test]
    fn signalled_exit_names_the_signal() {
        let err = AttemptError::Exit(ExitStatus::from_raw(9));
        assert_eq!(err.to_string(), "terminated by signal 9");
    }

    #[test]
    fn timeout_error_carries_duration() {
        let err = AttemptError::TimedOut(Duration::from_secs(30));
        assert_eq!(err.to_string(), "process timed out after 30s");
    }

    #[test]
    fn transport_drops_become_disconnects() {
        let err: BrokerError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(matches!(err, BrokerError::Disconnected));

        let err: BrokerError = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert!(matches!(err, BrokerError::Io(_)));
        assert!(err.is_network());
        assert!(!err.is_temporary());
    }

    #[test]
    fn timeouts_are_temporary() {
        let err: BrokerError = io::Error::from(io::ErrorKind::TimedOut).into();
        assert!(err.is_temporary());
        assert!(!BrokerError::Protocol("bad magic".into()).is_network());
    }
}
