//! Shell-style splitting of job payloads into argument vectors.
//!
//! Quoting and escaping follow POSIX shell rules. No expansion of any kind
//! (variables, globs, command substitution) is performed.

use crate::error::ArgsError;

/// Split `payload` into arguments the way a shell would.
pub fn parse_args(payload: &str) -> Result<Vec<String>, ArgsError> {
    shlex::split(payload).ok_or_else(|| ArgsError::Unbalanced(payload.to_string()))
}
