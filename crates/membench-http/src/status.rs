use std::io;
use std::time::Duration;

use serde::de::DeserializeOwned;

use membench_core::CallError;

const BODY_PREVIEW: usize = 200;

/// Shared agent settings: bounded connect, read and write timeouts.
pub fn agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(timeout.min(Duration::from_secs(10)))
        .timeout_read(timeout)
        .timeout_write(timeout)
        .build()
}

/// 429 and 5xx are worth retrying, everything else is the caller's fault.
pub fn classify_status(status: u16, body: &str) -> CallError {
    let preview: String = body.chars().take(BODY_PREVIEW).collect();
    let message = if preview.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {preview}")
    };
    match status {
        429 | 500..=599 => CallError::Transient(message),
        _ => CallError::Permanent(message),
    }
}

/// Transport failures (DNS, refused connection, timeout) are transient.
pub fn classify(err: ureq::Error) -> CallError {
    match err {
        ureq::Error::Status(status, response) => {
            let body = response.into_string().unwrap_or_default();
            classify_status(status, &body)
        }
        ureq::Error::Transport(transport) => CallError::Transient(transport.to_string()),
    }
}

/// A body cut short by a timeout or a dropped connection is transient; a
/// body that arrived but does not parse is permanent.
pub fn classify_io(err: &io::Error, what: &str) -> CallError {
    let message = format!("reading {what}: {err}");
    match err.kind() {
        io::ErrorKind::TimedOut
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => CallError::Transient(message),
        _ => CallError::Permanent(message),
    }
}

/// Read the whole body, then decode it as JSON.
pub fn read_json<T: DeserializeOwned>(
    response: ureq::Response,
    what: &str,
) -> Result<T, CallError> {
    let body = response.into_string().map_err(|e| classify_io(&e, what))?;
    serde_json::from_str(&body).map_err(|e| CallError::Permanent(format!("invalid {what}: {e}")))
}
