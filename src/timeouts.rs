use std::time::Duration;

const MIN_RESPONSE_WAIT: Duration = Duration::from_secs(60);
const RESPONSE_WAIT_MARGIN: Duration = Duration::from_secs(30);

pub(crate) const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
pub(crate) const PING_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const REFRESH_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const VENV_TIMEOUT: Duration = Duration::from_secs(120);
/// Extra time the worker-side alarm gets over a shell command's own limit.
pub(crate) const SHELL_ALARM_MARGIN: Duration = Duration::from_secs(10);
/// Time a worker gets to honour `EXIT` before it is signalled.
pub(crate) const EXIT_GRACE: Duration = Duration::from_secs(5);
/// Time between SIGTERM and SIGKILL.
pub(crate) const TERMINATE_GRACE: Duration = Duration::from_secs(2);
pub(crate) const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the session waits for a reply to a command with the given
/// worker-side timeout before declaring the worker wedged.
pub(crate) fn response_wait(timeout: Duration) -> Duration {
    timeout.saturating_add(RESPONSE_WAIT_MARGIN).max(MIN_RESPONSE_WAIT)
}

/// Whole seconds for the wire, rounded up and never zero so the worker's
/// alarm always arms.
pub(crate) fn wire_seconds(timeout: Duration) -> u64 {
    let secs = timeout.as_secs();
    let secs = if timeout.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    };
    secs.max(1)
}
