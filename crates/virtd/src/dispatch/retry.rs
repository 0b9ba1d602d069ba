//! Bounded retry with escalation.

use tracing::debug;

use super::errors::HandlerError;
use super::router::ROUTER_TARGET;

/// Runs `action`, re-running it immediately after each
/// [`HandlerError::Transient`] failure until `retries` re-runs have been spent.
///
/// A transient failure on the final attempt is escalated to
/// [`HandlerError::Fatal`] with the same message. Any other error is returned
/// as is, without retrying, so callers only observe success, a fatal error,
/// or a domain error they already know how to map.
///
/// # Errors
///
/// Returns the escalated or pass-through error described above.
pub fn execute<T, F>(retries: usize, mut action: F) -> Result<T, HandlerError>
where
    F: FnMut() -> Result<T, HandlerError>,
{
    let mut attempt = 0;
    loop {
        match action() {
            Err(HandlerError::Transient { message }) if attempt >= retries => {
                return Err(HandlerError::Fatal { message });
            }
            Err(HandlerError::Transient { message }) => {
                attempt += 1;
                debug!(target: ROUTER_TARGET, attempt, retries, %message, "retrying transient failure");
            }
            outcome => return outcome,
        }
    }
}
