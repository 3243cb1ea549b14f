//! Retrying transient transaction failures.

use crate::cancel::CancellationToken;
use crate::config::RetryPolicy;
use crate::error::Result;
use std::thread;

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy runs out of attempts. The wait grows linearly with each attempt.
pub fn with_retry<T, F>(policy: &RetryPolicy, token: Option<&CancellationToken>, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 1;
    loop {
        if let Some(token) = token {
            token.check()?;
        }

        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                tracing::debug!(attempt, error = %e, "retrying after transient failure");
                thread::sleep(policy.backoff * attempt);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
