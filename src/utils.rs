//! Small cross-cutting helpers shared by the rest of the crate.

use std::future::Future;

use anyhow::{Error as AnyError, Result as AnyResult};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::error;

/// Converts any error type into `anyhow::Error`, for call sites that merge
/// heterogeneous component errors (`TxStoreError`, `ChainError`, ...) into one
/// boundary type.
pub trait Any<A> {
    fn any(self) -> AnyResult<A>;
}

impl<A, B> Any<A> for Result<A, B>
where
    B: Into<AnyError>,
{
    fn any(self) -> AnyResult<A> {
        self.map_err(Into::into)
    }
}

/// Spawn a task and abort the process if it ever returns an error. Used for
/// tasks whose failure means the relay's invariants can no longer be trusted
/// (e.g. the reconciliation ticker itself), as opposed to per-request work
/// whose errors are handled locally.
pub fn spawn_or_abort<F>(future: F) -> JoinHandle<()>
where
    F: Future<Output = AnyResult<()>> + Send + 'static,
{
    tokio::spawn(future.map(|result| {
        if let Err(error) = result {
            error!(?error, "Fatal error in supervised task");
            std::process::abort();
        }
    }))
}

/// Draws a uniform integer delay in `[min, max]` milliseconds from the OS
/// CSPRNG. Used by the admission pipeline's alerted-state throttle; a
/// deterministic PRNG would let an adversary predict and route around the
/// throttle.
pub fn random_delay_ms(min_ms: u64, max_ms: u64) -> std::time::Duration {
    use rand::Rng;

    if max_ms <= min_ms {
        return std::time::Duration::from_millis(min_ms);
    }
    let millis = rand::rngs::OsRng.gen_range(min_ms..=max_ms);
    std::time::Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_delay_stays_in_bounds() {
        for _ in 0..100 {
            let delay = random_delay_ms(10, 20);
            assert!(delay.as_millis() >= 10 && delay.as_millis() <= 20);
        }
    }

    #[test]
    fn random_delay_handles_degenerate_range() {
        assert_eq!(random_delay_ms(5, 5).as_millis(), 5);
        assert_eq!(random_delay_ms(5, 3).as_millis(), 5);
    }
}
