//! Safe timers.
//!
//! Every recurring or delayed action in the server goes through one of these
//! two helpers. Callback errors and panics are routed into the error
//! reporter tagged with the task name; a periodic timer keeps ticking after
//! either. The returned handle aborts the underlying task when cancelled or
//! dropped, so a timer can never outlive its owner.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{ErrorKind, RelayError, report};

/// Owner handle for a scheduled task. Aborts on cancel and on drop.
#[derive(Debug)]
pub struct TimerHandle {
    handle: JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Run `f` every `period`, starting one period from now.
pub fn safe_interval<F>(name: impl Into<String>, period: Duration, mut f: F) -> TimerHandle
where
    F: FnMut() -> Result<(), RelayError> + Send + 'static,
{
    let name = name.into();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // tokio's first tick completes immediately; the contract here is
        // "first run after one period"
        ticker.tick().await;
        loop {
            ticker.tick().await;
            run_guarded(&name, &mut f);
        }
    });
    TimerHandle { handle }
}

/// Run `f` once, `delay` from now.
pub fn safe_timeout<F>(name: impl Into<String>, delay: Duration, f: F) -> TimerHandle
where
    F: FnOnce() -> Result<(), RelayError> + Send + 'static,
{
    let name = name.into();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let mut f = Some(f);
        run_guarded(&name, &mut || match f.take() {
            Some(f) => f(),
            None => Ok(()),
        });
    });
    TimerHandle { handle }
}

fn run_guarded<F>(name: &str, f: &mut F)
where
    F: FnMut() -> Result<(), RelayError>,
{
    match catch_unwind(AssertUnwindSafe(|| f())) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            report(
                &err.with_context("source", "scheduler")
                    .with_context("task", name),
            );
        }
        Err(panic) => {
            let detail = crate::error::panic_message(panic.as_ref());
            report(
                &RelayError::new(ErrorKind::Internal, format!("scheduled task panicked: {detail}"))
                    .with_context("source", "scheduler")
                    .with_context("task", name),
            );
        }
    }
}
