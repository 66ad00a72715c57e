//! Minimal periodic timer facility.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Cancels the underlying task when invoked or dropped.
#[derive(Debug)]
pub struct CancelHandle {
    handle: JoinHandle<()>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Runs `tick` every `period` until the handle is cancelled. The first
/// tick fires one full period after scheduling.
pub fn schedule_periodic<F, Fut>(period: Duration, mut tick: F) -> CancelHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let handle = tokio::spawn(async move {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval() yields immediately once; swallow that so the first
        // real tick lands a full period out.
        timer.tick().await;
        loop {
            timer.tick().await;
            tick().await;
        }
    });
    CancelHandle { handle }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_periodically_until_cancelled() {
        let count = Arc::new(AtomicU32::new(0));
        let seen = count.clone();
        let handle = schedule_periodic(Duration::from_millis(100), move || {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        let so_far = count.load(Ordering::SeqCst);
        assert!((2..=4).contains(&so_far), "got {} ticks", so_far);

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), so_far);
    }
}
