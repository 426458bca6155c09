//! Periodic background tasks on the tokio runtime.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A repeating task. The closure produces one future per tick; ticks do not
/// overlap. Dropping the handle stops the task.
pub struct PeriodicTask {
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick of a tokio interval fires immediately; skip it
            // so the initial run happens one period after startup
            interval.tick().await;
            loop {
                interval.tick().await;
                log::trace!("periodic task '{name}' tick");
                tick().await;
            }
        });
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
