use std::{
    sync::{mpsc::RecvTimeoutError, Arc, Condvar, Mutex},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{Error, Result, SwitchStore};

/// Configuration for [`RefresherThread`].
#[derive(Debug, Clone)]
pub struct RefresherThreadConfig {
    /// Time between refreshes.
    pub interval: Duration,
    /// Upper bound of the random delay added to each interval.
    pub jitter: Duration,
}

impl RefresherThreadConfig {
    /// Default value for [`RefresherThreadConfig::interval`].
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
    /// Default value for [`RefresherThreadConfig::jitter`].
    pub const DEFAULT_JITTER: Duration = Duration::from_secs(3);

    /// Default configuration.
    pub fn new() -> RefresherThreadConfig {
        RefresherThreadConfig::default()
    }

    /// Set [`RefresherThreadConfig::interval`].
    pub fn with_interval(mut self, interval: Duration) -> RefresherThreadConfig {
        self.interval = interval;
        self
    }

    /// Set [`RefresherThreadConfig::jitter`].
    pub fn with_jitter(mut self, jitter: Duration) -> RefresherThreadConfig {
        self.jitter = jitter;
        self
    }
}

impl Default for RefresherThreadConfig {
    fn default() -> RefresherThreadConfig {
        RefresherThreadConfig {
            interval: RefresherThreadConfig::DEFAULT_INTERVAL,
            jitter: RefresherThreadConfig::DEFAULT_JITTER,
        }
    }
}

/// A background thread that periodically reloads a [`SwitchStore`] from its backend.
///
/// Useful with [`RefreshPolicy::Never`](crate::RefreshPolicy::Never) to keep reads off the backend
/// entirely while still picking up writes made elsewhere.
pub struct RefresherThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the refresher thread.
    stop_sender: std::sync::mpsc::Sender<()>,

    /// Holds `None` until the first refresh attempt completes, then the outcome of the most recent
    /// attempt.
    result: Arc<(Mutex<Option<Result<()>>>, Condvar)>,
}

impl RefresherThread {
    /// Spawn a thread refreshing `store` every `config.interval` (plus random jitter).
    pub fn start(store: Arc<SwitchStore>, config: RefresherThreadConfig) -> Result<RefresherThread> {
        let (stop_sender, stop_receiver) = std::sync::mpsc::channel::<()>();

        let result = Arc::new((Mutex::new(None), Condvar::new()));

        let join_handle = {
            // Cloning Arc for move into thread
            let result = Arc::clone(&result);
            let update_result = move |value| {
                if let Ok(mut lock) = result.0.lock() {
                    *lock = Some(value);
                }
                result.1.notify_all();
            };

            std::thread::Builder::new()
                .name("switchyard-refresher".to_owned())
                .spawn(move || loop {
                    log::debug!(target: "switchyard", "refreshing switches");
                    let outcome = store.refresh();
                    if let Err(err) = &outcome {
                        // Keep serving the previous cache, we'll try again later.
                        log::warn!(target: "switchyard", "error while refreshing switches: {:?}", err);
                    }
                    update_result(outcome);

                    let timeout = jitter(config.interval, config.jitter);
                    match stop_receiver.recv_timeout(timeout) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) => {
                            log::debug!(target: "switchyard", "refresher thread received stop command");
                            return;
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            // The handle was dropped without stopping us, .recv_timeout() now
                            // returns immediately.
                            std::thread::sleep(timeout);
                        }
                    }
                })?
        };

        Ok(RefresherThread {
            join_handle,
            stop_sender,
            result,
        })
    }

    /// Block waiting for the first refresh attempt and return its outcome.
    pub fn wait_for_refresh(&self) -> Result<()> {
        let mut lock = self
            .result
            .0
            .lock()
            .map_err(|_| Error::RefresherThreadPanicked)?;
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => {
                    lock = self
                        .result
                        .1
                        .wait(lock)
                        .map_err(|_| Error::RefresherThreadPanicked)?;
                }
            }
        }
    }

    /// Stop the refresher thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means that the receiver was dropped (thread exited).
        let _ = self.stop_sender.send(());
    }

    /// Stop the refresher thread and block waiting for it to exit.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle
            .join()
            .map_err(|_| Error::RefresherThreadPanicked)?;
        Ok(())
    }
}

/// Apply a random jitter to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    interval + thread_rng().gen_range(Duration::ZERO..jitter)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{jitter, RefresherThread, RefresherThreadConfig};
    use crate::{
        backend::MemoryBackend, config::RefreshPolicy, Switch, SwitchStatus, SwitchStore,
    };

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..100 {
            let value = jitter(Duration::from_secs(10), Duration::from_secs(1));
            assert!(value >= Duration::from_secs(10) && value < Duration::from_secs(11));
        }
        assert_eq!(
            jitter(Duration::from_secs(10), Duration::ZERO),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn refreshes_in_background() {
        let _ = env_logger::builder().is_test(true).try_init();

        let backend = Arc::new(MemoryBackend::new());
        let writer = SwitchStore::new(backend.clone());
        let reader =
            Arc::new(SwitchStore::new(backend).with_refresh_policy(RefreshPolicy::Never));

        writer.save(Switch::new("test", SwitchStatus::Disabled)).unwrap();

        let refresher = RefresherThread::start(
            reader.clone(),
            RefresherThreadConfig::new()
                .with_interval(Duration::from_millis(10))
                .with_jitter(Duration::ZERO),
        )
        .unwrap();
        refresher.wait_for_refresh().unwrap();
        assert_eq!(reader.get("test").unwrap().status, SwitchStatus::Disabled);

        writer.set_status("test", SwitchStatus::Global).unwrap();
        let mut seen = false;
        for _ in 0..200 {
            if reader.get("test").unwrap().status == SwitchStatus::Global {
                seen = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(seen);

        refresher.shutdown().unwrap();
    }
}
