//! One-shot exit timer.
//!
//! A launched Tracker keeps running until the user quits it, so the starter
//! cannot wait for it. Instead the timer is armed right before each spawn; if
//! the child is still alive when the grace period ends, the timer fires and
//! the starter exits. A child that fails fast reports back before that and the
//! timer is re-armed for the retry.

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_GRACE: Duration = Duration::from_secs(1);

enum Control {
    Arm,
    Stop,
}

pub struct Watchdog {
    control: Sender<Control>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Starts the timer thread. Nothing happens until the first `arm()`.
    pub fn spawn<F>(grace: Duration, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = unbounded::<Control>();
        let handle = thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || {
                // wait for the first arm
                match rx.recv() {
                    Ok(Control::Arm) => {}
                    Ok(Control::Stop) | Err(_) => return,
                }
                loop {
                    match rx.recv_timeout(grace) {
                        Ok(Control::Arm) => {
                            log::debug!(target: "watchdog", "re-armed for {:?}", grace);
                        }
                        Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => return,
                        Err(RecvTimeoutError::Timeout) => {
                            log::info!(target: "watchdog", "grace period of {:?} elapsed", grace);
                            on_fire();
                            return;
                        }
                    }
                }
            })
            .ok();
        if handle.is_none() {
            log::warn!(target: "watchdog", "failed to start watchdog thread");
        }
        Self { control: tx, handle }
    }

    /// Starts (or restarts) the grace period.
    pub fn arm(&self) {
        let _ = self.control.send(Control::Arm);
    }

    /// Cancels the timer and waits for its thread to end.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.control.send(Control::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}
