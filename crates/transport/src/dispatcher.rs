//! Polling dispatcher
//!
//! One dedicated thread drives [`EventSource::poll_events`] in a loop. It is
//! the only place asynchronous transfers get resolved, so every blocked
//! `read_multi` depends on it running. The loop exits once its
//! [`CancelToken`] is cancelled, which it notices within one poll interval.

use crate::backend::EventSource;
use crate::error::{DeviceFault, TransportError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Shared stop flag for the dispatcher loop
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Poll `events` every `interval` until `token` is cancelled
pub fn run(events: &dyn EventSource, token: &CancelToken, interval: Duration) {
    let interval = interval.max(MIN_INTERVAL);
    info!("USB dispatcher started");

    while !token.is_cancelled() {
        // A panicking backend must not take the dispatcher down with it
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            events.poll_events(interval)
        }));

        match result {
            Ok(Ok(())) => {}
            Ok(Err(TransportError::Device(DeviceFault::Cancelled))) => {
                debug!("USB event handling interrupted");
            }
            Ok(Err(e)) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(interval);
            }
            Err(e) => {
                error!("Panic in USB event handling: {:?}", e);
                std::thread::sleep(interval);
            }
        }
    }

    info!("USB dispatcher stopped");
}

/// Handle to a running dispatcher thread; dropping it stops the thread
pub struct Dispatcher {
    token: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel the loop and wait for the thread to exit
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("USB dispatcher thread panicked");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the dispatcher loop on a dedicated thread named `usb-dispatcher`
pub fn spawn_dispatcher(
    events: Arc<dyn EventSource>,
    token: CancelToken,
    interval: Duration,
) -> std::io::Result<Dispatcher> {
    let thread_token = token.clone();
    let handle = std::thread::Builder::new()
        .name("usb-dispatcher".to_string())
        .spawn(move || run(events.as_ref(), &thread_token, interval))?;

    Ok(Dispatcher {
        token,
        handle: Some(handle),
    })
}
