use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::session::SessionManager;
use crate::surface::EditorSurface;

/// 自動儲存的防彈跳計時。 / Debounce clock for autosave.
///
/// Every edit re-arms the deadline, so a burst of typing produces one
/// autosave once the user pauses for `interval`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutosaveScheduler {
    interval: Duration,
    armed_at: Option<Instant>,
}

impl AutosaveScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            armed_at: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn note_edit(&mut self, now: Instant) {
        self.armed_at = Some(now);
    }

    pub fn is_armed(&self) -> bool {
        self.armed_at.is_some()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.armed_at
            .is_some_and(|armed| now.saturating_duration_since(armed) >= self.interval)
    }

    pub fn cancel(&mut self) {
        self.armed_at = None;
    }
}

/// 背景執行緒，定期驅動自動儲存。 / Background thread that periodically drives a session's autosave.
///
/// The session is only touched through `try_lock`: a tick that finds the
/// session busy is skipped instead of queueing behind a user operation.
/// Dropping the timer stops and joins the thread.
pub struct AutosaveTimer {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl AutosaveTimer {
    pub fn spawn<S>(session: Arc<Mutex<SessionManager<S>>>, period: Duration) -> Self
    where
        S: EditorSurface + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::spawn(move || loop {
            match stopped.recv_timeout(period) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            let Some(mut guard) = session.try_lock() else {
                debug!("session busy, skipping autosave tick");
                continue;
            };
            if let Err(err) = guard.autosave_tick(Instant::now()) {
                warn!(error = %err, "autosave tick failed");
            }
        });
        Self {
            stop: Some(stop),
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("autosave thread panicked");
            }
        }
    }
}

impl Drop for AutosaveTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use tempfile::tempdir;

    #[test]
    fn debounce_resets_on_every_edit() {
        let start = Instant::now();
        let mut scheduler = AutosaveScheduler::new(Duration::from_secs(5));
        assert!(!scheduler.is_due(start));

        scheduler.note_edit(start);
        assert!(!scheduler.is_due(start + Duration::from_secs(4)));
        scheduler.note_edit(start + Duration::from_secs(4));
        assert!(!scheduler.is_due(start + Duration::from_secs(6)));
        assert!(scheduler.is_due(start + Duration::from_secs(9)));

        scheduler.cancel();
        assert!(!scheduler.is_due(start + Duration::from_secs(60)));
    }

    #[test]
    fn timer_writes_shadow_after_pause() {
        let dir = tempdir().unwrap();
        let mut config = SessionConfig::new(dir.path().join("root"), dir.path().join("state.json"));
        config.autosave_interval = Duration::from_millis(20);
        let session = Arc::new(Mutex::new(SessionManager::open(config).unwrap()));
        session.lock().edit(|surface| surface.set_text("print('typed')"));

        let timer = AutosaveTimer::spawn(session.clone(), Duration::from_millis(10));
        let shadow = dir.path().join("root/scripts/Untitled.py.autosave");
        let deadline = Instant::now() + Duration::from_secs(5);
        while !shadow.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        timer.stop();

        assert_eq!(std::fs::read_to_string(shadow).unwrap(), "print('typed')");
        assert!(!session.lock().scheduler().is_armed());
    }
}
