//! Periodic heartbeat task shared by the gateway and voice control channels.
//!
//! The scheduler runs independently of the read path. It only reads the
//! state it is given through [`HeartbeatTarget`]; when it detects a zombie
//! connection it reports it through the target and halts until restarted.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, debug, instrument::WithSubscriber, warn};

use crate::common::types::unix_millis;

/// Poll period while the session is suspended.
pub const SUSPENDED_POLL: Duration = Duration::from_secs(1);

/// What a heartbeat loop acts on.
pub trait HeartbeatTarget: Send + Sync + 'static {
    type Error: std::fmt::Display;

    /// While true the loop polls every [`SUSPENDED_POLL`] instead of beating.
    fn is_suspended(&self) -> bool {
        false
    }

    fn send_heartbeat(&self) -> Result<(), Self::Error>;

    /// Called once when an unacknowledged heartbeat is found; the loop
    /// exits right after.
    fn on_zombie(&self);
}

pub struct HeartbeatScheduler {
    label: String,
    check_acks: bool,
    interval_ms: Arc<AtomicU64>,
    acked: Arc<AtomicBool>,
    last_sent_ms: Arc<AtomicU64>,
    latency_ms: AtomicI64,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    dispatch: Dispatch,
}

impl HeartbeatScheduler {
    pub fn new(label: impl Into<String>, check_acks: bool, dispatch: Dispatch) -> Self {
        Self {
            label: label.into(),
            check_acks,
            interval_ms: Arc::new(AtomicU64::new(0)),
            acked: Arc::new(AtomicBool::new(true)),
            last_sent_ms: Arc::new(AtomicU64::new(0)),
            latency_ms: AtomicI64::new(-1),
            task: Mutex::new(None),
            cancel: CancellationToken::new(),
            dispatch,
        }
    }

    /// Arms the loop with `interval`.
    ///
    /// The interval is always updated, but a second task is never spawned
    /// while one is alive. Returns whether a new task was started.
    pub fn start<T: HeartbeatTarget>(&self, interval: Duration, target: Arc<T>) -> bool {
        self.interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);

        let mut slot = self.task.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }
        if self.cancel.is_cancelled() {
            return false;
        }

        self.acked.store(true, Ordering::SeqCst);
        debug!(
            "[{}] Starting heartbeat loop every {:?}",
            self.label, interval
        );

        let task = heartbeat_loop(
            self.label.clone(),
            self.check_acks,
            self.interval_ms.clone(),
            self.acked.clone(),
            self.last_sent_ms.clone(),
            self.cancel.clone(),
            target,
        );
        *slot = Some(tokio::spawn(task.with_subscriber(self.dispatch.clone())));
        true
    }

    /// Records a heartbeat acknowledgement and the round-trip latency.
    pub fn acknowledge(&self) {
        self.acked.store(true, Ordering::SeqCst);
        let sent = self.last_sent_ms.load(Ordering::Relaxed);
        if sent > 0 {
            let latency = unix_millis().saturating_sub(sent);
            self.latency_ms.store(latency as i64, Ordering::Relaxed);
        }
    }

    /// Forgets an outstanding heartbeat, e.g. when a fresh socket says HELLO.
    pub fn reset_ack(&self) {
        self.acked.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    pub fn latency(&self) -> Option<Duration> {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        (ms >= 0).then(|| Duration::from_millis(ms as u64))
    }

    /// Cancels the loop and waits for it to finish. Terminal.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Aborts the loop without waiting. Terminal.
    pub fn abort(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn heartbeat_loop<T: HeartbeatTarget>(
    label: String,
    check_acks: bool,
    interval_ms: Arc<AtomicU64>,
    acked: Arc<AtomicBool>,
    last_sent_ms: Arc<AtomicU64>,
    cancel: CancellationToken,
    target: Arc<T>,
) {
    loop {
        if target.is_suspended() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(SUSPENDED_POLL) => continue,
            }
        }

        let interval = Duration::from_millis(interval_ms.load(Ordering::Relaxed));
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        if target.is_suspended() {
            continue;
        }

        if check_acks && !acked.swap(false, Ordering::SeqCst) {
            warn!(
                "[{}] Last heartbeat was not acknowledged, treating connection as a zombie",
                label
            );
            target.on_zombie();
            break;
        }

        last_sent_ms.store(unix_millis(), Ordering::Relaxed);
        if let Err(e) = target.send_heartbeat() {
            warn!("[{}] Failed to send heartbeat: {}", label, e);
        }
    }
    debug!("[{}] Heartbeat loop stopped", label);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingTarget {
        beats: AtomicUsize,
        zombies: AtomicUsize,
        suspended: AtomicBool,
    }

    impl HeartbeatTarget for RecordingTarget {
        type Error = String;

        fn is_suspended(&self) -> bool {
            self.suspended.load(Ordering::SeqCst)
        }

        fn send_heartbeat(&self) -> Result<(), String> {
            self.beats.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_zombie(&self) {
            self.zombies.fetch_add(1, Ordering::SeqCst);
        }
    }

    const INTERVAL: Duration = Duration::from_millis(1_000);

    fn scheduler(check_acks: bool) -> HeartbeatScheduler {
        HeartbeatScheduler::new("test", check_acks, Dispatch::none())
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_while_running() {
        let hb = scheduler(false);
        let target = Arc::new(RecordingTarget::default());

        assert!(hb.start(INTERVAL, target.clone()));
        assert!(!hb.start(Duration::from_millis(500), target.clone()));
        assert!(hb.is_running());
        assert_eq!(hb.interval(), Duration::from_millis(500));

        hb.stop().await;
        assert!(!hb.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn beats_unconditionally_when_ack_tracking_is_off() {
        let hb = scheduler(false);
        let target = Arc::new(RecordingTarget::default());
        hb.start(INTERVAL, target.clone());

        tokio::time::sleep(INTERVAL * 4 + Duration::from_millis(10)).await;

        assert_eq!(target.beats.load(Ordering::SeqCst), 4);
        assert_eq!(target.zombies.load(Ordering::SeqCst), 0);
        hb.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn missed_ack_reports_zombie_and_halts() {
        let hb = scheduler(true);
        let target = Arc::new(RecordingTarget::default());
        hb.start(INTERVAL, target.clone());

        tokio::time::sleep(INTERVAL * 5 + Duration::from_millis(10)).await;

        // First beat goes out, second tick finds it unacknowledged.
        assert_eq!(target.beats.load(Ordering::SeqCst), 1);
        assert_eq!(target.zombies.load(Ordering::SeqCst), 1);
        assert!(!hb.is_running());

        // A halted loop can be restarted.
        assert!(hb.start(INTERVAL, target.clone()));
        hb.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_beats_keep_the_loop_alive() {
        let hb = Arc::new(scheduler(true));
        let target = Arc::new(RecordingTarget::default());
        hb.start(INTERVAL, target.clone());

        // Acknowledge half an interval after each beat.
        tokio::time::sleep(INTERVAL / 2).await;
        for _ in 0..5 {
            tokio::time::sleep(INTERVAL).await;
            tokio::task::yield_now().await;
            hb.acknowledge();
        }

        assert_eq!(target.zombies.load(Ordering::SeqCst), 0);
        assert!(target.beats.load(Ordering::SeqCst) >= 4);
        assert!(hb.latency().is_some());
        hb.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn suspended_session_is_not_beaten() {
        let hb = scheduler(true);
        let target = Arc::new(RecordingTarget::default());
        target.suspended.store(true, Ordering::SeqCst);
        hb.start(INTERVAL, target.clone());

        tokio::time::sleep(INTERVAL * 10).await;
        assert_eq!(target.beats.load(Ordering::SeqCst), 0);
        assert_eq!(target.zombies.load(Ordering::SeqCst), 0);

        target.suspended.store(false, Ordering::SeqCst);
        tokio::time::sleep(INTERVAL * 2 + SUSPENDED_POLL).await;
        assert!(target.beats.load(Ordering::SeqCst) >= 1);
        hb.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_scheduler_cannot_restart() {
        let hb = scheduler(false);
        let target = Arc::new(RecordingTarget::default());
        hb.stop().await;
        assert!(!hb.start(INTERVAL, target));
    }
}
