//! Notification presenter state machine.
//!
//! Governs the single alert an operator sees: Idle → Displaying →
//! Dismissing → Idle. Promotion only happens while Idle; alerts arriving
//! during a display cycle queue up and never preempt the current one.
//!
//! Acknowledgment guarantee: every display cycle ends in exactly one
//! invocation of the acknowledgment hook, no matter which trigger dismissed
//! the alert or how many times the operator clicks. The transition into
//! Dismissing is a single-winner claim taken under the state lock, and the
//! auto-close countdown carries the display-cycle generation so a stale
//! timer can never dismiss a later alert.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::alerts::queue::{AlertQueue, EnqueueOutcome};
use crate::protocol::AlertEvent;
use crate::review::AlertReviewApi;
use crate::sound::SoundController;

/// Default settle delay between Dismissing and Idle (exit transition time).
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(300);

/// Default screen-flash duration.
pub const DEFAULT_FLASH_DURATION: Duration = Duration::from_secs(3);

/// Default dedup-cache sweep interval.
pub const DEFAULT_DEDUP_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Presenter phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenterPhase {
    #[default]
    Idle,
    Displaying,
    Dismissing,
}

impl std::fmt::Display for PresenterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Displaying => write!(f, "displaying"),
            Self::Dismissing => write!(f, "dismissing"),
        }
    }
}

/// What ended a display cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DismissTrigger {
    Dismissed,
    Confirmed,
    FalsePositive,
    ViewDetails,
    AutoClose,
}

impl std::fmt::Display for DismissTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dismissed => write!(f, "dismissed"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::FalsePositive => write!(f, "false_positive"),
            Self::ViewDetails => write!(f, "view_details"),
            Self::AutoClose => write!(f, "auto_close"),
        }
    }
}

/// Presenter configuration.
#[derive(Debug, Clone)]
pub struct PresenterConfig {
    /// Auto-close countdown; zero disables auto-dismiss.
    pub auto_close: Duration,
    pub settle_delay: Duration,
    pub flash_duration: Duration,
    pub flash_enabled: bool,
    pub max_queue_size: usize,
    pub dedup_cap: usize,
    /// Dedup sweep period; zero disables the sweep task.
    pub dedup_sweep_interval: Duration,
}

impl Default for PresenterConfig {
    fn default() -> Self {
        Self {
            auto_close: Duration::ZERO,
            settle_delay: DEFAULT_SETTLE_DELAY,
            flash_duration: DEFAULT_FLASH_DURATION,
            flash_enabled: true,
            max_queue_size: crate::alerts::queue::DEFAULT_MAX_PENDING,
            dedup_cap: crate::alerts::queue::DEFAULT_DEDUP_CAP,
            dedup_sweep_interval: DEFAULT_DEDUP_SWEEP_INTERVAL,
        }
    }
}

/// Snapshot of the display state, published on every change.
#[derive(Debug, Clone, Default)]
pub struct DisplaySnapshot {
    pub phase: PresenterPhase,
    pub current: Option<AlertEvent>,
    /// Queued-but-undisplayed count for the "N more pending" indicator.
    pub pending: usize,
    /// Screen-flash flag; true for the flash window after promotion.
    pub flash: bool,
}

pub type AckHook = Arc<dyn Fn(&AlertEvent, DismissTrigger) + Send + Sync>;
pub type DetailsHook = Arc<dyn Fn(&AlertEvent) + Send + Sync>;

struct PresenterState {
    phase: PresenterPhase,
    current: Option<AlertEvent>,
    /// Display-cycle counter; guards stale countdown timers.
    generation: u64,
    flash: bool,
    countdown: Option<tokio::task::JoinHandle<()>>,
    flash_timer: Option<tokio::task::JoinHandle<()>>,
}

struct PresenterInner {
    config: PresenterConfig,
    queue: Mutex<AlertQueue>,
    state: Mutex<PresenterState>,
    snapshot_tx: watch::Sender<DisplaySnapshot>,
    snapshot_rx: watch::Receiver<DisplaySnapshot>,
    sound: Arc<SoundController>,
    review: Arc<dyn AlertReviewApi>,
    on_ack: Mutex<Option<AckHook>>,
    on_details: Mutex<Option<DetailsHook>>,
    sweep: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// The notification presenter. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AlertPresenter {
    inner: Arc<PresenterInner>,
}

impl AlertPresenter {
    pub fn new(
        config: PresenterConfig,
        sound: Arc<SoundController>,
        review: Arc<dyn AlertReviewApi>,
    ) -> Self {
        let queue = AlertQueue::new(config.max_queue_size, config.dedup_cap);
        let (snapshot_tx, snapshot_rx) = watch::channel(DisplaySnapshot::default());
        Self {
            inner: Arc::new(PresenterInner {
                config,
                queue: Mutex::new(queue),
                state: Mutex::new(PresenterState {
                    phase: PresenterPhase::Idle,
                    current: None,
                    generation: 0,
                    flash: false,
                    countdown: None,
                    flash_timer: None,
                }),
                snapshot_tx,
                snapshot_rx,
                sound,
                review,
                on_ack: Mutex::new(None),
                on_details: Mutex::new(None),
                sweep: Mutex::new(None),
            }),
        }
    }

    /// Set the exactly-once acknowledgment hook.
    pub fn with_ack_hook<F>(self, hook: F) -> Self
    where
        F: Fn(&AlertEvent, DismissTrigger) + Send + Sync + 'static,
    {
        *self.inner.on_ack.lock() = Some(Arc::new(hook));
        self
    }

    /// Set the view-details navigation hook.
    pub fn with_details_hook<F>(self, hook: F) -> Self
    where
        F: Fn(&AlertEvent) + Send + Sync + 'static,
    {
        *self.inner.on_details.lock() = Some(Arc::new(hook));
        self
    }

    /// Start the dedup sweep task. Idempotent.
    pub fn start(&self) {
        let interval = self.inner.config.dedup_sweep_interval;
        if interval.is_zero() {
            return;
        }
        let mut guard = self.inner.sweep.lock();
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        let this = self.clone();
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let cleared = {
                    let mut queue = this.inner.queue.lock();
                    let entries = queue.seen_len();
                    queue.clear_seen();
                    entries
                };
                if cleared > 0 {
                    debug!(target: "alerts", entries = cleared, "dedup cache swept");
                }
            }
        }));
    }

    /// Cancel every timer the presenter owns and silence the alarm.
    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.sweep.lock().take() {
            handle.abort();
        }
        {
            let mut state = self.inner.state.lock();
            if let Some(handle) = state.countdown.take() {
                handle.abort();
            }
            if let Some(handle) = state.flash_timer.take() {
                handle.abort();
            }
        }
        self.inner.sound.stop();
    }

    /// Current display phase.
    pub fn phase(&self) -> PresenterPhase {
        self.inner.state.lock().phase
    }

    /// The alert currently shown, if any.
    pub fn current_alert(&self) -> Option<AlertEvent> {
        self.inner.state.lock().current.clone()
    }

    /// Queued-but-undisplayed alert count.
    pub fn pending_count(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Watch channel publishing every display-state change.
    pub fn watch_display(&self) -> watch::Receiver<DisplaySnapshot> {
        self.inner.snapshot_rx.clone()
    }

    /// Ingest one alert event: dedup, queue, and promote if Idle.
    pub fn submit(&self, alert: AlertEvent) {
        let outcome = self.inner.queue.lock().enqueue(alert);
        match &outcome {
            EnqueueOutcome::Duplicate => return,
            EnqueueOutcome::Queued { dropped_oldest } => {
                if let Some(dropped) = dropped_oldest {
                    warn!(target: "alerts", alert_id = %dropped, "pending alert evicted unseen");
                }
            }
        }
        self.maybe_promote();
        self.publish();
    }

    /// Explicit operator dismiss (no review call).
    pub fn dismiss(&self) -> bool {
        match self.claim(None) {
            Some(alert) => {
                self.finish_dismiss(alert, DismissTrigger::Dismissed);
                true
            }
            None => false,
        }
    }

    /// Confirm the current alert as a real threat. Returns false when no
    /// alert is displaying (e.g. a second rapid click).
    pub async fn confirm(&self, notes: Option<&str>) -> bool {
        let Some(alert) = self.claim(None) else {
            return false;
        };
        if let Err(error) = self.inner.review.resolve(&alert.id, notes).await {
            warn!(target: "alerts", alert_id = %alert.id, %error, "resolve request failed");
        }
        self.finish_dismiss(alert, DismissTrigger::Confirmed);
        true
    }

    /// Mark the current alert as a false alarm.
    pub async fn mark_false_positive(&self, notes: Option<&str>) -> bool {
        let Some(alert) = self.claim(None) else {
            return false;
        };
        if let Err(error) = self.inner.review.mark_false_positive(&alert.id, notes).await {
            warn!(
                target: "alerts",
                alert_id = %alert.id,
                %error,
                "false-positive request failed"
            );
        }
        self.finish_dismiss(alert, DismissTrigger::FalsePositive);
        true
    }

    /// Open the detail view for the current alert, then dismiss it.
    pub fn view_details(&self) -> bool {
        let Some(alert) = self.claim(None) else {
            return false;
        };
        let hook = self.inner.on_details.lock().clone();
        if let Some(hook) = hook {
            hook(&alert);
        }
        self.finish_dismiss(alert, DismissTrigger::ViewDetails);
        true
    }

    /// Single-winner transition into Dismissing. `expected_generation` is
    /// set by the auto-close countdown so a stale timer loses the claim;
    /// explicit triggers cancel the countdown instead.
    fn claim(&self, expected_generation: Option<u64>) -> Option<AlertEvent> {
        let mut state = self.inner.state.lock();
        if state.phase != PresenterPhase::Displaying {
            return None;
        }
        if let Some(generation) = expected_generation {
            if state.generation != generation {
                return None;
            }
        } else if let Some(handle) = state.countdown.take() {
            handle.abort();
        }
        state.phase = PresenterPhase::Dismissing;
        state.current.clone()
    }

    /// Common dismiss path: silence the alarm, fire the acknowledgment hook
    /// once, and return to Idle after the settle delay.
    fn finish_dismiss(&self, alert: AlertEvent, trigger: DismissTrigger) {
        self.inner.sound.stop();

        let hook = self.inner.on_ack.lock().clone();
        if let Some(hook) = hook {
            hook(&alert, trigger);
        }
        info!(
            target: "alerts",
            alert_id = %alert.id,
            trigger = %trigger,
            "alert dismissed"
        );
        self.publish();

        let this = self.clone();
        let settle = self.inner.config.settle_delay;
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            {
                let mut state = this.inner.state.lock();
                state.phase = PresenterPhase::Idle;
                state.current = None;
                state.flash = false;
                if let Some(handle) = state.flash_timer.take() {
                    handle.abort();
                }
            }
            this.publish();
            this.maybe_promote();
            this.publish();
        });
    }

    /// Promote the oldest pending alert when Idle.
    fn maybe_promote(&self) {
        let promoted = {
            let mut state = self.inner.state.lock();
            if state.phase != PresenterPhase::Idle {
                return;
            }
            let Some(next) = self.inner.queue.lock().promote() else {
                return;
            };
            state.phase = PresenterPhase::Displaying;
            state.current = Some(next.event.clone());
            state.generation += 1;
            state.flash = self.inner.config.flash_enabled;
            (next.event, state.generation)
        };
        let (alert, generation) = promoted;

        info!(
            target: "alerts",
            alert_id = %alert.id,
            camera_id = %alert.camera_id,
            severity = %alert.effective_severity(),
            "displaying alert"
        );

        self.inner.sound.start_alarm();

        if self.inner.config.flash_enabled {
            let this = self.clone();
            let flash_duration = self.inner.config.flash_duration;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(flash_duration).await;
                {
                    let mut state = this.inner.state.lock();
                    if state.generation == generation {
                        state.flash = false;
                    }
                }
                this.publish();
            });
            self.inner.state.lock().flash_timer = Some(handle);
        }

        if !self.inner.config.auto_close.is_zero() {
            let this = self.clone();
            let auto_close = self.inner.config.auto_close;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(auto_close).await;
                if let Some(alert) = this.claim(Some(generation)) {
                    this.finish_dismiss(alert, DismissTrigger::AutoClose);
                }
            });
            self.inner.state.lock().countdown = Some(handle);
        }

        self.publish();
    }

    fn publish(&self) {
        let snapshot = {
            let state = self.inner.state.lock();
            DisplaySnapshot {
                phase: state.phase,
                current: state.current.clone(),
                pending: self.inner.queue.lock().len(),
                flash: state.flash,
            }
        };
        let _ = self.inner.snapshot_tx.send(snapshot);
    }
}
