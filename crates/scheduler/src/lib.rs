//! Host-side scheduling for per-shader animation loops.
//!
//! Nothing in here touches the GPU. The renderer's animator owns one
//! [`Schedule`] keyed by shader id and asks it which loops are due on every
//! host tick; each loop carries a [`FrameClock`], an [`AdaptiveQuality`]
//! monitor and a [`CancellationToken`] that is checked after every GPU wait.
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("no live animation for {0}")]
    NotLive(String),
}

/// Cooperative cancellation flag shared between a loop and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Elapsed time and frame counter fed to the shader each frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameClock {
    start: Instant,
    frame: u32,
}

impl FrameClock {
    pub fn new(now: Instant) -> Self {
        Self {
            start: now,
            frame: 0,
        }
    }

    /// Returns `(elapsed_seconds, frame_index)` for the frame about to render.
    pub fn sample(&self, now: Instant) -> (f32, u32) {
        (
            now.saturating_duration_since(self.start).as_secs_f32(),
            self.frame,
        )
    }

    /// Marks the current frame as rendered.
    pub fn advance(&mut self) {
        self.frame = self.frame.saturating_add(1);
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn reset(&mut self, now: Instant) {
        self.start = now;
        self.frame = 0;
    }
}

/// Outcome of feeding one frame duration into [`AdaptiveQuality`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualitySignal {
    Keep,
    RequestLowerResolution,
}

/// Thresholds for the slow-start check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityPolicy {
    /// Only frames with an index below this are inspected.
    pub check_window: u32,
    /// A frame slower than this counts as slow.
    pub slow_frame_threshold: Duration,
    /// Number of slow frames within the window that trips the signal.
    pub slow_frame_limit: u32,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            check_window: 30,
            slow_frame_threshold: Duration::from_millis(100),
            slow_frame_limit: 3,
        }
    }
}

/// One-shot "this is too slow" detector for the first frames of an animation.
///
/// Once it has tripped, or once the check window has passed, it never reports
/// again for the lifetime of the animation instance.
#[derive(Debug, Clone)]
pub struct AdaptiveQuality {
    policy: QualityPolicy,
    slow_frames: u32,
    window_closed: bool,
    tripped: bool,
}

impl AdaptiveQuality {
    pub fn new(policy: QualityPolicy) -> Self {
        Self {
            policy,
            slow_frames: 0,
            window_closed: false,
            tripped: false,
        }
    }

    pub fn observe(&mut self, frame_index: u32, frame_time: Duration) -> QualitySignal {
        if self.window_closed {
            return QualitySignal::Keep;
        }
        if frame_index >= self.policy.check_window {
            self.window_closed = true;
            return QualitySignal::Keep;
        }
        if frame_time > self.policy.slow_frame_threshold {
            self.slow_frames += 1;
        }
        if self.slow_frames >= self.policy.slow_frame_limit {
            self.window_closed = true;
            self.tripped = true;
            return QualitySignal::RequestLowerResolution;
        }
        if frame_index + 1 >= self.policy.check_window {
            self.window_closed = true;
        }
        QualitySignal::Keep
    }

    pub fn slow_frames(&self) -> u32 {
        self.slow_frames
    }

    pub fn is_closed(&self) -> bool {
        self.window_closed
    }

    pub fn has_tripped(&self) -> bool {
        self.tripped
    }
}

fn normalize_fps(value: Option<f32>) -> Option<f32> {
    value.and_then(|fps| if fps > 0.0 && fps.is_finite() { Some(fps) } else { None })
}

#[derive(Debug)]
struct ScheduleEntry {
    token: CancellationToken,
    interval: Option<Duration>,
    last_tick: Option<Instant>,
}

/// Result of starting a loop for a key.
#[derive(Debug)]
pub struct Started {
    pub token: CancellationToken,
    /// Token of the loop this start displaced, already cancelled.
    pub replaced: Option<CancellationToken>,
}

/// Live-loop registry: at most one loop per key.
#[derive(Debug)]
pub struct Schedule<K> {
    entries: HashMap<K, ScheduleEntry>,
}

impl<K> Default for Schedule<K> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K> Schedule<K>
where
    K: Clone + Eq + Hash + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a loop for `key`, cancelling whatever loop held it before.
    ///
    /// `fps` caps how often [`Schedule::due`] reports the key; `None`, zero or
    /// negative values mean every tick.
    pub fn start(&mut self, key: K, fps: Option<f32>) -> Started {
        let token = CancellationToken::new();
        let entry = ScheduleEntry {
            token: token.clone(),
            interval: normalize_fps(fps).map(|fps| Duration::from_secs_f32(1.0 / fps)),
            last_tick: None,
        };
        let replaced = self.entries.insert(key.clone(), entry).map(|previous| {
            previous.token.cancel();
            tracing::debug!(?key, "replaced live animation loop");
            previous.token
        });
        Started { token, replaced }
    }

    /// Cancels and forgets the loop for `key`. Returns false if none was live.
    pub fn stop(&mut self, key: &K) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_live(&self, key: &K) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.token.is_cancelled())
    }

    pub fn token(&self, key: &K) -> Result<CancellationToken, SchedulerError> {
        self.entries
            .get(key)
            .map(|entry| entry.token.clone())
            .ok_or_else(|| SchedulerError::NotLive(format!("{key:?}")))
    }

    /// Keys whose next frame is due at `now`, marking them as ticked.
    ///
    /// No ordering is promised between keys.
    pub fn due(&mut self, now: Instant) -> Vec<K> {
        let mut due = Vec::new();
        for (key, entry) in self.entries.iter_mut() {
            if entry.token.is_cancelled() {
                continue;
            }
            let ready = match (entry.interval, entry.last_tick) {
                (Some(interval), Some(last)) => now.saturating_duration_since(last) >= interval,
                _ => true,
            };
            if ready {
                entry.last_tick = Some(now);
                due.push(key.clone());
            }
        }
        due
    }

    /// Drops entries whose token was cancelled out-of-band and returns their keys.
    pub fn sweep(&mut self) -> Vec<K> {
        let cancelled: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.token.is_cancelled())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &cancelled {
            self.entries.remove(key);
        }
        cancelled
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        for entry in self.entries.values() {
            entry.token.cancel();
        }
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLOW: Duration = Duration::from_millis(150);
    const FAST: Duration = Duration::from_millis(16);

    #[test]
    fn quality_trips_once_after_three_slow_frames() {
        let mut quality = AdaptiveQuality::new(QualityPolicy::default());
        assert_eq!(quality.observe(0, SLOW), QualitySignal::Keep);
        assert_eq!(quality.observe(1, FAST), QualitySignal::Keep);
        assert_eq!(quality.observe(2, SLOW), QualitySignal::Keep);
        assert_eq!(
            quality.observe(3, SLOW),
            QualitySignal::RequestLowerResolution
        );
        assert!(quality.has_tripped());
        for frame in 4..60 {
            assert_eq!(quality.observe(frame, SLOW), QualitySignal::Keep);
        }
    }

    #[test]
    fn quality_ignores_slow_frames_after_window() {
        let mut quality = AdaptiveQuality::new(QualityPolicy::default());
        for frame in 0..30 {
            let time = if frame == 5 || frame == 6 { SLOW } else { FAST };
            assert_eq!(quality.observe(frame, time), QualitySignal::Keep);
        }
        assert!(quality.is_closed());
        for frame in 30..40 {
            assert_eq!(quality.observe(frame, SLOW), QualitySignal::Keep);
        }
        assert!(!quality.has_tripped());
        assert_eq!(quality.slow_frames(), 2);
    }

    #[test]
    fn quality_counts_the_last_frame_of_the_window() {
        let mut quality = AdaptiveQuality::new(QualityPolicy::default());
        for frame in 0..29 {
            let time = if frame < 2 { SLOW } else { FAST };
            quality.observe(frame, time);
        }
        assert_eq!(
            quality.observe(29, SLOW),
            QualitySignal::RequestLowerResolution
        );
    }

    #[test]
    fn threshold_is_exclusive() {
        let policy = QualityPolicy {
            slow_frame_limit: 1,
            ..QualityPolicy::default()
        };
        let mut quality = AdaptiveQuality::new(policy);
        assert_eq!(
            quality.observe(0, Duration::from_millis(100)),
            QualitySignal::Keep
        );
        assert_eq!(
            quality.observe(1, Duration::from_millis(101)),
            QualitySignal::RequestLowerResolution
        );
    }

    #[test]
    fn frame_clock_samples_and_resets() {
        let start = Instant::now();
        let mut clock = FrameClock::new(start);
        let (time, frame) = clock.sample(start + Duration::from_millis(500));
        assert!((time - 0.5).abs() < 1e-3);
        assert_eq!(frame, 0);
        clock.advance();
        clock.advance();
        assert_eq!(clock.frame(), 2);
        let later = start + Duration::from_secs(3);
        clock.reset(later);
        assert_eq!(clock.sample(later), (0.0, 0));
    }

    #[test]
    fn starting_twice_cancels_previous_loop() {
        let mut schedule = Schedule::new();
        let first = schedule.start("plasma", None);
        assert!(first.replaced.is_none());
        let second = schedule.start("plasma", None);
        let replaced = second.replaced.expect("previous token");
        assert!(replaced.is_cancelled());
        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());
        assert_eq!(schedule.len(), 1);
    }

    #[test]
    fn stop_cancels_and_removes() {
        let mut schedule = Schedule::new();
        let started = schedule.start("a", None);
        assert!(schedule.stop(&"a"));
        assert!(started.token.is_cancelled());
        assert!(!schedule.is_live(&"a"));
        assert!(!schedule.stop(&"a"));
        assert_eq!(
            schedule.token(&"a").unwrap_err(),
            SchedulerError::NotLive("\"a\"".into())
        );
    }

    #[test]
    fn due_respects_fps_cap() {
        let mut schedule = Schedule::new();
        schedule.start("capped", Some(10.0));
        schedule.start("free", Some(0.0));
        let now = Instant::now();
        let mut first = schedule.due(now);
        first.sort();
        assert_eq!(first, ["capped", "free"]);

        let soon = now + Duration::from_millis(50);
        assert_eq!(schedule.due(soon), ["free"]);

        let later = now + Duration::from_millis(150);
        let mut third = schedule.due(later);
        third.sort();
        assert_eq!(third, ["capped", "free"]);
    }

    #[test]
    fn sweep_collects_out_of_band_cancellations() {
        let mut schedule = Schedule::new();
        let started = schedule.start("a", None);
        schedule.start("b", None);
        started.token.cancel();
        assert_eq!(schedule.due(Instant::now()), ["b"]);
        assert_eq!(schedule.sweep(), ["a"]);
        assert_eq!(schedule.len(), 1);
    }
}
