use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Motion,
    Motionless,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Motion => write!(f, "motion"),
            Phase::Motionless => write!(f, "motionless"),
        }
    }
}

/// Run-length counter for one phase.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    /// Last instant a frame in this phase was analyzed
    pub last_seen: Instant,
    /// Length of the current run, zero while the other phase is active
    pub duration: Duration,
}

impl PhaseTimer {
    fn new(now: Instant) -> Self {
        Self { last_seen: now, duration: Duration::ZERO }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NotifyRequest {
    /// Length of the motion run that preceded this motionless run
    pub motion_duration: Duration,
    pub motionless_for: Duration,
}

/// What the session has to act on after one analyzed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseUpdate {
    pub phase: Phase,
    /// The phase that just ended together with its length
    pub ended: Option<(Phase, Duration)>,
    pub refresh_reference: bool,
    pub notify: Option<NotifyRequest>,
}

/// Motion/motionless timing for a single camera.
///
/// A motion run is measured from the last motionless frame and a motionless
/// run from the last motion frame. Entering one phase zeroes the other
/// phase's duration. `notified` is cleared on every motion frame and set at
/// most once per motionless run, when that run outlasts `notify_after`.
#[derive(Debug, Clone)]
pub struct MotionState {
    phase: Phase,
    motion: PhaseTimer,
    motionless: PhaseTimer,
    notified: bool,
    last_motion_run: Duration,
    update_reference_after: Duration,
    notify_after: Duration,
}

impl MotionState {
    pub fn new(now: Instant, update_reference_after: Duration, notify_after: Duration) -> Self {
        Self {
            phase: Phase::Motionless,
            motion: PhaseTimer::new(now),
            motionless: PhaseTimer::new(now),
            // Nothing to report until motion has been seen once
            notified: true,
            last_motion_run: Duration::ZERO,
            update_reference_after,
            notify_after,
        }
    }

    pub fn observe(&mut self, motion_detected: bool, now: Instant) -> PhaseUpdate {
        if motion_detected {
            self.enter_motion(now)
        } else {
            self.enter_motionless(now)
        }
    }

    fn enter_motion(&mut self, now: Instant) -> PhaseUpdate {
        let ended = if self.phase == Phase::Motionless && !self.motionless.duration.is_zero() {
            Some((Phase::Motionless, self.motionless.duration))
        } else {
            None
        };

        self.motionless.duration = Duration::ZERO;
        self.motion.duration = now.saturating_duration_since(self.motionless.last_seen);
        self.motion.last_seen = now;
        self.notified = false;
        self.phase = Phase::Motion;

        PhaseUpdate {
            phase: Phase::Motion,
            ended,
            refresh_reference: self.motion.duration > self.update_reference_after,
            notify: None,
        }
    }

    fn enter_motionless(&mut self, now: Instant) -> PhaseUpdate {
        let mut ended = None;
        if self.phase == Phase::Motion {
            self.last_motion_run = self.motion.duration;
            if !self.motion.duration.is_zero() {
                ended = Some((Phase::Motion, self.motion.duration));
            }
        }

        self.motion.duration = Duration::ZERO;
        self.motionless.duration = now.saturating_duration_since(self.motion.last_seen);
        self.motionless.last_seen = now;
        self.phase = Phase::Motionless;

        let notify = if self.motionless.duration > self.notify_after && !self.notified {
            self.notified = true;
            Some(NotifyRequest {
                motion_duration: self.last_motion_run,
                motionless_for: self.motionless.duration,
            })
        } else {
            None
        };

        PhaseUpdate {
            phase: Phase::Motionless,
            ended,
            refresh_reference: false,
            notify,
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn motion_duration(&self) -> Duration {
        self.motion.duration
    }

    #[cfg(test)]
    pub fn motionless_duration(&self) -> Duration {
        self.motionless.duration
    }

    #[cfg(test)]
    pub fn notified(&self) -> bool {
        self.notified
    }

    #[cfg(test)]
    pub fn last_motion_run(&self) -> Duration {
        self.last_motion_run
    }

    /// Status line drawn onto the published frame.
    pub fn status_text(&self) -> String {
        match self.phase {
            Phase::Motion => format!("Motion detected for {:.2} seconds", self.motion.duration.as_secs_f64()),
            Phase::Motionless => format!("No Motion detected for {:.2} seconds", self.motionless.duration.as_secs_f64()),
        }
    }
}

/// Lets one frame through after every `skip` discarded frames.
#[derive(Debug, Clone)]
pub struct FrameSampler {
    skip: u32,
    remaining: u32,
}

impl FrameSampler {
    pub fn new(skip: u32) -> Self {
        Self { skip, remaining: skip }
    }

    pub fn accept(&mut self) -> bool {
        if self.remaining > 0 {
            self.remaining -= 1;
            false
        } else {
            self.remaining = self.skip;
            true
        }
    }
}

pub fn format_seconds(duration: Duration) -> String {
    format!("{:.2} seconds", duration.as_secs_f64())
}
