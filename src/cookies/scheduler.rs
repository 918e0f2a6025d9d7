//! One-shot delayed task with coalescing semantics.
//!
//! A [`DeferredTask`] is either idle or armed with a single deadline. Arming an
//! already armed task is a no-op, so a burst of triggers results in exactly one
//! run. The owner polls [`DeferredTask::take_due`] from its own loop (the
//! backing-store worker's `select!`, or the manager's `tick()`), which keeps the
//! task on the thread that owns the state it touches.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct DeferredTask {
    delay: Duration,
    deadline: Option<Instant>,
}

impl DeferredTask {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Arms the task relative to `now`. Returns `false` if it was already armed.
    pub fn arm_at(&mut self, now: Instant) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(now + self.delay);
        true
    }

    pub fn arm(&mut self) -> bool {
        self.arm_at(Instant::now())
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Disarms and returns `true` when the deadline has passed at `now`.
    pub fn take_due_at(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn take_due(&mut self) -> bool {
        self.take_due_at(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rearming_is_a_noop() {
        let mut task = DeferredTask::new(Duration::from_millis(100));
        let start = Instant::now();

        assert!(task.arm_at(start));
        let deadline = task.deadline();
        assert!(!task.arm_at(start + Duration::from_millis(50)));
        assert_eq!(task.deadline(), deadline);
    }

    #[test]
    fn fires_once_after_deadline() {
        let mut task = DeferredTask::new(Duration::from_millis(100));
        let start = Instant::now();
        task.arm_at(start);

        assert!(!task.take_due_at(start + Duration::from_millis(99)));
        assert!(task.take_due_at(start + Duration::from_millis(100)));
        assert!(!task.is_armed());
        assert!(!task.take_due_at(start + Duration::from_millis(200)));
    }

    #[test]
    fn disarm_cancels() {
        let mut task = DeferredTask::new(Duration::ZERO);
        task.arm();
        task.disarm();
        assert!(!task.take_due());
    }
}
