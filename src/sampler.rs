use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Accepts at most one frame per `interval`.
///
/// The pipeline keeps one sampler per throttle: a slow one gating commentary
/// requests and a fast one gating overlay refreshes. They never share state.
#[derive(Debug, Clone)]
pub struct FrameSampler {
    name: &'static str,
    interval: Duration,
    last_processed: Option<Instant>,
    accepted: u64,
    rejected: u64,
}

impl FrameSampler {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            last_processed: None,
            accepted: 0,
            rejected: 0,
        }
    }

    /// Returns true and records `now` if the interval has elapsed since the
    /// last accepted frame. The first frame is always accepted.
    pub fn try_accept(&mut self, now: Instant) -> bool {
        let due = match self.last_processed {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };

        if due {
            self.last_processed = Some(now);
            self.accepted += 1;
            debug!("{} sampler accepted frame #{}", self.name, self.accepted);
        } else {
            self.rejected += 1;
        }
        due
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_first_frame_then_throttles() {
        let start = Instant::now();
        let mut sampler = FrameSampler::new("commentary", Duration::from_secs(10));

        assert!(sampler.try_accept(start));
        assert!(!sampler.try_accept(start + Duration::from_millis(100)));
        assert!(!sampler.try_accept(start + Duration::from_millis(9_999)));
        assert!(sampler.try_accept(start + Duration::from_secs(10)));
        assert!(!sampler.try_accept(start + Duration::from_secs(15)));
        assert!(sampler.try_accept(start + Duration::from_secs(20)));

        assert_eq!(sampler.accepted(), 3);
        assert_eq!(sampler.rejected(), 3);
    }

    #[test]
    fn rejected_frames_do_not_move_the_window() {
        let start = Instant::now();
        let mut sampler = FrameSampler::new("overlay", Duration::from_millis(150));

        assert!(sampler.try_accept(start));
        for ms in (10..150).step_by(10) {
            assert!(!sampler.try_accept(start + Duration::from_millis(ms)));
        }
        assert!(sampler.try_accept(start + Duration::from_millis(150)));
    }
}
