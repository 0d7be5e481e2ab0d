use corvus_core::config::LauncherConfig;
use rand::Rng;
use std::time::Duration;

/// Poll cadence of a single job.
///
/// A fixed interval with +/- jitter. Jobs older than `backoff_after` are polled
/// with an interval that doubles for every further `backoff_after`, up to `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSchedule {
    pub base: Duration,
    pub jitter: f64,
    pub backoff_after: Duration,
    pub max: Duration,
}

impl PollSchedule {
    pub fn from_config(config: &LauncherConfig) -> Self {
        Self {
            base: config.poll_interval,
            jitter: config.poll_jitter,
            backoff_after: config.poll_backoff_after,
            max: config.max_poll_interval.max(config.poll_interval),
        }
    }

    /// Interval before jitter for a job submitted `age` ago.
    pub fn interval(&self, age: Duration) -> Duration {
        if self.backoff_after.is_zero() || age < self.backoff_after {
            return self.base;
        }
        let periods = (age.as_secs_f64() / self.backoff_after.as_secs_f64()).floor() as u32;
        self.base
            .saturating_mul(1u32 << periods.min(16))
            .min(self.max)
    }

    pub fn next_delay(&self, age: Duration) -> Duration {
        let interval = self.interval(age);
        if self.jitter <= 0.0 {
            return interval;
        }
        let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
        interval.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(jitter: f64) -> PollSchedule {
        PollSchedule {
            base: Duration::from_secs(10),
            jitter,
            backoff_after: Duration::from_secs(600),
            max: Duration::from_secs(60),
        }
    }

    #[test]
    fn interval_backs_off_for_old_jobs() {
        let s = schedule(0.0);
        assert_eq!(s.interval(Duration::from_secs(5)), Duration::from_secs(10));
        assert_eq!(s.interval(Duration::from_secs(599)), Duration::from_secs(10));
        assert_eq!(s.interval(Duration::from_secs(600)), Duration::from_secs(20));
        assert_eq!(s.interval(Duration::from_secs(1200)), Duration::from_secs(40));
        assert_eq!(s.interval(Duration::from_secs(86_400)), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let s = schedule(0.2);
        for _ in 0..200 {
            let d = s.next_delay(Duration::ZERO);
            assert!(d >= Duration::from_secs(8) && d <= Duration::from_secs(12), "{d:?}");
        }
    }

    #[test]
    fn zero_backoff_after_disables_backoff() {
        let s = PollSchedule {
            backoff_after: Duration::ZERO,
            ..schedule(0.0)
        };
        assert_eq!(s.interval(Duration::from_secs(100_000)), Duration::from_secs(10));
    }
}
