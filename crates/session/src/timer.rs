//! Rolling step-duration statistics

use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimerError {
    #[error("no samples recorded")]
    NoSamples,

    #[error("stop() called without a matching start()")]
    NotStarted,
}

/// Steps per second derived from the recorded samples
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub mean: f64,
    pub median: f64,
    pub last: f64,
}

/// Records how long each step takes. `start()`/`stop()` bracket one step.
#[derive(Debug, Clone, Default)]
pub struct SampleTimer {
    samples: Vec<f64>,
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
}

impl SampleTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Record the time since the last `start()`, in seconds.
    pub fn stop(&mut self) -> Result<f64, TimerError> {
        let started_at = self.started_at.take().ok_or(TimerError::NotStarted)?;
        let now = Instant::now();
        self.stopped_at = Some(now);

        let elapsed = now.duration_since(started_at).as_secs_f64();
        self.samples.push(elapsed);
        Ok(elapsed)
    }

    /// Append an externally measured sample, in seconds.
    pub fn record(&mut self, seconds: f64) {
        self.samples.push(seconds);
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn stopped_at(&self) -> Option<Instant> {
        self.stopped_at
    }

    pub fn mean(&self) -> Result<f64, TimerError> {
        if self.samples.is_empty() {
            return Err(TimerError::NoSamples);
        }
        Ok(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn median(&self) -> Result<f64, TimerError> {
        if self.samples.is_empty() {
            return Err(TimerError::NoSamples);
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(f64::total_cmp);

        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Ok((sorted[mid - 1] + sorted[mid]) / 2.0)
        } else {
            Ok(sorted[mid])
        }
    }

    pub fn last(&self) -> Result<f64, TimerError> {
        self.samples.last().copied().ok_or(TimerError::NoSamples)
    }

    pub fn throughput(&self) -> Result<Throughput, TimerError> {
        Ok(Throughput {
            mean: 1.0 / self.mean()?,
            median: 1.0 / self.median()?,
            last: 1.0 / self.last()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(samples: &[f64]) -> SampleTimer {
        let mut timer = SampleTimer::new();
        for &s in samples {
            timer.record(s);
        }
        timer
    }

    #[test]
    fn odd_count_statistics() {
        let timer = timer(&[1.0, 2.0, 3.0]);
        assert_eq!(timer.mean().unwrap(), 2.0);
        assert_eq!(timer.median().unwrap(), 2.0);
        assert_eq!(timer.last().unwrap(), 3.0);
    }

    #[test]
    fn even_count_median_averages_middle_values() {
        let timer = timer(&[4.0, 1.0, 3.0, 2.0]);
        assert_eq!(timer.median().unwrap(), 2.5);
        assert_eq!(timer.mean().unwrap(), 2.5);
    }

    #[test]
    fn empty_timer_has_no_statistics() {
        let timer = SampleTimer::new();
        assert_eq!(timer.mean(), Err(TimerError::NoSamples));
        assert_eq!(timer.median(), Err(TimerError::NoSamples));
        assert_eq!(timer.last(), Err(TimerError::NoSamples));
        assert_eq!(timer.throughput(), Err(TimerError::NoSamples));
    }

    #[test]
    fn stop_without_start_is_rejected() {
        let mut timer = SampleTimer::new();
        assert_eq!(timer.stop(), Err(TimerError::NotStarted));
        assert!(timer.samples().is_empty());
    }

    #[test]
    fn start_stop_appends_elapsed_time() {
        let mut timer = SampleTimer::new();
        timer.start();
        assert!(timer.is_running());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let elapsed = timer.stop().unwrap();

        assert!(elapsed >= 0.002);
        assert!(!timer.is_running());
        assert!(timer.stopped_at().is_some());
        assert_eq!(timer.samples(), &[elapsed]);
    }

    #[test]
    fn throughput_is_inverse_of_duration() {
        let timer = timer(&[0.5, 0.25, 1.0]);
        let throughput = timer.throughput().unwrap();
        assert_eq!(throughput.median, 2.0);
        assert_eq!(throughput.last, 1.0);
        assert!((throughput.mean - 1.0 / (1.75 / 3.0)).abs() < 1e-12);
    }
}
