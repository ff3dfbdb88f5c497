//! Rolling latency and failure-rate windows kept by each queue route.

use std::collections::VecDeque;
use std::time::Duration;

use wp_config::QueueSettings;

/// Fixed-size window of samples with a running sum.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
        }
    }

    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            if let Some(evicted) = self.samples.pop_front() {
                self.sum -= evicted;
            }
        }
        self.samples.push_back(sample);
        self.sum += sample;
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            (self.sum / self.samples.len() as f64).max(0.0)
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Per-route telemetry: request latency (time spent waiting), response
/// latency (time spent processing) and failure rate.
#[derive(Debug, Clone)]
pub struct QueueTelemetry {
    request_latency: RollingWindow,
    response_latency: RollingWindow,
    failures: RollingWindow,
}

impl QueueTelemetry {
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            request_latency: RollingWindow::new(settings.latency_sample_size),
            response_latency: RollingWindow::new(settings.latency_sample_size),
            failures: RollingWindow::new(settings.failure_sample_size),
        }
    }

    pub fn record_request(&mut self, waited: Duration) {
        self.request_latency.push(waited.as_secs_f64());
    }

    pub fn record_response(&mut self, elapsed: Duration, failed: bool) {
        self.response_latency.push(elapsed.as_secs_f64());
        self.failures.push(if failed { 1.0 } else { 0.0 });
    }

    pub fn average_request_latency(&self) -> Duration {
        Duration::from_secs_f64(self.request_latency.average())
    }

    pub fn average_response_latency(&self) -> Duration {
        Duration::from_secs_f64(self.response_latency.average())
    }

    pub fn failure_rate(&self) -> f64 {
        self.failures.average()
    }
}

impl Default for QueueTelemetry {
    fn default() -> Self {
        Self::new(&QueueSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = RollingWindow::new(3);
        for sample in [1.0, 2.0, 3.0, 10.0] {
            window.push(sample);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.average(), 5.0);
    }

    #[test]
    fn test_failure_rate() {
        let mut telemetry = QueueTelemetry::new(&QueueSettings {
            latency_sample_size: 2,
            failure_sample_size: 4,
        });
        assert_eq!(telemetry.failure_rate(), 0.0);
        telemetry.record_response(Duration::from_millis(10), true);
        telemetry.record_response(Duration::from_millis(30), false);
        telemetry.record_response(Duration::from_millis(50), false);
        telemetry.record_response(Duration::from_millis(70), true);
        assert_eq!(telemetry.failure_rate(), 0.5);
        let average = telemetry.average_response_latency();
        assert!((average.as_secs_f64() - 0.060).abs() < 1e-9);
    }
}
