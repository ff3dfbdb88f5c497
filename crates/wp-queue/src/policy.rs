//! Queuing policies: may a pool add another worker route?

use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::System;
use tracing::debug;
use wp_common::{PolicyDecision, PoolState};
use wp_config::{QueuingPolicyKind, QueuingPolicySettings};

use crate::telemetry::RollingWindow;

pub trait QueuingPolicy: Send + Sync {
    fn allow_queue_creation(&self, state: &PoolState) -> PolicyDecision;
}

/// Fixed bounds on the number of routes.
#[derive(Debug, Clone)]
pub struct StaticQueuingPolicy {
    min_queue_count: usize,
    max_queue_count: usize,
}

impl StaticQueuingPolicy {
    pub fn new(min_queue_count: usize, max_queue_count: usize) -> Self {
        Self {
            min_queue_count,
            max_queue_count: max_queue_count.max(min_queue_count),
        }
    }

    /// Single worker: used for stages that must stay sequential.
    pub fn single() -> Self {
        Self::new(1, 1)
    }

    pub fn max_queue_count(&self) -> usize {
        self.max_queue_count
    }

    fn bounds_decision(&self, state: &PoolState) -> Option<PolicyDecision> {
        if state.queue_count < self.min_queue_count {
            return Some(PolicyDecision::approve(format!(
                "{} queue(s) below minimum {}",
                state.queue_count, self.min_queue_count
            )));
        }
        if state.queue_count >= self.max_queue_count {
            return Some(PolicyDecision::deny(format!(
                "{} queue(s) at maximum {}",
                state.queue_count, self.max_queue_count
            )));
        }
        None
    }
}

impl Default for StaticQueuingPolicy {
    fn default() -> Self {
        let settings = QueuingPolicySettings::default();
        Self::new(settings.min_queue_count, settings.effective_max_queue_count())
    }
}

impl QueuingPolicy for StaticQueuingPolicy {
    fn allow_queue_creation(&self, state: &PoolState) -> PolicyDecision {
        self.bounds_decision(state)
            .unwrap_or_else(|| PolicyDecision::approve("within queue bounds"))
    }
}

/// Source of host CPU utilisation, in percent.
pub trait CpuSampler: Send + Sync {
    fn sample(&self) -> f32;
}

pub struct SystemCpuSampler {
    system: Mutex<System>,
}

impl SystemCpuSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemCpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSampler for SystemCpuSampler {
    fn sample(&self) -> f32 {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.global_cpu_info().cpu_usage()
    }
}

/// Static bounds plus back-pressure from CPU load and pool latency.
pub struct ResourceQueuingPolicy {
    bounds: StaticQueuingPolicy,
    cpu_threshold_percent: f32,
    sampler: Arc<dyn CpuSampler>,
    samples: Mutex<RollingWindow>,
}

impl ResourceQueuingPolicy {
    pub fn new(
        bounds: StaticQueuingPolicy,
        cpu_threshold_percent: f32,
        sample_size: usize,
        sampler: Arc<dyn CpuSampler>,
    ) -> Self {
        Self {
            bounds,
            cpu_threshold_percent,
            sampler,
            samples: Mutex::new(RollingWindow::new(sample_size)),
        }
    }

    pub fn average_cpu(&self) -> f32 {
        self.samples.lock().average() as f32
    }
}

impl QueuingPolicy for ResourceQueuingPolicy {
    fn allow_queue_creation(&self, state: &PoolState) -> PolicyDecision {
        if let Some(decision) = self.bounds.bounds_decision(state) {
            return decision;
        }

        let sample = self.sampler.sample();
        let average = {
            let mut samples = self.samples.lock();
            samples.push(f64::from(sample));
            samples.average() as f32
        };

        if average > self.cpu_threshold_percent {
            debug!(pool = %state.name, cpu = average, threshold = self.cpu_threshold_percent, "CPU above threshold");
            return PolicyDecision::deny(format!(
                "average CPU {average:.1}% above {:.1}%",
                self.cpu_threshold_percent
            ));
        }

        if state.is_falling_behind() {
            return PolicyDecision::deny("response latency is not beating request latency");
        }

        PolicyDecision::approve("resources available")
    }
}

pub fn queuing_policy_from_settings(settings: &QueuingPolicySettings) -> Arc<dyn QueuingPolicy> {
    let bounds = StaticQueuingPolicy::new(
        settings.min_queue_count,
        settings.effective_max_queue_count(),
    );
    match settings.kind {
        QueuingPolicyKind::Static => Arc::new(bounds),
        QueuingPolicyKind::Resource => Arc::new(ResourceQueuingPolicy::new(
            bounds,
            settings.cpu_threshold_percent,
            settings.cpu_sample_size,
            Arc::new(SystemCpuSampler::new()),
        )),
    }
}
