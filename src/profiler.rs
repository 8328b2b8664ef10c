// CPU profiler
//
// Scoped timers push one sample per scope into a shared list. `report` logs
// the average duration per context and clears the list.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSample {
    pub context: &'static str,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSummary {
    pub context: &'static str,
    pub samples: usize,
    pub average_ms: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Profiler {
    samples: Arc<Mutex<Vec<ProfileSample>>>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time until the returned guard is dropped.
    pub fn scope(&self, context: &'static str) -> ProfileScope {
        ProfileScope {
            profiler: self.clone(),
            context,
            start: Instant::now(),
        }
    }

    pub fn record(&self, context: &'static str, duration: Duration) {
        self.samples.lock().push(ProfileSample { context, duration });
    }

    /// Average per context, in first-seen order.
    pub fn summarize(&self) -> Vec<ProfileSummary> {
        let samples = self.samples.lock();
        let mut totals: Vec<(&'static str, usize, Duration)> = Vec::new();
        for sample in samples.iter() {
            match totals.iter_mut().find(|(context, _, _)| *context == sample.context) {
                Some((_, count, total)) => {
                    *count += 1;
                    *total += sample.duration;
                }
                None => totals.push((sample.context, 1, sample.duration)),
            }
        }
        totals
            .into_iter()
            .map(|(context, samples, total)| ProfileSummary {
                context,
                samples,
                average_ms: total.as_secs_f64() * 1000.0 / samples as f64,
            })
            .collect()
    }

    /// Log the averages and start over.
    pub fn report(&self) -> Vec<ProfileSummary> {
        let summary = self.summarize();
        for entry in &summary {
            log::info!(
                "[profile] {:<24} {:>8.3} ms avg over {} samples",
                entry.context,
                entry.average_ms,
                entry.samples
            );
        }
        self.clear();
        summary
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }
}

pub struct ProfileScope {
    profiler: Profiler,
    context: &'static str,
    start: Instant,
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        self.profiler.record(self.context, self.start.elapsed());
    }
}
