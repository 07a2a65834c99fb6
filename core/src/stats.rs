//! Windowed latency statistics.
//!
//! A fixed-size ring of recent samples; the report only considers
//! samples younger than the window (two minutes by default).

use std::time::{Duration, Instant};

#[derive(Clone, Copy)]
struct Sample {
    latency: Duration,
    taken_at: Option<Instant>,
}

pub struct Stats {
    samples: Vec<Sample>,
    index: usize,
    window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AverageAndStddev {
    /// Arithmetic mean, nanoseconds.
    pub average: f64,
    /// Population standard deviation, nanoseconds.
    pub stddev: f64,
}

impl Default for Stats {
    fn default() -> Self {
        Stats::new(20, Duration::from_secs(120))
    }
}

impl Stats {
    pub fn new(size: usize, window: Duration) -> Self {
        Stats {
            samples: vec![
                Sample {
                    latency: Duration::ZERO,
                    taken_at: None,
                };
                size
            ],
            index: 0,
            window,
        }
    }

    /// Record a latency sample, overwriting the oldest slot.
    pub fn add_sample(&mut self, latency: Duration) {
        self.samples[self.index] = Sample {
            latency,
            taken_at: Some(Instant::now()),
        };
        self.index = (self.index + 1) % self.samples.len();
    }

    fn for_each_recent(&self, mut f: impl FnMut(Duration)) {
        let now = Instant::now();
        for sample in &self.samples {
            if let Some(taken_at) = sample.taken_at {
                if now.duration_since(taken_at) <= self.window {
                    f(sample.latency);
                }
            }
        }
    }

    /// Mean and population standard deviation over the samples inside
    /// the window, in nanoseconds. Zero when no sample qualifies.
    pub fn average_and_stddev(&self) -> AverageAndStddev {
        let mut sum = 0.0;
        let mut count = 0u32;
        self.for_each_recent(|latency| {
            sum += latency.as_nanos() as f64;
            count += 1;
        });
        if count == 0 {
            return AverageAndStddev {
                average: 0.0,
                stddev: 0.0,
            };
        }
        let average = sum / count as f64;

        let mut sq_sum = 0.0;
        self.for_each_recent(|latency| {
            let delta = latency.as_nanos() as f64 - average;
            sq_sum += delta * delta;
        });
        AverageAndStddev {
            average,
            stddev: (sq_sum / count as f64).sqrt(),
        }
    }
}
