//! Skipping of queues that keep coming back empty.
//!
//! Each consumer loop owns a [`CooloffTracker`]. A queue that yields
//! `threshold` empty claims in a row is skipped for `period`. The tracker is
//! bounded: past `max_states_size` entries the least recently touched one is
//! evicted.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Configuration for empty-queue cooloff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CooloffConfig {
    pub enabled: bool,
    /// Consecutive empty claims before a queue cools off.
    pub threshold: u32,
    /// How long a cooled-off queue is skipped.
    pub period: Duration,
    /// Maximum queues tracked per consumer.
    pub max_states_size: usize,
}

impl Default for CooloffConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 10,
            period: Duration::from_secs(10),
            max_states_size: 1000,
        }
    }
}

impl CooloffConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_max_states_size(mut self, size: usize) -> Self {
        self.max_states_size = size.max(1);
        self
    }
}

#[derive(Debug, Clone)]
struct QueueState {
    empty_streak: u32,
    cooling_until: Option<Instant>,
    touched: u64,
}

/// Per-consumer empty-claim counters and cooloff deadlines.
#[derive(Debug)]
pub struct CooloffTracker {
    config: CooloffConfig,
    states: HashMap<String, QueueState>,
    clock: u64,
}

impl CooloffTracker {
    pub fn new(config: CooloffConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
            clock: 0,
        }
    }

    /// Whether `queue_id` should be skipped at `now`. An expired cooloff is
    /// cleared.
    pub fn is_cooling_off(&mut self, queue_id: &str, now: Instant) -> bool {
        if !self.config.enabled {
            return false;
        }
        let Some(state) = self.states.get_mut(queue_id) else {
            return false;
        };
        match state.cooling_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.states.remove(queue_id);
                false
            }
            None => false,
        }
    }

    /// Counts an empty claim; returns true if the queue just entered cooloff.
    pub fn record_empty(&mut self, queue_id: &str, now: Instant) -> bool {
        if !self.config.enabled {
            return false;
        }
        self.clock += 1;
        let touched = self.clock;

        let state = self
            .states
            .entry(queue_id.to_string())
            .or_insert(QueueState {
                empty_streak: 0,
                cooling_until: None,
                touched,
            });
        state.touched = touched;
        state.empty_streak += 1;

        let entered = state.cooling_until.is_none() && state.empty_streak >= self.config.threshold;
        if entered {
            state.cooling_until = Some(now + self.config.period);
        }

        self.evict_overflow();
        entered
    }

    /// A queue delivered work: forget its streak.
    pub fn record_success(&mut self, queue_id: &str) {
        self.states.remove(queue_id);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn evict_overflow(&mut self) {
        while self.states.len() > self.config.max_states_size {
            let oldest = self
                .states
                .iter()
                .min_by_key(|(_, state)| state.touched)
                .map(|(queue_id, _)| queue_id.clone());
            match oldest {
                Some(queue_id) => {
                    self.states.remove(&queue_id);
                }
                None => break,
            }
        }
    }
}
