//! Adaptive per-player send rate
//!
//! The rate (chunks per tick) follows the depth of the player's network queue:
//! it climbs while the queue drains and falls once the queue outgrows the
//! configured maximum. Below one chunk per tick the controller sends a single
//! chunk every `ceil(1 / rate)` ticks.

use crate::constants::rate::*;

#[derive(Debug, Clone)]
pub struct RateController {
    rate: f64,
    max_rate: f64,
    last_queue_size: usize,
    sent_last_tick: bool,
    interval_counter: u32,
}

impl RateController {
    pub fn new(max_rate: f64) -> Self {
        Self {
            rate: 0.0,
            max_rate,
            last_queue_size: 0,
            sent_last_tick: false,
            interval_counter: 0,
        }
    }

    #[inline]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Seed the rate on first attach. Later attaches keep the learned rate.
    pub fn prime(&mut self, max_send_rate: u32) {
        if self.rate == 0.0 {
            self.rate = (max_send_rate / 2).max(1) as f64;
        }
    }

    /// Queue depth beyond which dispatch freezes
    #[inline]
    pub fn queue_limit(&self) -> usize {
        self.max_rate as usize * QUEUE_LIMIT_FACTOR
    }

    /// Rate step for the observed queue depth
    fn step(&self, queue_size: usize) -> f64 {
        let max = self.max_rate;
        let size = queue_size as f64;

        if queue_size == 0 {
            STEP_QUEUE_EMPTY
        } else if size < max / 2.0 {
            STEP_QUEUE_SMALL
        } else if size < max {
            STEP_QUEUE_ACCEPTABLE
        } else if size > max * 2.0 {
            STEP_QUEUE_OVERFLOW
        } else if size > max && queue_size > self.last_queue_size {
            STEP_QUEUE_GROWING
        } else {
            (max - size) * STABLE_GAIN
        }
    }

    /// Number of chunks to dispatch this tick given the current network queue.
    /// Adjusts the rate first when the previous tick dispatched.
    pub fn plan(&mut self, queue_size: usize) -> usize {
        if self.sent_last_tick {
            self.rate = (self.rate + self.step(queue_size)).clamp(MIN_RATE, self.max_rate);
        }

        if queue_size > self.queue_limit() {
            return 0;
        }

        self.last_queue_size = queue_size;
        self.sent_last_tick = true;

        if self.rate >= 1.0 {
            self.rate.round() as usize
        } else {
            let interval = ((1.0 / self.rate).ceil() as u32).max(1);
            self.interval_counter += 1;
            if self.interval_counter >= interval {
                self.interval_counter = 0;
                1
            } else {
                0
            }
        }
    }

    /// Nothing is waiting to be sent; skip the next adjustment
    pub fn idle(&mut self) {
        self.sent_last_tick = false;
    }

    #[cfg(test)]
    fn with_rate(max_rate: f64, rate: f64) -> Self {
        Self {
            rate,
            ..Self::new(max_rate)
        }
    }
}
