// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Hardware latency measurement per network.
//!
//! Input streams stamp the start of every frame, output streams stamp its
//! end. A frame is measured once every output of the network reported it;
//! its latency is the latest end stamp minus the start stamp.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{AccelError, Result};

pub type LatencyMeterPtr = Arc<LatencyMeter>;
pub type LatencyMetersMap = HashMap<String, LatencyMeterPtr>;

/// Upper bound on unmatched stamps kept per channel.
const MAX_PENDING_SAMPLES: usize = 1024;

#[derive(Debug, Default)]
struct LatencyState {
    start_samples: VecDeque<Instant>,
    end_samples: HashMap<String, VecDeque<Instant>>,
    latency_sum: Duration,
    latency_count: u32,
}

#[derive(Debug)]
pub struct LatencyMeter {
    output_names: BTreeSet<String>,
    state: Mutex<LatencyState>,
}

impl LatencyMeter {
    pub fn new(output_names: impl IntoIterator<Item = String>) -> Self {
        let output_names: BTreeSet<String> = output_names.into_iter().collect();
        let end_samples = output_names
            .iter()
            .map(|name| (name.clone(), VecDeque::new()))
            .collect();
        Self {
            output_names,
            state: Mutex::new(LatencyState {
                end_samples,
                ..Default::default()
            }),
        }
    }

    pub fn add_start_sample(&self, timestamp: Instant) {
        let mut state = self.state.lock();
        if state.start_samples.len() >= MAX_PENDING_SAMPLES {
            state.start_samples.pop_front();
        }
        state.start_samples.push_back(timestamp);
    }

    pub fn add_end_sample(&self, output_name: &str, timestamp: Instant) {
        let mut state = self.state.lock();
        let Some(samples) = state.end_samples.get_mut(output_name) else {
            tracing::debug!(stream = %output_name, "Ignoring end sample for unmeasured output");
            return;
        };
        if samples.len() >= MAX_PENDING_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(timestamp);
        Self::collect_complete_frames(&mut state);
    }

    fn collect_complete_frames(state: &mut LatencyState) {
        loop {
            if state.start_samples.is_empty()
                || state.end_samples.values().any(|samples| samples.is_empty())
            {
                return;
            }
            let Some(start) = state.start_samples.pop_front() else {
                return;
            };
            let end = state
                .end_samples
                .values_mut()
                .filter_map(|samples| samples.pop_front())
                .max()
                .unwrap_or(start);
            state.latency_sum += end.saturating_duration_since(start);
            state.latency_count += 1;
        }
    }

    /// Average latency of all measured frames.
    ///
    /// Returns `NotAvailable` when no frame completed since the last clear.
    pub fn get_latency(&self, clear: bool) -> Result<Duration> {
        let mut state = self.state.lock();
        if state.latency_count == 0 {
            return Err(AccelError::NotAvailable(
                "no latency measurement available yet".into(),
            ));
        }
        let latency = state.latency_sum / state.latency_count;
        if clear {
            state.latency_sum = Duration::ZERO;
            state.latency_count = 0;
        }
        Ok(latency)
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.output_names.iter().map(String::as_str)
    }
}
