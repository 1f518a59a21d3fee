// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;

use parking_lot::Mutex;

pub type AccumulatorPtr = Arc<FullAccumulator>;

/// Snapshot of an accumulator's statistics.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AccumulatorResults {
    pub count: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    /// Sample variance; needs at least two data points.
    pub var: Option<f64>,
}

#[derive(Debug, Default)]
struct AccumulatorState {
    count: usize,
    min: f64,
    max: f64,
    mean: f64,
    m2: f64,
}

/// Rolling statistics over `f64` samples (Welford's online algorithm).
#[derive(Debug)]
pub struct FullAccumulator {
    name: String,
    state: Mutex<AccumulatorState>,
}

impl FullAccumulator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(AccumulatorState::default()),
        }
    }

    pub fn new_shared(name: impl Into<String>) -> AccumulatorPtr {
        Arc::new(Self::new(name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_data_point(&self, value: f64) {
        let mut state = self.state.lock();
        if state.count == 0 {
            state.min = value;
            state.max = value;
        } else {
            state.min = state.min.min(value);
            state.max = state.max.max(value);
        }
        state.count += 1;
        let delta = value - state.mean;
        state.mean += delta / state.count as f64;
        state.m2 += delta * (value - state.mean);
    }

    pub fn get(&self) -> AccumulatorResults {
        let state = self.state.lock();
        if state.count == 0 {
            return AccumulatorResults::default();
        }
        AccumulatorResults {
            count: state.count,
            min: Some(state.min),
            max: Some(state.max),
            mean: Some(state.mean),
            var: (state.count > 1).then(|| state.m2 / (state.count - 1) as f64),
        }
    }

    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    pub fn clear(&self) {
        *self.state.lock() = AccumulatorState::default();
    }
}
