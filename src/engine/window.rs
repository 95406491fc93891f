use crate::model::{AggregateOp, BaselineOp};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

/// (device_id, rule_id)
pub type WindowKey = (Uuid, i64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug)]
struct SampleBuffer {
    window_seconds: i64,
    samples: VecDeque<WindowSample>,
    last_used: u64,
}

impl SampleBuffer {
    fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::seconds(self.window_seconds);
        while self
            .samples
            .front()
            .is_some_and(|sample| sample.timestamp < cutoff)
        {
            self.samples.pop_front();
        }
    }

    fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|sample| sample.value)
    }
}

/// Per-tenant sliding windows of metric samples, one buffer per (device, rule).
///
/// Memory is bounded two ways: buffers whose newest sample has aged out of the
/// window are dropped by [`WindowAggregator::sweep_idle`], and when `max_keys`
/// buffers exist the least recently used one is evicted to admit a new key.
#[derive(Debug)]
pub struct WindowAggregator {
    buffers: HashMap<WindowKey, SampleBuffer>,
    // last_used tick -> key, oldest first
    recency: BTreeMap<u64, WindowKey>,
    max_keys: usize,
    clock: u64,
}

impl WindowAggregator {
    pub fn new(max_keys: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            recency: BTreeMap::new(),
            max_keys: max_keys.max(1),
            clock: 0,
        }
    }

    pub fn append(
        &mut self,
        device_id: Uuid,
        rule_id: i64,
        timestamp: DateTime<Utc>,
        value: f64,
        window_seconds: i64,
    ) {
        self.clock += 1;
        let clock = self.clock;
        let key = (device_id, rule_id);
        if !self.buffers.contains_key(&key) && self.buffers.len() >= self.max_keys {
            self.evict_least_recent();
        }

        let buffer = self.buffers.entry(key).or_insert_with(|| SampleBuffer {
            window_seconds,
            samples: VecDeque::new(),
            last_used: clock,
        });
        self.recency.remove(&buffer.last_used);
        self.recency.insert(clock, key);
        buffer.window_seconds = window_seconds.max(1);
        buffer.last_used = clock;
        buffer.samples.push_back(WindowSample { timestamp, value });
        buffer.evict(timestamp);
    }

    /// `None` until at least two samples are retained; one reading is not an aggregate.
    pub fn aggregate(&self, device_id: Uuid, rule_id: i64, function: AggregateOp) -> Option<f64> {
        let buffer = self.buffers.get(&(device_id, rule_id))?;
        let count = buffer.samples.len();
        if count < 2 {
            return None;
        }
        let value = match function {
            AggregateOp::Avg => buffer.values().sum::<f64>() / count as f64,
            AggregateOp::Sum => buffer.values().sum::<f64>(),
            AggregateOp::Min => buffer.values().fold(f64::INFINITY, f64::min),
            AggregateOp::Max => buffer.values().fold(f64::NEG_INFINITY, f64::max),
            AggregateOp::Count => count as f64,
        };
        Some(value)
    }

    /// Baseline over the retained samples as of `now`, with the same two-sample minimum.
    pub fn baseline(
        &self,
        device_id: Uuid,
        rule_id: i64,
        op: BaselineOp,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let buffer = self.buffers.get(&(device_id, rule_id))?;
        let cutoff = now - ChronoDuration::seconds(buffer.window_seconds);
        let mut values: Vec<f64> = buffer
            .samples
            .iter()
            .filter(|sample| sample.timestamp >= cutoff)
            .map(|sample| sample.value)
            .collect();
        if values.len() < 2 {
            return None;
        }
        match op {
            BaselineOp::Mean => Some(values.iter().sum::<f64>() / values.len() as f64),
            BaselineOp::Median => {
                values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let mid = values.len() / 2;
                if values.len() % 2 == 0 {
                    Some((values[mid - 1] + values[mid]) / 2.0)
                } else {
                    Some(values[mid])
                }
            }
        }
    }

    pub fn samples(&self, device_id: Uuid, rule_id: i64) -> Vec<WindowSample> {
        self.buffers
            .get(&(device_id, rule_id))
            .map(|buffer| buffer.samples.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drops buffers with nothing left inside their window. Returns how many were dropped.
    pub fn sweep_idle(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.buffers.len();
        let recency = &mut self.recency;
        self.buffers.retain(|_, buffer| {
            buffer.evict(now);
            let keep = !buffer.samples.is_empty();
            if !keep {
                recency.remove(&buffer.last_used);
            }
            keep
        });
        before - self.buffers.len()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn evict_least_recent(&mut self) {
        if let Some((_, key)) = self.recency.pop_first() {
            tracing::debug!(device = %key.0, rule = key.1, "evicting least recently used window");
            self.buffers.remove(&key);
        }
    }
}
