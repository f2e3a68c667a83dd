use parking_lot::Mutex;
use tracing::warn;

pub const DEFAULT_SENTINEL: f64 = 0.0;
pub const DEFAULT_WARNING_PERIOD: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonFinite {
    Nan,
    Inf,
}

#[derive(Debug)]
struct SentinelPolicy {
    value: f64,
    warn_period: u64,
    // None until the first occurrence, so the very first one always warns.
    since_warning: Option<u64>,
    warnings: u64,
    occurrences: u64,
}

impl SentinelPolicy {
    fn new(value: f64, warn_period: u64) -> Self {
        Self {
            value,
            warn_period,
            since_warning: None,
            warnings: 0,
            occurrences: 0,
        }
    }

    /// Records one occurrence; returns true when it must be reported.
    fn record(&mut self) -> bool {
        self.occurrences += 1;
        let count = self.since_warning.map_or(u64::MAX, |c| c.saturating_add(1));
        if count >= self.warn_period {
            self.since_warning = Some(0);
            self.warnings += 1;
            true
        } else {
            self.since_warning = Some(count);
            false
        }
    }
}

/// Replaces NaN and infinite values with configurable sentinels and
/// rate-limits the warnings about them.
///
/// One instance is shared by every event built from the same reporting
/// state, so the cadence is global across metrics.
#[derive(Debug)]
pub struct NumericSanitizer {
    nan: Mutex<SentinelPolicy>,
    inf: Mutex<SentinelPolicy>,
}

impl Default for NumericSanitizer {
    fn default() -> Self {
        Self::new(
            (DEFAULT_SENTINEL, DEFAULT_WARNING_PERIOD),
            (DEFAULT_SENTINEL, DEFAULT_WARNING_PERIOD),
        )
    }
}

impl NumericSanitizer {
    pub fn new(nan: (f64, u64), inf: (f64, u64)) -> Self {
        Self {
            nan: Mutex::new(SentinelPolicy::new(nan.0, nan.1)),
            inf: Mutex::new(SentinelPolicy::new(inf.0, inf.1)),
        }
    }

    pub fn set_nan_value(&self, value: f64, warn_period: u64) {
        let mut policy = self.nan.lock();
        policy.value = value;
        policy.warn_period = warn_period;
    }

    pub fn set_inf_value(&self, value: f64, warn_period: u64) {
        let mut policy = self.inf.lock();
        policy.value = value;
        policy.warn_period = warn_period;
    }

    pub fn sanitize(&self, value: f64) -> f64 {
        if value.is_nan() {
            let mut policy = self.nan.lock();
            if policy.record() {
                warn!(
                    replacement = policy.value,
                    occurrences = policy.occurrences,
                    "NaN value encountered, reporting it as {}",
                    policy.value
                );
            }
            policy.value
        } else if value.is_infinite() {
            let mut policy = self.inf.lock();
            if policy.record() {
                warn!(
                    replacement = policy.value,
                    occurrences = policy.occurrences,
                    "inf value encountered, reporting it as {}",
                    policy.value
                );
            }
            policy.value
        } else {
            value
        }
    }

    pub fn sanitize_all(&self, values: &[f64]) -> Vec<f64> {
        values.iter().map(|v| self.sanitize(*v)).collect()
    }

    pub fn warnings(&self, kind: NonFinite) -> u64 {
        match kind {
            NonFinite::Nan => self.nan.lock().warnings,
            NonFinite::Inf => self.inf.lock().warnings,
        }
    }

    pub fn occurrences(&self, kind: NonFinite) -> u64 {
        match kind {
            NonFinite::Nan => self.nan.lock().occurrences,
            NonFinite::Inf => self.inf.lock().occurrences,
        }
    }
}
