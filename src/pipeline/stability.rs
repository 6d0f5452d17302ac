//! Stability instrumentation: decision counters shared by the pipeline.
//!
//! A `StabilityStats` is created by the owner of a conversation (or a test)
//! and passed by reference into every component call. Counters are a side
//! channel only; nothing reads them to make a decision.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counter names, one per observable decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    /// JSON-shaped reply passed the pre-check and a parse was attempted.
    ParseAttempts,
    /// Reply failed the pre-check and was treated as plain text.
    ParseSkippedNonJson,
    /// Neither strict parse nor the robust extractor found a display field.
    ParseFailed,
    /// Redelivery of a known message absorbed into its existing slot.
    DuplicateBlocked,
    /// A merged sequence contained two entries with the same key.
    DuplicateOccurred,
    /// Message rejected by the render-safety gate.
    UnsafeSkipped,
    /// Composing placeholder dropped before reaching the sequence.
    PlaceholderDropped,
    /// A placeholder was found in a merged sequence.
    PlaceholderBecameMessage,
    /// Refetch-and-replace attempt issued.
    RefetchTriggered,
}

impl Counter {
    pub const ALL: [Counter; 9] = [
        Counter::ParseAttempts,
        Counter::ParseSkippedNonJson,
        Counter::ParseFailed,
        Counter::DuplicateBlocked,
        Counter::DuplicateOccurred,
        Counter::UnsafeSkipped,
        Counter::PlaceholderDropped,
        Counter::PlaceholderBecameMessage,
        Counter::RefetchTriggered,
    ];
}

#[derive(Debug, Default)]
pub struct StabilityStats {
    parse_attempts: AtomicU64,
    parse_skipped_non_json: AtomicU64,
    parse_failed: AtomicU64,
    duplicate_blocked: AtomicU64,
    duplicate_occurred: AtomicU64,
    unsafe_skipped: AtomicU64,
    placeholder_dropped: AtomicU64,
    placeholder_became_message: AtomicU64,
    refetch_triggered: AtomicU64,
}

impl StabilityStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.slot(counter).fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.slot(counter).load(Ordering::Relaxed)
    }

    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::ParseAttempts => &self.parse_attempts,
            Counter::ParseSkippedNonJson => &self.parse_skipped_non_json,
            Counter::ParseFailed => &self.parse_failed,
            Counter::DuplicateBlocked => &self.duplicate_blocked,
            Counter::DuplicateOccurred => &self.duplicate_occurred,
            Counter::UnsafeSkipped => &self.unsafe_skipped,
            Counter::PlaceholderDropped => &self.placeholder_dropped,
            Counter::PlaceholderBecameMessage => &self.placeholder_became_message,
            Counter::RefetchTriggered => &self.refetch_triggered,
        }
    }

    pub fn snapshot(&self) -> StabilitySnapshot {
        StabilitySnapshot {
            parse_attempts: self.get(Counter::ParseAttempts),
            parse_skipped_non_json: self.get(Counter::ParseSkippedNonJson),
            parse_failed: self.get(Counter::ParseFailed),
            duplicate_blocked: self.get(Counter::DuplicateBlocked),
            duplicate_occurred: self.get(Counter::DuplicateOccurred),
            unsafe_skipped: self.get(Counter::UnsafeSkipped),
            placeholder_dropped: self.get(Counter::PlaceholderDropped),
            placeholder_became_message: self.get(Counter::PlaceholderBecameMessage),
            refetch_triggered: self.get(Counter::RefetchTriggered),
        }
    }

    /// Pass/fail summary against the fixed stability thresholds.
    pub fn report(&self) -> StabilityReport {
        let snapshot = self.snapshot();
        let checks = vec![
            ThresholdCheck::must_be_zero("duplicate_occurred", snapshot.duplicate_occurred),
            ThresholdCheck::must_be_zero(
                "placeholder_became_message",
                snapshot.placeholder_became_message,
            ),
        ];
        let passed = checks.iter().all(|c| c.passed);
        if !passed {
            tracing::warn!(
                duplicate_occurred = snapshot.duplicate_occurred,
                placeholder_became_message = snapshot.placeholder_became_message,
                "Stability report failed"
            );
        }
        StabilityReport {
            passed,
            checks,
            counters: snapshot,
        }
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StabilitySnapshot {
    pub parse_attempts: u64,
    pub parse_skipped_non_json: u64,
    pub parse_failed: u64,
    pub duplicate_blocked: u64,
    pub duplicate_occurred: u64,
    pub unsafe_skipped: u64,
    pub placeholder_dropped: u64,
    pub placeholder_became_message: u64,
    pub refetch_triggered: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThresholdCheck {
    pub counter: &'static str,
    pub value: u64,
    pub max: u64,
    pub passed: bool,
}

impl ThresholdCheck {
    fn must_be_zero(counter: &'static str, value: u64) -> Self {
        Self {
            counter,
            value,
            max: 0,
            passed: value == 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StabilityReport {
    pub passed: bool,
    pub checks: Vec<ThresholdCheck>,
    pub counters: StabilitySnapshot,
}

impl fmt::Display for StabilityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "stability: {}", if self.passed { "PASS" } else { "FAIL" })?;
        for check in &self.checks {
            writeln!(
                f,
                "  [{}] {} = {} (max {})",
                if check.passed { "ok" } else { "!!" },
                check.counter,
                check.value,
                check.max
            )?;
        }
        let c = &self.counters;
        write!(
            f,
            "  parse: {} attempted, {} skipped, {} failed | duplicates blocked: {} | unsafe skipped: {} | placeholders dropped: {} | refetches: {}",
            c.parse_attempts,
            c.parse_skipped_non_json,
            c.parse_failed,
            c.duplicate_blocked,
            c.unsafe_skipped,
            c.placeholder_dropped,
            c.refetch_triggered
        )
    }
}
