//! Structured telemetry for contract violations inside the netplay core.
//!
//! Every component reports unexpected-but-survivable conditions (an invalid
//! phase transition, a remote input batch that arrived too late, a fragment
//! that could not be reassembled) as a [`NetplayViolation`] through
//! [`report_violation!`](crate::report_violation), which hands it to the
//! [`TracingObserver`]. The other observers are for tests and tooling that
//! want violations as values.
//!
//! ```
//! use rollback_netplay::telemetry::{CollectingObserver, ViolationKind, ViolationObserver,
//!     NetplayViolation, ViolationSeverity};
//!
//! let observer = CollectingObserver::new();
//! observer.on_violation(&NetplayViolation::new(
//!     ViolationSeverity::Warning,
//!     ViolationKind::PhaseTransition,
//!     "InGame -> Loading rejected",
//!     "sync_manager.rs:1",
//! ));
//! assert!(observer.has_violation(ViolationKind::PhaseTransition));
//! ```

use crate::IndexedFrame;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Severity of a violation, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but recoverable; the operation continued with a fallback.
    Warning,
    /// Degraded behavior is possible (a message was dropped, a request ignored).
    Error,
    /// An internal invariant is broken and state may be corrupt.
    Critical,
}

impl ViolationSeverity {
    /// Returns a string representation suitable for logging labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subsystem in which a violation was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Input timeline misuse, e.g. a stale batch for a pruned epoch.
    InputTimeline,
    /// Go-Back-N channel anomalies: undecodable fragments, unexpected acks.
    ReliableChannel,
    /// Snapshot save/load problems.
    SnapshotStore,
    /// A phase transition outside the transition table.
    PhaseTransition,
    /// Spectator fan-out anomalies.
    Spectator,
    /// Invalid configuration values.
    Configuration,
    /// A condition that indicates a bug in this crate.
    InternalError,
    /// A runtime invariant check failed.
    Invariant,
}

impl ViolationKind {
    /// Returns a string representation suitable for logging labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InputTimeline => "input_timeline",
            Self::ReliableChannel => "reliable_channel",
            Self::SnapshotStore => "snapshot_store",
            Self::PhaseTransition => "phase_transition",
            Self::Spectator => "spectator",
            Self::Configuration => "configuration",
            Self::InternalError => "internal_error",
            Self::Invariant => "invariant",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One survivable contract breach, as reported by a component.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NetplayViolation {
    /// How bad it is.
    pub severity: ViolationSeverity,
    /// Which component noticed.
    pub kind: ViolationKind,
    /// What happened.
    pub message: String,
    /// `file:line` of the report.
    pub location: &'static str,
    /// Netplay position the breach relates to, if the reporter knew it.
    pub at: Option<IndexedFrame>,
    /// Extra fields, sorted by key.
    pub context: BTreeMap<String, String>,
}

impl NetplayViolation {
    /// Creates a violation with no position and no context.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            at: None,
            context: BTreeMap::new(),
        }
    }

    /// Attaches the netplay position.
    #[must_use]
    pub fn at(mut self, at: IndexedFrame) -> Self {
        self.at = Some(at);
        self
    }

    /// Attaches one context field. A repeated key keeps the last value.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    fn context_string(&self) -> String {
        self.context
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// JSON form for log shipping.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    /// Indented JSON form.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json_pretty(&self) -> Option<String> {
        serde_json::to_string_pretty(self).ok()
    }
}

impl std::fmt::Display for NetplayViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.severity, self.kind)?;
        if let Some(at) = self.at {
            write!(f, " @{at}")?;
        }
        write!(f, ": {} ({})", self.message, self.location)?;
        if !self.context.is_empty() {
            write!(f, " {{{}}}", self.context_string())?;
        }
        Ok(())
    }
}

/// Sink for reported violations.
pub trait ViolationObserver {
    /// Runs inside the tick that noticed the breach, so it must not block.
    fn on_violation(&self, violation: &NetplayViolation);
}

/// Turns violations into `tracing` events.
///
/// Warnings are logged at `WARN`; errors and critical breaches at `ERROR`. The
/// epoch and frame become separate fields so they can be filtered on.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &NetplayViolation) {
        let kind = violation.kind.as_str();
        let location = violation.location;
        let index = violation.at.map(|at| at.index);
        let frame = violation.at.map(|at| at.frame);
        let context = violation.context_string();
        if violation.severity == ViolationSeverity::Warning {
            tracing::warn!(kind, location, ?index, ?frame, %context, "{}", violation.message);
        } else {
            tracing::error!(
                kind,
                location,
                severity = violation.severity.as_str(),
                ?index,
                ?frame,
                %context,
                "{}",
                violation.message
            );
        }
    }
}

/// Keeps every violation it sees. Meant for tests and soak runs.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    seen: Mutex<Vec<NetplayViolation>>,
}

impl CollectingObserver {
    /// Creates an empty observer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything collected so far, oldest first.
    #[must_use]
    pub fn violations(&self) -> Vec<NetplayViolation> {
        self.seen.lock().clone()
    }

    /// Number of violations collected.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    /// Returns `true` before the first violation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    /// Returns `true` if any collected violation is of `kind`.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.count(kind) > 0
    }

    /// Number of collected violations of `kind`.
    #[must_use]
    pub fn count(&self, kind: ViolationKind) -> usize {
        self.seen.lock().iter().filter(|v| v.kind == kind).count()
    }

    /// The most severe violation collected, earliest first on ties.
    #[must_use]
    pub fn worst(&self) -> Option<NetplayViolation> {
        let seen = self.seen.lock();
        let mut worst: Option<&NetplayViolation> = None;
        for violation in seen.iter() {
            if worst.is_none_or(|w| violation.severity > w.severity) {
                worst = Some(violation);
            }
        }
        worst.cloned()
    }

    /// Forgets everything collected.
    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &NetplayViolation) {
        self.seen.lock().push(violation.clone());
    }
}

/// Fans one violation out to several observers, in insertion order.
#[derive(Default)]
pub struct CompositeObserver {
    children: Vec<Arc<dyn ViolationObserver>>,
}

impl CompositeObserver {
    /// Creates a composite with no children.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a child.
    #[must_use]
    pub fn with(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.children.push(observer);
        self
    }
}

impl ViolationObserver for CompositeObserver {
    fn on_violation(&self, violation: &NetplayViolation) {
        self.children
            .iter()
            .for_each(|child| child.on_violation(violation));
    }
}

impl std::fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("children", &self.children.len())
            .finish()
    }
}

/// Reports a violation with the current file and line to [`TracingObserver`].
///
/// ```
/// use rollback_netplay::{report_violation, telemetry::{ViolationSeverity, ViolationKind}};
///
/// let index = 4;
/// report_violation!(ViolationSeverity::Warning, ViolationKind::InputTimeline,
///     "dropping batch for pruned epoch {}", index);
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $($message:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        $crate::telemetry::TracingObserver.on_violation(&$crate::telemetry::NetplayViolation::new(
            $severity,
            $kind,
            format!($($message)+),
            concat!(file!(), ":", line!()),
        ));
    }};
}

// ==========================================
// Runtime Invariant Checking
// ==========================================

/// A broken internal invariant, returned by [`InvariantChecker`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct InvariantViolation {
    /// Type that owns the invariant.
    pub type_name: &'static str,
    /// The invariant, stated as what should hold.
    pub invariant: String,
    /// Offending values, if the checker recorded them.
    pub details: Option<String>,
}

impl InvariantViolation {
    /// Creates a violation without details.
    #[must_use]
    pub fn new(type_name: &'static str, invariant: impl Into<String>) -> Self {
        Self {
            type_name,
            invariant: invariant.into(),
            details: None,
        }
    }

    /// Records the offending values.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{}: {} ({details})", self.type_name, self.invariant),
            None => write!(f, "{}: {}", self.type_name, self.invariant),
        }
    }
}

/// Self-check for the stateful building blocks (timeline, channel, store).
pub trait InvariantChecker {
    /// `Err` with the first invariant found broken.
    fn check_invariants(&self) -> Result<(), InvariantViolation>;
}

/// Runs [`InvariantChecker::check_invariants`] after a mutation and reports a
/// failure as a critical [`ViolationKind::Invariant`].
///
/// Active in debug builds and with the `paranoid` feature; compiles to nothing
/// otherwise.
#[macro_export]
#[cfg(any(debug_assertions, feature = "paranoid"))]
macro_rules! debug_check_invariants {
    ($expr:expr, $context:expr) => {{
        use $crate::telemetry::InvariantChecker as _;
        if let Err(violation) = $expr.check_invariants() {
            $crate::report_violation!(
                $crate::telemetry::ViolationSeverity::Critical,
                $crate::telemetry::ViolationKind::Invariant,
                "{} after {}",
                violation,
                $context
            );
        }
    }};
}

/// Disabled invariant check.
#[macro_export]
#[cfg(not(any(debug_assertions, feature = "paranoid")))]
macro_rules! debug_check_invariants {
    ($expr:expr, $context:expr) => {{}};
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn violation(severity: ViolationSeverity, kind: ViolationKind) -> NetplayViolation {
        NetplayViolation::new(severity, kind, "test", "telemetry.rs:1")
    }

    #[test]
    fn severities_are_ordered() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn display_shows_position_and_context() {
        let violation = NetplayViolation::new(
            ViolationSeverity::Error,
            ViolationKind::SnapshotStore,
            "load miss",
            "store.rs:10",
        )
        .at(IndexedFrame::new(3, 50))
        .with_context("history", 0)
        .with_context("capacity", 8);

        assert_eq!(
            violation.to_string(),
            "error snapshot_store @3:50: load miss (store.rs:10) {capacity=8 history=0}"
        );
    }

    #[test]
    fn display_without_position() {
        let violation = violation(ViolationSeverity::Warning, ViolationKind::Spectator);
        assert_eq!(violation.to_string(), "warning spectator: test (telemetry.rs:1)");
    }

    #[test]
    fn collecting_observer_counts_and_ranks() {
        let observer = CollectingObserver::new();
        assert!(observer.is_empty());
        assert!(observer.worst().is_none());

        observer.on_violation(&violation(ViolationSeverity::Warning, ViolationKind::Spectator));
        observer.on_violation(&violation(ViolationSeverity::Critical, ViolationKind::Invariant));
        observer.on_violation(&violation(ViolationSeverity::Warning, ViolationKind::Spectator));

        assert_eq!(observer.len(), 3);
        assert_eq!(observer.count(ViolationKind::Spectator), 2);
        assert!(!observer.has_violation(ViolationKind::ReliableChannel));
        assert_eq!(observer.worst().map(|v| v.kind), Some(ViolationKind::Invariant));

        observer.clear();
        assert!(observer.is_empty());
    }

    #[test]
    fn composite_reaches_every_child() {
        let first = Arc::new(CollectingObserver::new());
        let second = Arc::new(CollectingObserver::new());
        let composite = CompositeObserver::new()
            .with(first.clone())
            .with(second.clone())
            .with(Arc::new(TracingObserver));

        composite.on_violation(&violation(ViolationSeverity::Error, ViolationKind::Configuration));

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn invariant_violation_display() {
        let bare = InvariantViolation::new("InputTimeline", "start_index + epochs fits u32");
        assert_eq!(bare.to_string(), "InputTimeline: start_index + epochs fits u32");
        let detailed = bare.with_details("start_index=4294967295");
        assert_eq!(
            detailed.to_string(),
            "InputTimeline: start_index + epochs fits u32 (start_index=4294967295)"
        );
    }

    #[test]
    fn violation_serializes_to_structured_fields() {
        let value = serde_json::to_value(
            violation(ViolationSeverity::Error, ViolationKind::SnapshotStore)
                .at(IndexedFrame::new(3, 50))
                .with_context("capacity", 8),
        )
        .unwrap();
        assert_eq!(value["severity"], "error");
        assert_eq!(value["kind"], "snapshot_store");
        assert_eq!(value["at"]["frame"], 50);
        assert_eq!(value["context"]["capacity"], "8");
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_export_uses_snake_case_labels() {
        let json = violation(ViolationSeverity::Warning, ViolationKind::ReliableChannel)
            .at(IndexedFrame::new(1, 2))
            .to_json()
            .unwrap();
        assert!(json.contains(r#""kind":"reliable_channel""#));
        assert!(json.contains(r#""severity":"warning""#));
        assert!(json.contains(r#""at":{"index":1,"frame":2}"#));
    }
}
