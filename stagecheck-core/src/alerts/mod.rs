//! Alerting: fingerprints, the dedup/rate-limit gate and the dispatcher.

pub mod dispatcher;
pub mod fingerprint;
pub mod gate;

pub use dispatcher::{AlertDispatcher, DispatchOutcome};
pub use fingerprint::{normalize_message, Alert, AlertFingerprint, Severity};
pub use gate::{AlertGate, AlertRecord, GateDecision, GateStats};
