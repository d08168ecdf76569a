//! Provider health tracking
//!
//! One circuit breaker per provider. Failures that indicate a sick backend
//! (429, 5xx, timeouts, transport errors) trip the circuit after a run of
//! consecutive occurrences; recovery goes through a half-open phase that
//! admits a bounded number of probe requests. Client-originated 4xx never
//! open the circuit.
//!
//! Records live in the tracker keyed by provider id and survive registry
//! reloads, so a provider's health history is not erased by a config edit.

pub mod breaker;
pub mod classify;
pub mod probe;
pub mod tracker;

pub use breaker::{Admission, BreakerConfig, CircuitState, HealthRecord};
pub use classify::Outcome;
pub use probe::{spawn_probe_task, ProbeTarget};
pub use tracker::HealthTracker;
