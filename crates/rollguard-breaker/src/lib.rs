//! rollguard-breaker: a circuit breaker whose state lives in the shared store.
//!
//! Guards calls to an unreliable dependency (the feature-flag provider,
//! in practice). Callers ask [`CircuitBreaker::allow`] before the call and
//! report exactly one of [`CircuitBreaker::record_success`] /
//! [`CircuitBreaker::record_failure`] afterwards.
//!
//! # State machine
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────▶ Open
//!     ▲                                │ open_duration elapsed
//!     │ success                        ▼ (checked lazily on allow)
//!     └──────────────────────────── HalfOpen ── failure ──▶ Open (restamped)
//! ```
//!
//! Every transition is written to the [`KvStore`](rollguard_state::KvStore)
//! with compare-and-swap, so concurrent callers and separate processes
//! sharing a store never lose an increment. The breaker never returns an
//! error: if the store misbehaves it logs and lets the call through.

pub mod breaker;
pub mod clock;

pub use breaker::{BreakerSettings, CircuitBreaker, CircuitRecord, CircuitSnapshot, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
