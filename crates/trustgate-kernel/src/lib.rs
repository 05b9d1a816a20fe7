//! `trustgate-kernel` – Trust & Safety Core
//!
//! Decides how far the node may trust its own environment and enforces that
//! decision.  Nothing in here drives a motor; it only says whether motors may
//! be driven.
//!
//! # Modules
//!
//! - [`platform_scorer`] – [`PlatformScorer`][platform_scorer::PlatformScorer]:
//!   turns discovery evidence into per-class Q16 confidences and resolves the
//!   platform class with a safety-biased tie-break and a generic safe-mode
//!   fallback.
//! - [`attestor`] – [`Attestor`][attestor::Attestor]: SHA-256 measured-boot
//!   check against a sealed reference, with an optional hardware
//!   [`SecureElement`][attestor::SecureElement].
//! - [`trust_evaluator`] – [`TrustEvaluator`][trust_evaluator::TrustEvaluator]
//!   and [`TrustCell`][trust_evaluator::TrustCell]: weighted evidence fusion
//!   into an operational mode, published by whole-`Arc` swap.
//! - [`boot_manager`] – [`BootManager`][boot_manager::BootManager]: the
//!   cold/fast/recovery boot state machine.
//! - [`bus_pulse`] – [`PulseCheck`][bus_pulse::PulseCheck]: grades actuation
//!   bus write latency into the hardware trust factor.
//! - [`vault`] – [`Vault`][vault::Vault]: owner-only persisted snapshot,
//!   first-boot marker and sealed reference.
//! - [`interlock`] – [`SafetyInterlock`][interlock::SafetyInterlock]: atomic,
//!   escalate-only kill switch.
//! - [`incident_log`] – [`IncidentLog`][incident_log::IncidentLog]: durable
//!   append-only record of every emergency stop.
//! - [`command_router`] – [`CommandRouter`][command_router::CommandRouter]:
//!   the single gate every router task passes through.
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]: heartbeat tracking with
//!   a configurable [`FailurePolicy`][watchdog::FailurePolicy].
//! - [`telemetry_feed`] – [`TelemetryFeed`][telemetry_feed::TelemetryFeed]:
//!   drop-if-full push sink for trust, progress, interlock and denial events.

pub mod attestor;
pub mod boot_manager;
pub mod bus_pulse;
pub mod command_router;
pub mod incident_log;
pub mod interlock;
pub mod platform_scorer;
pub mod telemetry_feed;
pub mod trust_evaluator;
pub mod vault;
pub mod watchdog;

pub use attestor::{Attestor, SealPolicy, SealedReference, SecureElement};
pub use boot_manager::{BootConfig, BootManager, BootState};
pub use bus_pulse::PulseCheck;
pub use command_router::{CommandRouter, NullDispatcher, RouteOutcome, TaskDispatcher};
pub use incident_log::{Incident, IncidentLog};
pub use interlock::SafetyInterlock;
pub use platform_scorer::PlatformScorer;
pub use telemetry_feed::{TelemetryEvent, TelemetryFeed};
pub use trust_evaluator::{TrustCell, TrustEvaluator, TrustWeights};
pub use vault::{StoredEnv, Vault};
pub use watchdog::{ComponentHealth, FailurePolicy, Heartbeat, Watchdog};
