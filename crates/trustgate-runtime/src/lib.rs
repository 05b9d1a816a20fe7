//! `trustgate-runtime` – Execution Contexts
//!
//! Where the kernel's decisions meet the clock.
//!
//! # Modules
//!
//! - [`actuator_loop`] – [`ActuatorLoop`][actuator_loop::ActuatorLoop]: the
//!   fixed-frequency control cycle that fuses interlock state, trust mode and
//!   the latest intent into a gated bus write.
//! - [`intent_slot`] – [`IntentSlot`][intent_slot::IntentSlot]: lock-free
//!   single-slot handoff from the cognition layer.
//! - [`interlock_poller`] – [`InterlockPoller`][interlock_poller::InterlockPoller]:
//!   periodic hardware safety poll.
//! - [`context`] – [`KernelHandles`][context::KernelHandles]: the context
//!   struct built once at boot and passed to everything else.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: `tracing`
//!   subscriber with optional OTLP span export.

pub mod actuator_loop;
pub mod context;
pub mod intent_slot;
pub mod interlock_poller;
pub mod telemetry;

pub use actuator_loop::{ActuatorLoop, ActuatorLoopConfig, TickOutcome, translate};
pub use context::{KernelHandles, KernelParts};
pub use intent_slot::IntentSlot;
pub use interlock_poller::InterlockPoller;
pub use telemetry::{TracerProviderGuard, init_tracing};
