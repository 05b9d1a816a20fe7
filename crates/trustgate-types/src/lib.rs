//! `trustgate-types` – shared data model for the trust-gated kernel.
//!
//! Everything that crosses a crate boundary lives here: the [`Q16`]
//! confidence encoding, the [`HardwareSnapshot`] produced by discovery,
//! platform candidates, attestation and trust results, the actuation
//! primitives and the kernel-wide [`KernelError`].

pub mod command;
pub mod control;
pub mod error;
pub mod platform;
pub mod q16;
pub mod snapshot;
pub mod trust;

pub use command::{Command, Task};
pub use control::{Intent, InterlockState, RawCommand};
pub use error::KernelError;
pub use platform::{PlatformCandidate, PlatformClass, PlatformResolution, ResolutionSource};
pub use q16::Q16;
pub use snapshot::{
    BusCapability, BusSource, BusType, CURRENT_SCHEMA_VERSION, CapabilityDescriptor,
    HardwareSnapshot, MachineIdentity, PhysicalProfile, Processor, ProtocolProfile, SignalProfile,
};
pub use trust::{
    AttestationLevel, AttestationResult, BootPath, BootSequence, OperationMode, PowerState,
    TrustDescriptor, TrustFactor, TrustLabel,
};
