//! `trustgate-hal` – Hardware Abstraction Layer
//!
//! The kernel never touches a device node directly.  It talks to three
//! traits and lets drivers (or the simulation doubles in [`sim`]) sit behind
//! them:
//!
//! - [`bus::HardwareBus`] – writes [`RawCommand`][trustgate_types::RawCommand]
//!   packets and the hardware's defined safe state, and reports write timing
//!   as a [`bus::BusPulse`].  [`bus::DeviceBus`] frames them onto a
//!   character device.
//! - [`probe::HardwareProbe`] – passive identity scan, active discovery and
//!   bus liveness checks.  [`probe::SysfsProbe`] implements it over a Linux
//!   sysfs/devfs tree.
//! - [`safety_input::SafetyInput`] – the physical E-stop pin or safety CAN
//!   frame the interlock polls.  [`safety_input::GpioEstopInput`] reads a
//!   sysfs GPIO line.

pub mod bus;
pub mod probe;
pub mod safety_input;
pub mod sim;

pub use bus::{BusPulse, DeviceBus, HardwareBus};
pub use probe::{HardwareProbe, SysfsProbe};
pub use safety_input::{GpioEstopInput, SafetyInput};
