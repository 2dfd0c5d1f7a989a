#![no_std]

//! MicroV: a type-1 micro-hypervisor with a KVM-compatible guest surface.

pub use microv_core;
pub use microv_hal;
pub use microv_shim;
