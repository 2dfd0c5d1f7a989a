//! x86_64 architecture support

pub mod ept;
pub mod msr;
pub mod paging;
pub mod vmcs;
pub mod vmx;

pub use ept::{Slat, SlatError, SlatFlags};
pub use paging::{walk_guest, GlaTranslation, WalkError};
pub use vmcs::{ExitReason, IoExitInfo};
