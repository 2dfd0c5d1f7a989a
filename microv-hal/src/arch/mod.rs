//! Architecture-specific implementations

pub mod x86_64;
