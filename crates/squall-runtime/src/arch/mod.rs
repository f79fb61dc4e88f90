//! Architecture-specific machine context switching
//!
//! The only unsafe-by-construction part of the runtime. Everything above
//! this module sees fibers as opaque handles; everything below is a saved
//! callee-register set and a hand-written swap. Keep the surface narrow:
//! `SavedRegs`, `init_context`, `context_switch`.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
