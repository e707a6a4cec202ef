//! Control flow recovery for machine code based on symbolic execution of
//! microcode. 💻
//!
//! Instructions are lowered on demand into a graph of guarded micro steps.
//! Symbolic states walk this graph from the entrypoint and every feasible
//! successor that is not a repetition of an earlier state is explored,
//! which discovers the instructions reachable through direct and computed
//! jumps alike.

pub mod arch;
pub mod concrete;
pub mod config;
pub mod decoder;
pub mod dot;
pub mod expr;
pub mod ir;
pub mod loader;
pub mod num;
pub mod recovery;
pub mod solver;
pub mod sym;
pub mod x86_32;

pub use crate::config::RecoveryConfig;
pub use crate::ir::{Microcode, MicrocodeAddress};
pub use crate::loader::{Image, Loader, RawLoader};
pub use crate::recovery::{symbexec, Recovery, RecoveryError, RecoveryStats};
pub use crate::solver::{SimplifySolver, Solver};
pub use crate::x86_32::X86_32Decoder;
