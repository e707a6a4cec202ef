//! Symbolic execution of microcode.

use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};

use crate::expr::Expr;
use crate::ir::MicrocodeAddress;

mod mem;
mod simulator;

pub use mem::*;
pub use simulator::*;


/// One point of the exploration: a location, a symbolic valuation and the
/// branch decisions that led here.
///
/// Two states are equal when they are at the same location with the same
/// memory and registers. The path condition does not take part, so states
/// reached along different paths collapse into one.
#[derive(Debug, Clone)]
pub struct SymbolicState {
    pub pc: MicrocodeAddress,
    pub memory: SymbolicMemory,
    pub path_condition: Expr,
}

impl PartialEq for SymbolicState {
    fn eq(&self, other: &SymbolicState) -> bool {
        self.pc == other.pc && self.memory == other.memory
    }
}

impl Eq for SymbolicState {}

impl Hash for SymbolicState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pc.hash(state);
        self.memory.hash(state);
    }
}

impl Display for SymbolicState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "State at {} [", self.pc)?;
        writeln!(f, "    path: {}", self.path_condition)?;
        write!(f, "{}", self.memory)?;
        write!(f, "]")
    }
}
