//! The interface between instruction decoders and the engine.

use thiserror::Error;

use crate::arch::Architecture;
use crate::concrete::ConcreteMemory;
use crate::ir::Microcode;


/// Lowers machine instructions into microcode on demand.
pub trait Decoder {
    /// The architecture the decoder handles.
    fn arch(&self) -> &Architecture;

    /// Decode the instruction at `addr` into the graph and return the
    /// address of the following instruction.
    fn decode(&mut self, mc: &mut Microcode, memory: &ConcreteMemory, addr: u64)
    -> Result<u64, DecodeError>;

    /// The address of the instruction following the one at `addr`.
    fn next_address(&self, memory: &ConcreteMemory, addr: u64) -> Result<u64, DecodeError>;
}

/// Instruction bytes that cannot be lowered.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum DecodeError {
    #[error("malformed instruction at {addr:#x}: {bytes:02x?}")]
    Malformed { addr: u64, bytes: Vec<u8> },
    #[error("unsupported instruction at {addr:#x}: {bytes:02x?}")]
    Unsupported { addr: u64, bytes: Vec<u8> },
    #[error("instruction at {addr:#x} runs into undefined memory")]
    Truncated { addr: u64 },
}

/// Read up to `max` defined bytes starting at an address.
pub fn fetch(memory: &ConcreteMemory, addr: u64, max: usize) -> Vec<u8> {
    (0 .. max as u64)
        .map(|i| memory.get_byte(addr.wrapping_add(i)))
        .take_while(Option::is_some)
        .flatten()
        .collect()
}
