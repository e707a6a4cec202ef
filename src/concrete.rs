//! Layered concrete memory and register bank.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter, Write};
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use thiserror::Error;

use crate::arch::RegisterDesc;
use crate::expr::Expr;
use crate::num::{Endianness, Integer, Width};


/// A read of something that holds no value.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum UndefinedValue {
    #[error("undefined memory at {0:#x}")]
    Address(u64),
    #[error("undefined register {0}")]
    Register(String),
    #[error("memory access through symbolic address {0}")]
    SymbolicAddress(Expr),
}

/// A byte-addressable memory with a register bank.
///
/// Reads that miss the local overlay fall through to an optional read-only
/// base memory shared between many overlays.
#[derive(Debug, Clone, Default)]
pub struct ConcreteMemory {
    bytes: BTreeMap<u64, u8>,
    registers: BTreeMap<String, Integer>,
    base: Option<Rc<ConcreteMemory>>,
    range: Option<(u64, u64)>,
}

impl ConcreteMemory {
    /// Create an empty memory.
    pub fn new() -> ConcreteMemory {
        ConcreteMemory::default()
    }

    /// Create an empty overlay on top of a base memory.
    pub fn with_base(base: Rc<ConcreteMemory>) -> ConcreteMemory {
        ConcreteMemory {
            bytes: BTreeMap::new(),
            registers: BTreeMap::new(),
            range: base.range,
            base: Some(base),
        }
    }

    /// The base memory, if any.
    pub fn base(&self) -> Option<&Rc<ConcreteMemory>> {
        self.base.as_ref()
    }

    /// The smallest and largest address ever written, including the base.
    pub fn address_range(&self) -> Option<(u64, u64)> {
        self.range
    }

    /// Whether a byte is defined here or in the base.
    pub fn is_defined(&self, addr: u64) -> bool {
        self.get_byte(addr).is_some()
    }

    /// Whether a physical register is defined here or in the base.
    pub fn is_register_defined(&self, name: &str) -> bool {
        self.get_physical(name).is_some()
    }

    /// Read one byte.
    pub fn get_byte(&self, addr: u64) -> Option<u8> {
        match self.bytes.get(&addr) {
            Some(&byte) => Some(byte),
            None => self.base.as_ref().and_then(|base| base.get_byte(addr)),
        }
    }

    /// Read `bits` bits starting at an address.
    ///
    /// Panics if the width is not a whole number of bytes.
    pub fn get(&self, addr: u64, bits: Width, endianness: Endianness)
    -> Result<Integer, UndefinedValue> {
        let size = byte_count(bits);
        let mut value = 0u64;
        for i in 0 .. size {
            let cur = match endianness {
                Endianness::Little => addr.wrapping_add(size - i - 1),
                Endianness::Big => addr.wrapping_add(i),
            };
            let byte = self.get_byte(cur).ok_or(UndefinedValue::Address(cur))?;
            value = (value << 8) | byte as u64;
        }
        Ok(Integer::new(bits, value))
    }

    /// Write a value whose width is a whole number of bytes.
    ///
    /// Panics if the width is not a whole number of bytes.
    pub fn put(&mut self, addr: u64, value: Integer, endianness: Endianness) {
        let size = byte_count(value.bits());
        for i in 0 .. size {
            let byte = (value.value() >> (8 * i)) as u8;
            let cur = match endianness {
                Endianness::Little => addr.wrapping_add(i),
                Endianness::Big => addr.wrapping_add(size - i - 1),
            };
            self.put_byte(cur, byte);
        }
    }

    /// Write a single byte.
    pub fn put_byte(&mut self, addr: u64, byte: u8) {
        self.bytes.insert(addr, byte);
        self.range = Some(match self.range {
            Some((min, max)) => (min.min(addr), max.max(addr)),
            None => (addr, addr),
        });
    }

    /// Copy a slice of bytes into memory.
    pub fn put_bytes(&mut self, addr: u64, bytes: &[u8]) {
        for (i, &byte) in bytes.iter().enumerate() {
            self.put_byte(addr.wrapping_add(i as u64), byte);
        }
    }

    /// Read a register or a window of it.
    pub fn get_register(&self, reg: &RegisterDesc) -> Result<Integer, UndefinedValue> {
        let full = self.get_physical(&reg.base)
            .ok_or_else(|| UndefinedValue::Register(reg.name.clone()))?;
        Ok(full.extract(reg.offset, reg.size))
    }

    /// Write a register or a window of it.
    ///
    /// Writing a window merges with the current value of the physical
    /// register, which therefore has to be defined.
    pub fn put_register(&mut self, reg: &RegisterDesc, value: Integer)
    -> Result<(), UndefinedValue> {
        assert_eq!(value.bits(), reg.size, "width mismatch writing register {}", reg.name);
        let full = if reg.is_physical() {
            value
        } else {
            let old = self.get_physical(&reg.base)
                .ok_or_else(|| UndefinedValue::Register(reg.base.clone()))?;
            let window = crate::num::mask(reg.size) << reg.offset;
            Integer::new(reg.base_size, (old.value() & !window) | (value.value() << reg.offset))
        };
        self.registers.insert(reg.base.clone(), full);
        Ok(())
    }

    fn get_physical(&self, name: &str) -> Option<Integer> {
        match self.registers.get(name) {
            Some(&value) => Some(value),
            None => self.base.as_ref().and_then(|base| base.get_physical(name)),
        }
    }

    /// All defined addresses in ascending order, including the base.
    pub fn defined_addresses(&self) -> BTreeSet<u64> {
        let mut addrs = self.base.as_ref()
            .map(|base| base.defined_addresses())
            .unwrap_or_default();
        addrs.extend(self.bytes.keys().copied());
        addrs
    }

    /// The bytes of the local overlay.
    pub fn bytes(&self) -> impl Iterator<Item=(u64, u8)> + '_ {
        self.bytes.iter().map(|(&addr, &byte)| (addr, byte))
    }

    /// The physical registers of the local overlay.
    pub fn registers(&self) -> impl Iterator<Item=(&str, Integer)> {
        self.registers.iter().map(|(name, &value)| (name.as_str(), value))
    }

    /// A hex dump of `len` bytes, sixteen per line, with `??` for undefined
    /// bytes.
    pub fn dump(&self, start: u64, len: u64) -> String {
        let mut out = String::new();
        for line in (0 .. len).step_by(16) {
            let addr = start.wrapping_add(line);
            let _ = write!(out, "{:#010x}:", addr);
            for i in 0 .. 16u64.min(len - line) {
                match self.get_byte(addr.wrapping_add(i)) {
                    Some(byte) => { let _ = write!(out, " {:02x}", byte); },
                    None => out.push_str(" ??"),
                }
            }
            out.push('\n');
        }
        out
    }
}

fn byte_count(bits: Width) -> u64 {
    assert!(bits > 0 && bits % 8 == 0, "memory access of {} bits is not a whole number of bytes", bits);
    (bits / 8) as u64
}

impl PartialEq for ConcreteMemory {
    fn eq(&self, other: &ConcreteMemory) -> bool {
        let same_base = match (&self.base, &other.base) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b) || a == b,
            (None, None) => true,
            _ => false,
        };
        self.bytes == other.bytes && self.registers == other.registers && same_base
    }
}

impl Eq for ConcreteMemory {}

impl Hash for ConcreteMemory {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
        self.registers.hash(state);
    }
}

impl Display for ConcreteMemory {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "Memory [")?;
        for (name, value) in &self.registers {
            writeln!(f, "    %{} = {}", name, value)?;
        }

        // Contiguous runs of bytes on one line each.
        let mut runs: Vec<(u64, Vec<u8>)> = vec![];
        for (&addr, &byte) in &self.bytes {
            match runs.last_mut() {
                Some((start, bytes)) if *start + bytes.len() as u64 == addr => bytes.push(byte),
                _ => runs.push((addr, vec![byte])),
            }
        }
        for (start, bytes) in runs {
            write!(f, "    {:#x}:", start)?;
            for byte in bytes {
                write!(f, " {:02x}", byte)?;
            }
            writeln!(f)?;
        }

        if self.base.is_some() {
            writeln!(f, "    (with base)")?;
        }
        write!(f, "]")
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use crate::arch::Architecture;
    use Endianness::*;

    fn hash(mem: &ConcreteMemory) -> u64 {
        let mut hasher = DefaultHasher::new();
        mem.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn round_trip() {
        let mut mem = ConcreteMemory::new();
        for &endianness in &[Little, Big] {
            for &(addr, bits, value) in &[
                (0x0u64, 8, 0xabu64), (0x10, 16, 0xbeef), (0x20, 32, 0xdeadbeef),
                (0x31, 24, 0x123456), (0x40, 64, 0x0123_4567_89ab_cdef),
                (u64::MAX - 1, 16, 0x7f7f),
            ] {
                mem.put(addr, Integer::new(bits, value), endianness);
                assert_eq!(mem.get(addr, bits, endianness), Ok(Integer::new(bits, value)));
            }
        }
    }

    #[test]
    fn byte_order() {
        let mut mem = ConcreteMemory::new();
        mem.put(0x100, Integer::new(32, 0x11223344), Little);
        assert_eq!(mem.get_byte(0x100), Some(0x44));
        assert_eq!(mem.get(0x100, 32, Big), Ok(Integer::new(32, 0x44332211)));
        assert_eq!(mem.address_range(), Some((0x100, 0x103)));
    }

    #[test]
    fn single_byte_and_undefined_neighbour() {
        for &endianness in &[Little, Big] {
            let mut mem = ConcreteMemory::new();
            mem.put(0x100, Integer::new(8, 0xab), endianness);
            assert_eq!(mem.get(0x100, 8, endianness), Ok(Integer::new(8, 0xab)));
            assert_eq!(mem.get(0xff, 16, endianness), Err(UndefinedValue::Address(0xff)));
        }
    }

    #[test]
    #[should_panic]
    fn partial_byte_write() {
        ConcreteMemory::new().put(0, Integer::new(12, 1), Little);
    }

    #[test]
    fn layering() {
        let mut base = ConcreteMemory::new();
        base.put_bytes(0x10, &[1, 2, 3, 4]);
        let base = Rc::new(base);

        let mut overlay = ConcreteMemory::with_base(base.clone());
        overlay.put_byte(0x11, 0xff);
        assert_eq!(overlay.get_byte(0x11), Some(0xff));
        assert_eq!(base.get_byte(0x11), Some(2));

        // The bytes on both sides of the overlay byte come from the base.
        assert_eq!(overlay.get(0x10, 32, Little), Ok(Integer::new(32, 0x0403ff01)));
        assert_eq!(overlay.address_range(), Some((0x10, 0x13)));
        assert!(overlay.is_defined(0x13));
        assert!(!overlay.is_defined(0x14));
        assert_eq!(overlay.defined_addresses().len(), 4);
    }

    #[test]
    fn registers() {
        let arch = Architecture::x86_32();
        let reg = |name: &str| arch.register(name).unwrap();

        let mut mem = ConcreteMemory::new();
        assert_eq!(mem.get_register(&reg("eax")), Err(UndefinedValue::Register("eax".into())));
        assert!(mem.put_register(&reg("ah"), Integer::new(8, 1)).is_err());

        mem.put_register(&reg("eax"), Integer::new(32, 0x12345678)).unwrap();
        mem.put_register(&reg("ah"), Integer::new(8, 0xaa)).unwrap();
        assert_eq!(mem.get_register(&reg("eax")), Ok(Integer::new(32, 0x1234aa78)));
        assert_eq!(mem.get_register(&reg("ax")), Ok(Integer::new(16, 0xaa78)));
        assert_eq!(mem.get_register(&reg("al")), Ok(Integer::new(8, 0x78)));

        // Windows read through to the base.
        let layered = ConcreteMemory::with_base(Rc::new(mem));
        assert_eq!(layered.get_register(&reg("ah")), Ok(Integer::new(8, 0xaa)));
        assert!(layered.is_register_defined("eax"));
    }

    #[test]
    fn equality_and_hash() {
        let build = || {
            let mut base = ConcreteMemory::new();
            base.put_byte(0, 7);
            let mut mem = ConcreteMemory::with_base(Rc::new(base));
            mem.put(0x20, Integer::new(16, 0x1234), Little);
            mem
        };

        // Content-equal memories over distinct but equal bases.
        let a = build();
        let b = build();
        assert_eq!(a, b);
        assert_eq!(hash(&a), hash(&b));

        let mut c = a.clone();
        assert_eq!(a, c);
        c.put_byte(0x21, 0);
        assert_ne!(a, c);
        assert_eq!(a.get_byte(0x21), Some(0x12));
    }

    #[test]
    fn dumping() {
        let mut mem = ConcreteMemory::new();
        mem.put_bytes(0x100, &[0xde, 0xad]);
        assert_eq!(mem.dump(0x100, 3), "0x00000100: de ad ??\n");
        assert!(mem.to_string().contains("0x100: de ad"));
    }
}
