//! Symbolic memory: per-byte expressions over a concrete base image.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::arch::RegisterDesc;
use crate::concrete::{ConcreteMemory, UndefinedValue};
use crate::expr::{simplify, Expr};
use crate::num::{Endianness, Width};


/// Memory and registers holding expressions instead of concrete values.
///
/// Every memory cell holds an eight bit expression, every register the
/// expression of its whole physical register. Reads that miss fall through
/// to the concrete base image, which is shared by all states.
#[derive(Debug, Clone)]
pub struct SymbolicMemory {
    cells: BTreeMap<u64, Expr>,
    registers: BTreeMap<String, Expr>,
    base: Rc<ConcreteMemory>,
    endianness: Endianness,
}

impl SymbolicMemory {
    /// Create a memory with nothing but the base image.
    pub fn new(base: Rc<ConcreteMemory>, endianness: Endianness) -> SymbolicMemory {
        SymbolicMemory {
            cells: BTreeMap::new(),
            registers: BTreeMap::new(),
            base,
            endianness,
        }
    }

    /// The concrete base image.
    pub fn base(&self) -> &Rc<ConcreteMemory> {
        &self.base
    }

    /// Whether the byte is defined symbolically or in the base.
    pub fn is_defined(&self, addr: u64) -> bool {
        self.cells.contains_key(&addr) || self.base.is_defined(addr)
    }

    /// Read one byte.
    pub fn get_byte(&self, addr: u64) -> Result<Expr, UndefinedValue> {
        if let Some(cell) = self.cells.get(&addr) {
            return Ok(cell.clone());
        }
        self.base.get_byte(addr)
            .map(|byte| Expr::constant(8, byte as u64))
            .ok_or(UndefinedValue::Address(addr))
    }

    /// Read `bits` bits at a concrete address.
    pub fn get(&self, addr: u64, bits: Width) -> Result<Expr, UndefinedValue> {
        assert!(bits > 0 && bits % 8 == 0, "memory access of {} bits is not a whole number of bytes", bits);
        let size = (bits / 8) as u64;

        // The most significant byte comes first.
        let mut value: Option<Expr> = None;
        for i in 0 .. size {
            let cur = match self.endianness {
                Endianness::Little => addr.wrapping_add(size - i - 1),
                Endianness::Big => addr.wrapping_add(i),
            };
            let byte = self.get_byte(cur)?;
            value = Some(match value {
                Some(high) => high.concat(&byte),
                None => byte,
            });
        }

        match value {
            Some(value) => Ok(simplify(&value)),
            None => unreachable!("memory access of zero bytes"),
        }
    }

    /// Store a value whose width is a whole number of bytes.
    pub fn put(&mut self, addr: u64, value: &Expr) {
        let bits = value.bits();
        assert!(bits % 8 == 0, "memory write of {} bits is not a whole number of bytes", bits);
        let size = (bits / 8) as u64;
        for i in 0 .. size {
            let cur = match self.endianness {
                Endianness::Little => addr.wrapping_add(i),
                Endianness::Big => addr.wrapping_add(size - i - 1),
            };
            let byte = simplify(&value.extract(8 * i as Width, 8));
            self.cells.insert(cur, byte);
        }
    }

    /// Read a register or a window of it.
    pub fn get_register(&self, reg: &RegisterDesc) -> Result<Expr, UndefinedValue> {
        let full = self.get_physical(reg)
            .ok_or_else(|| UndefinedValue::Register(reg.name.clone()))?;
        if reg.is_physical() {
            Ok(full)
        } else {
            Ok(simplify(&full.extract(reg.offset, reg.size)))
        }
    }

    /// Write a register or a window of it.
    ///
    /// A window write splices the value into the current physical value,
    /// which therefore has to be defined.
    pub fn set_register(&mut self, reg: &RegisterDesc, value: &Expr) -> Result<(), UndefinedValue> {
        assert_eq!(value.bits(), reg.size, "width mismatch writing register {}", reg.name);
        let full = if reg.is_physical() {
            value.clone()
        } else {
            let old = self.get_physical(reg)
                .ok_or_else(|| UndefinedValue::Register(reg.base.clone()))?;

            let top = reg.offset + reg.size;
            let mut spliced = value.clone();
            if top < reg.base_size {
                spliced = old.extract(top, reg.base_size - top).concat(&spliced);
            }
            if reg.offset > 0 {
                spliced = spliced.concat(&old.extract(0, reg.offset));
            }
            simplify(&spliced)
        };
        self.registers.insert(reg.base.clone(), full);
        Ok(())
    }

    fn get_physical(&self, reg: &RegisterDesc) -> Option<Expr> {
        if let Some(value) = self.registers.get(&reg.base) {
            return Some(value.clone());
        }
        let physical = RegisterDesc {
            name: reg.base.clone(),
            base: reg.base.clone(),
            offset: 0,
            size: reg.base_size,
            base_size: reg.base_size,
        };
        self.base.get_register(&physical).ok().map(Expr::int)
    }

    /// The symbolically written bytes.
    pub fn cells(&self) -> impl Iterator<Item=(u64, &Expr)> {
        self.cells.iter().map(|(&addr, expr)| (addr, expr))
    }

    /// The symbolically written physical registers.
    pub fn registers(&self) -> impl Iterator<Item=(&str, &Expr)> {
        self.registers.iter().map(|(name, expr)| (name.as_str(), expr))
    }
}

impl PartialEq for SymbolicMemory {
    fn eq(&self, other: &SymbolicMemory) -> bool {
        self.cells == other.cells
            && self.registers == other.registers
            && self.endianness == other.endianness
            && (Rc::ptr_eq(&self.base, &other.base) || self.base == other.base)
    }
}

impl Eq for SymbolicMemory {}

impl Hash for SymbolicMemory {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cells.hash(state);
        self.registers.hash(state);
    }
}

impl Display for SymbolicMemory {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        for (name, value) in &self.registers {
            writeln!(f, "    %{} = {}", name, value)?;
        }
        for (addr, value) in &self.cells {
            writeln!(f, "    [{:#x}] = {}", addr, value)?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Architecture;
    use crate::num::Integer;

    fn memory() -> SymbolicMemory {
        let mut base = ConcreteMemory::new();
        base.put_bytes(0x100, &[0x78, 0x56, 0x34, 0x12]);
        SymbolicMemory::new(Rc::new(base), Endianness::Little)
    }

    #[test]
    fn reads_through_to_base() {
        let mem = memory();
        assert_eq!(mem.get(0x100, 32), Ok(Expr::constant(32, 0x12345678)));
        assert_eq!(mem.get(0x102, 8), Ok(Expr::constant(8, 0x34)));
        assert_eq!(mem.get(0x102, 32), Err(UndefinedValue::Address(0x105)));
    }

    #[test]
    fn symbolic_round_trip() {
        let mut mem = memory();
        let x = Expr::var("x", 32);
        mem.put(0x200, &x);
        assert_eq!(mem.get(0x200, 32), Ok(x.clone()));
        assert_eq!(mem.get(0x201, 16), Ok(x.extract(8, 16)));

        // Mixing symbolic and concrete bytes.
        mem.put(0x101, &Expr::var("b", 8));
        assert_eq!(
            mem.get(0x100, 16),
            Ok(Expr::var("b", 8).concat(&Expr::constant(8, 0x78))),
        );
    }

    #[test]
    fn register_windows() {
        let arch = Architecture::x86_32();
        let reg = |name: &str| arch.register(name).unwrap();
        let mut mem = memory();

        assert!(mem.set_register(&reg("al"), &Expr::constant(8, 1)).is_err());

        let x = Expr::var("x", 32);
        mem.set_register(&reg("eax"), &x).unwrap();
        assert_eq!(mem.get_register(&reg("ah")), Ok(x.extract(8, 8)));

        mem.set_register(&reg("ah"), &Expr::constant(8, 0xaa)).unwrap();
        let expected = x.extract(16, 16)
            .concat(&Expr::constant(8, 0xaa))
            .concat(&x.extract(0, 8));
        assert_eq!(mem.get_register(&reg("eax")), Ok(expected));
        assert_eq!(mem.get_register(&reg("al")), Ok(x.extract(0, 8)));
    }

    #[test]
    fn concrete_registers_from_base() {
        let arch = Architecture::x86_32();
        let mut base = ConcreteMemory::new();
        base.put_register(&arch.register("ebx").unwrap(), Integer::new(32, 0xdead_beef)).unwrap();
        let mem = SymbolicMemory::new(Rc::new(base), Endianness::Little);
        assert_eq!(mem.get_register(&arch.register("bh").unwrap()), Ok(Expr::constant(8, 0xbe)));
    }

    #[test]
    fn equality_ignores_base_identity() {
        let mut a = memory();
        let mut b = memory();
        assert_eq!(a, b);
        a.put(0x10, &Expr::var("x", 8));
        assert_ne!(a, b);
        b.put(0x10, &Expr::var("x", 8));
        assert_eq!(a, b);
    }
}
