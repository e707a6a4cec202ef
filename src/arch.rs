//! Architecture descriptors: register sets, endianness and word sizes.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::rc::Rc;

use crate::num::{Endianness, Width};


/// The processor family of an architecture.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Processor {
    X86_32,
    Arm,
}

impl Display for Processor {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Processor::X86_32 => write!(f, "x86-32"),
            Processor::Arm => write!(f, "arm"),
        }
    }
}

/// A named register, possibly a window into a wider physical register.
///
/// `al` for example is the window `(offset 0, size 8)` of the physical
/// register `eax` with 32 bits.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RegisterDesc {
    pub name: String,
    pub base: String,
    pub offset: Width,
    pub size: Width,
    pub base_size: Width,
}

impl RegisterDesc {
    /// A register that is its own physical register.
    pub fn physical(name: &str, size: Width) -> RegisterDesc {
        RegisterDesc {
            name: name.to_string(),
            base: name.to_string(),
            offset: 0,
            size,
            base_size: size,
        }
    }

    /// A window of another register.
    pub fn window(name: &str, base: &RegisterDesc, offset: Width, size: Width) -> RegisterDesc {
        assert!(offset + size <= base.size, "register window out of range");
        RegisterDesc {
            name: name.to_string(),
            base: base.base.clone(),
            offset: base.offset + offset,
            size,
            base_size: base.base_size,
        }
    }

    /// Whether this register covers the whole physical register.
    pub fn is_physical(&self) -> bool {
        self.offset == 0 && self.size == self.base_size
    }
}

impl Display for RegisterDesc {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "%{}", self.name)
    }
}

/// Everything the engine needs to know about a target architecture.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Architecture {
    pub processor: Processor,
    pub endianness: Endianness,
    pub word_size: Width,
    pub address_size: Width,
    pub pc: String,
    registers: BTreeMap<String, Rc<RegisterDesc>>,
}

impl Architecture {
    /// The 32-bit x86 architecture with general purpose registers, their
    /// 16 and 8 bit aliases, the instruction pointer and the status flags.
    pub fn x86_32() -> Architecture {
        let mut arch = Architecture::empty(Processor::X86_32, Endianness::Little, 32, "eip");

        for &(e, x, l, h) in &[
            ("eax", "ax", "al", "ah"), ("ecx", "cx", "cl", "ch"),
            ("edx", "dx", "dl", "dh"), ("ebx", "bx", "bl", "bh"),
        ] {
            let full = arch.add(RegisterDesc::physical(e, 32));
            arch.add(RegisterDesc::window(x, &full, 0, 16));
            arch.add(RegisterDesc::window(l, &full, 0, 8));
            arch.add(RegisterDesc::window(h, &full, 8, 8));
        }

        for &(e, x) in &[("esp", "sp"), ("ebp", "bp"), ("esi", "si"), ("edi", "di")] {
            let full = arch.add(RegisterDesc::physical(e, 32));
            arch.add(RegisterDesc::window(x, &full, 0, 16));
        }

        arch.add(RegisterDesc::physical("eip", 32));
        for flag in &["cf", "pf", "af", "zf", "sf", "tf", "if", "df", "of"] {
            arch.add(RegisterDesc::physical(flag, 1));
        }

        arch
    }

    /// The 32-bit ARM architecture with the sixteen core registers and the
    /// condition flags.
    pub fn arm(endianness: Endianness) -> Architecture {
        let mut arch = Architecture::empty(Processor::Arm, endianness, 32, "r15");
        for i in 0 .. 16 {
            arch.add(RegisterDesc::physical(&format!("r{}", i), 32));
        }
        for &(alias, index) in &[("sp", 13), ("lr", 14), ("pc", 15)] {
            let full = arch.registers[&format!("r{}", index)].as_ref().clone();
            arch.add(RegisterDesc::window(alias, &full, 0, 32));
        }
        for flag in &["z", "n", "c", "v"] {
            arch.add(RegisterDesc::physical(flag, 1));
        }
        arch
    }

    fn empty(processor: Processor, endianness: Endianness, word_size: Width, pc: &str)
    -> Architecture {
        Architecture {
            processor,
            endianness,
            word_size,
            address_size: word_size,
            pc: pc.to_string(),
            registers: BTreeMap::new(),
        }
    }

    /// Add a register to the table.
    pub fn add(&mut self, desc: RegisterDesc) -> RegisterDesc {
        self.registers.insert(desc.name.clone(), Rc::new(desc.clone()));
        desc
    }

    /// Look up a register by name.
    pub fn register(&self, name: &str) -> Option<Rc<RegisterDesc>> {
        self.registers.get(name).cloned()
    }

    /// All known registers, ordered by name.
    pub fn registers(&self) -> impl Iterator<Item=&Rc<RegisterDesc>> {
        self.registers.values()
    }

    /// The physical registers only.
    pub fn physical_registers(&self) -> impl Iterator<Item=&Rc<RegisterDesc>> {
        self.registers.values().filter(|r| r.is_physical() && r.name == r.base)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x86_aliases() {
        let arch = Architecture::x86_32();
        let ah = arch.register("ah").unwrap();
        assert_eq!((ah.base.as_str(), ah.offset, ah.size, ah.base_size), ("eax", 8, 8, 32));
        assert!(arch.register("eax").unwrap().is_physical());
        assert_eq!(arch.register("zf").unwrap().size, 1);
        assert!(arch.physical_registers().all(|r| r.is_physical()));
        assert_eq!(arch.physical_registers().filter(|r| r.size == 32).count(), 9);
    }

    #[test]
    fn arm_registers() {
        let arch = Architecture::arm(Endianness::Big);
        assert_eq!(arch.register("sp").unwrap().base, "r13");
        assert!(arch.register("r15").is_some());
        assert_eq!(arch.endianness, Endianness::Big);
        assert_eq!(arch.physical_registers().count(), 20);
    }
}
