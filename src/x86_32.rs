//! Decoding of `x86_32` instructions and their lowering into microcode.

use std::fmt::{self, Display, Formatter};
use byteorder::{ByteOrder, LittleEndian};

use crate::arch::Architecture;
use crate::concrete::ConcreteMemory;
use crate::decoder::{fetch, DecodeError, Decoder};
use crate::expr::{replace_subterm, Expr, ExprNode, UnOp};
use crate::ir::{Microcode, MicrocodeAddress};
use crate::num::{mask, Integer, Width};


/// The longest legal x86 instruction.
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

/// Lowers 32-bit x86 machine code.
#[derive(Debug, Clone)]
pub struct X86_32Decoder {
    arch: Architecture,
}

impl X86_32Decoder {
    /// Create a new decoder.
    pub fn new() -> X86_32Decoder {
        X86_32Decoder { arch: Architecture::x86_32() }
    }
}

impl Default for X86_32Decoder {
    fn default() -> X86_32Decoder {
        X86_32Decoder::new()
    }
}

impl Decoder for X86_32Decoder {
    fn arch(&self) -> &Architecture {
        &self.arch
    }

    fn decode(&mut self, mc: &mut Microcode, memory: &ConcreteMemory, addr: u64)
    -> Result<u64, DecodeError> {
        let bytes = fetch(memory, addr, MAX_INSTRUCTION_LENGTH);
        let inst = Instruction::decode(&bytes, addr)?;
        let next = addr.wrapping_add(inst.bytes.len() as u64) & mask(32);

        let start = MicrocodeAddress::instruction(addr);
        let mut lowering = Lowering {
            arch: &self.arch,
            mc: &mut *mc,
            cur: start,
            next: MicrocodeAddress::instruction(next),
        };
        lowering.lower(&inst)?;
        mc.annotate(start, inst.to_string());

        Ok(next)
    }

    fn next_address(&self, memory: &ConcreteMemory, addr: u64) -> Result<u64, DecodeError> {
        let bytes = fetch(memory, addr, MAX_INSTRUCTION_LENGTH);
        match Instruction::length(&bytes) {
            0 if bytes.len() < MAX_INSTRUCTION_LENGTH => Err(DecodeError::Truncated { addr }),
            0 => Err(DecodeError::Malformed { addr, bytes }),
            len => Ok(addr.wrapping_add(len) & mask(32)),
        }
    }
}

/// A decoded machine code instruction.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Instruction {
    pub addr: u64,
    pub bytes: Vec<u8>,
    pub prefix: Option<Prefix>,
    pub mnemonic: Mnemonic,
    pub operands: Vec<Operand>,
}

/// A repeat prefix.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Prefix {
    Rep,
    Repne,
}

/// Identifies an instruction.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Mnemonic {
    Add, Or, And, Sub, Xor, Cmp, Test,
    Inc, Dec,
    Mov, Movzx, Movsx, Lea,
    Push, Pop,
    Jmp, Jcc(Condition), Jecxz, Call, Ret,
    Stosb, Movsb,
    Nop, Hlt,
}

/// The condition of a conditional jump, in encoding order.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Condition {
    O, No, B, Ae, E, Ne, Be, A, S, Ns, P, Np, L, Ge, Le, G,
}

const CONDITIONS: [Condition; 16] = {
    use Condition::*;
    [O, No, B, Ae, E, Ne, Be, A, S, Ns, P, Np, L, Ge, Le, G]
};

/// An operand in an instruction.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Operand {
    /// Directly the register.
    Register(Register),
    /// The value at `base + index * scale + disp`.
    Memory {
        width: Width,
        base: Option<Register>,
        index: Option<(Register, u8)>,
        disp: i64,
    },
    /// A direct immediate value.
    Immediate(Integer),
    /// The absolute target of a relative jump.
    Target(u64),
}

impl Instruction {
    /// Tries to decode the instruction at the start of the bytes.
    pub fn decode(bytes: &[u8], addr: u64) -> Result<Instruction, DecodeError> {
        let mut parser = Parser { bytes, index: 0, addr };
        parser.decode().map_err(|err| {
            let bytes = bytes[.. parser.index.min(bytes.len())].to_vec();
            match err {
                ParseError::Truncated => DecodeError::Truncated { addr },
                ParseError::Unsupported => DecodeError::Unsupported { addr, bytes },
                ParseError::Malformed => DecodeError::Malformed { addr, bytes },
            }
        })
    }

    /// The byte length of the first instruction in the given slice.
    pub fn length(bytes: &[u8]) -> u64 {
        lde::X86.ld(bytes) as u64
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ParseError {
    Truncated,
    Unsupported,
    Malformed,
}

/// Describes the operand layout of the instruction.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum OperandLayout {
    Free,
    Plus(u8, Width),
    PlusIm(u8, Width),
    Rm(Width),
    RegRm(Width, Width, bool),
    RmIm(Width, Width),
    FixIm(Register, Width),
    /// An immediate of the first width, sign-extended to the second.
    Im(Width, Width),
    Rel(Width),
    /// A register and a memory operand whose address is taken.
    Address(Width),
}

/// The arithmetic group in opcode order. Gaps are `adc` and `sbb`.
const ALU: [Option<Mnemonic>; 8] = {
    use Mnemonic::*;
    [Some(Add), Some(Or), None, None, Some(And), Some(Sub), Some(Xor), Some(Cmp)]
};

/// Reads one instruction from raw bytes.
struct Parser<'a> {
    bytes: &'a [u8],
    index: usize,
    addr: u64,
}

impl<'a> Parser<'a> {
    fn decode(&mut self) -> Result<Instruction, ParseError> {
        use OperandLayout::*;

        // Parse the prefixes.
        let mut prefix = None;
        let mut opsize = false;
        loop {
            match self.peek()? {
                0x66 => opsize = true,
                0xf3 => prefix = Some(Prefix::Rep),
                0xf2 => prefix = Some(Prefix::Repne),
                _ => break,
            }
            self.index += 1;
        }

        let v = if opsize { 16 } else { 32 };
        let (opcode, mnemonic, layout) = self.decode_opcode(v)?;

        // Construct the operands.
        let mut operands = Vec::new();
        match layout {
            Free => {},
            Plus(base, width) => {
                operands.push(Operand::Register(Register::from_bits(opcode - base, width)));
            },
            PlusIm(base, width) => {
                operands.push(Operand::Register(Register::from_bits(opcode - base, width)));
                operands.push(self.decode_immediate(width, width)?);
            },
            Rm(width) => {
                let (_, rm) = self.decode_modrm_operands(width, width)?;
                operands.push(rm);
            },
            RegRm(reg_w, rm_w, reg_first) => {
                let (reg, rm) = self.decode_modrm_operands(reg_w, rm_w)?;
                if reg_first {
                    operands.push(reg); operands.push(rm);
                } else {
                    operands.push(rm); operands.push(reg);
                }
            },
            RmIm(rm_w, im_w) => {
                let (_, rm) = self.decode_modrm_operands(rm_w, rm_w)?;
                operands.push(rm);
                operands.push(self.decode_immediate(im_w, rm_w)?);
            },
            FixIm(reg, im_w) => {
                operands.push(Operand::Register(reg));
                operands.push(self.decode_immediate(im_w, reg.width())?);
            },
            Im(im_w, ext_w) => operands.push(self.decode_immediate(im_w, ext_w)?),
            Rel(width) => {
                let offset = self.decode_signed_value(width)?;
                let target = self.addr
                    .wrapping_add(self.index as u64)
                    .wrapping_add(offset as u64);
                operands.push(Operand::Target(target & mask(32)));
            },
            Address(width) => {
                let (reg, rm) = self.decode_modrm_operands(width, width)?;
                if !matches!(rm, Operand::Memory { .. }) {
                    return Err(ParseError::Malformed);
                }
                operands.push(reg);
                operands.push(rm);
            },
        }

        Ok(Instruction {
            addr: self.addr,
            bytes: self.bytes[.. self.index].to_vec(),
            prefix,
            mnemonic,
            operands,
        })
    }

    /// Decodes the opcode and returns its last byte together with the
    /// mnemonic and operand layout.
    fn decode_opcode(&mut self, v: Width) -> Result<(u8, Mnemonic, OperandLayout), ParseError> {
        use Mnemonic::*;
        use OperandLayout::*;

        let mut opcode = self.byte()? as u16;
        if opcode == 0x0f {
            opcode = 0x0f00 | self.byte()? as u16;
        }

        let acc = Register::from_bits(0, v);
        let (mnemonic, layout) = match opcode {
            0x00 ..= 0x3d if opcode & 7 < 6 && ALU[(opcode >> 3) as usize].is_some() => {
                let mnemonic = ALU[(opcode >> 3) as usize].ok_or(ParseError::Unsupported)?;
                let layout = match opcode & 7 {
                    0 => RegRm(8, 8, false),
                    1 => RegRm(v, v, false),
                    2 => RegRm(8, 8, true),
                    3 => RegRm(v, v, true),
                    4 => FixIm(Register::AL, 8),
                    _ => FixIm(acc, v),
                };
                (mnemonic, layout)
            },
            0x80 | 0x81 | 0x83 => {
                let mnemonic = ALU[self.ext()? as usize].ok_or(ParseError::Unsupported)?;
                let layout = match opcode {
                    0x80 => RmIm(8, 8),
                    0x81 => RmIm(v, v),
                    _ => RmIm(v, 8),
                };
                (mnemonic, layout)
            },

            0x84 => (Test, RegRm(8, 8, false)),
            0x85 => (Test, RegRm(v, v, false)),
            0xa8 => (Test, FixIm(Register::AL, 8)),
            0xa9 => (Test, FixIm(acc, v)),

            0x40 ..= 0x47 => (Inc, Plus(0x40, v)),
            0x48 ..= 0x4f => (Dec, Plus(0x48, v)),
            0x50 ..= 0x57 => (Push, Plus(0x50, 32)),
            0x58 ..= 0x5f => (Pop, Plus(0x58, 32)),
            0x68 => (Push, Im(32, 32)),
            0x6a => (Push, Im(8, 32)),

            0x88 => (Mov, RegRm(8, 8, false)),
            0x89 => (Mov, RegRm(v, v, false)),
            0x8a => (Mov, RegRm(8, 8, true)),
            0x8b => (Mov, RegRm(v, v, true)),
            0xb0 ..= 0xb7 => (Mov, PlusIm(0xb0, 8)),
            0xb8 ..= 0xbf => (Mov, PlusIm(0xb8, v)),
            0xc6 if self.ext()? == 0 => (Mov, RmIm(8, 8)),
            0xc7 if self.ext()? == 0 => (Mov, RmIm(v, v)),
            0x0fb6 => (Movzx, RegRm(v, 8, true)),
            0x0fb7 => (Movzx, RegRm(v, 16, true)),
            0x0fbe => (Movsx, RegRm(v, 8, true)),
            0x0fbf => (Movsx, RegRm(v, 16, true)),
            0x8d => (Lea, Address(v)),

            0x70 ..= 0x7f => (Jcc(CONDITIONS[(opcode & 0xf) as usize]), Rel(8)),
            0x0f80 ..= 0x0f8f => (Jcc(CONDITIONS[(opcode & 0xf) as usize]), Rel(32)),
            0xe3 => (Jecxz, Rel(8)),
            0xeb => (Jmp, Rel(8)),
            0xe9 => (Jmp, Rel(32)),
            0xe8 => (Call, Rel(32)),
            0xc2 => (Ret, Im(16, 16)),
            0xc3 => (Ret, Free),

            0xfe => match self.ext()? {
                0 => (Inc, Rm(8)),
                1 => (Dec, Rm(8)),
                _ => return Err(ParseError::Unsupported),
            },
            0xff => match self.ext()? {
                0 => (Inc, Rm(v)),
                1 => (Dec, Rm(v)),
                2 => (Call, Rm(32)),
                4 => (Jmp, Rm(32)),
                6 => (Push, Rm(v)),
                _ => return Err(ParseError::Unsupported),
            },

            0xa4 => (Movsb, Free),
            0xaa => (Stosb, Free),
            0x90 => (Nop, Free),
            0xf4 => (Hlt, Free),

            _ => return Err(ParseError::Unsupported),
        };

        Ok((opcode as u8, mnemonic, layout))
    }

    /// Decodes the ModR/M byte, the SIB byte and displacement.
    fn decode_modrm_operands(&mut self, reg_w: Width, rm_w: Width)
    -> Result<(Operand, Operand), ParseError> {
        let (modus, reg, rm) = self.decode_modrm()?;
        let reg_op = Operand::Register(Register::from_bits(reg, reg_w));
        if modus == 0b11 {
            return Ok((reg_op, Operand::Register(Register::from_bits(rm, rm_w))));
        }

        let mut base = Some(Register::from_bits(rm, 32));
        let mut index = None;
        let mut displace_width = match modus {
            0b01 => Some(8),
            0b10 => Some(32),
            _ => None,
        };

        // Check if we use SIB, an absolute address or just R/M.
        if rm == 0b100 {
            let (scale, index_bits, base_bits) = self.decode_sib()?;
            if index_bits != 0b100 {
                index = Some((Register::from_bits(index_bits, 32), scale));
            }
            base = Some(Register::from_bits(base_bits, 32));
            if base_bits == 0b101 && modus == 0b00 {
                base = None;
                displace_width = Some(32);
            }
        } else if rm == 0b101 && modus == 0b00 {
            base = None;
            displace_width = Some(32);
        }

        let disp = match displace_width {
            Some(width) => self.decode_signed_value(width)?,
            None => 0,
        };

        Ok((reg_op, Operand::Memory { width: rm_w, base, index, disp }))
    }

    /// Decodes the ModR/M byte and returns a (modus, reg, rm) triple.
    fn decode_modrm(&mut self) -> Result<(u8, u8, u8), ParseError> {
        let byte = self.byte()?;
        Ok((byte >> 6, (byte & 0b00111000) >> 3, byte & 0b00000111))
    }

    /// Decodes the SIB byte and returns a (scale, index, base) triple.
    fn decode_sib(&mut self) -> Result<(u8, u8, u8), ParseError> {
        let byte = self.byte()?;
        Ok((1 << (byte >> 6), (byte & 0b00111000) >> 3, byte & 0b00000111))
    }

    /// The instruction extension (0 - 7) in the reg field of the ModR/M byte.
    fn ext(&self) -> Result<u8, ParseError> {
        self.peek().map(|byte| (byte & 0b00111000) >> 3)
    }

    /// Decodes an immediate and sign-extends it to the operand width.
    fn decode_immediate(&mut self, width: Width, extended: Width) -> Result<Operand, ParseError> {
        let value = self.decode_unsigned_value(width)?;
        Ok(Operand::Immediate(Integer::new(width, value).sign_extend(extended)))
    }

    /// Decode a variable width unsigned value.
    fn decode_unsigned_value(&mut self, width: Width) -> Result<u64, ParseError> {
        let bytes = self.take(width as usize / 8)?;
        Ok(match width {
            8 => bytes[0] as u64,
            16 => LittleEndian::read_u16(bytes) as u64,
            _ => LittleEndian::read_u32(bytes) as u64,
        })
    }

    /// Decode a variable width signed value.
    fn decode_signed_value(&mut self, width: Width) -> Result<i64, ParseError> {
        let bytes = self.take(width as usize / 8)?;
        Ok(match width {
            8 => bytes[0] as i8 as i64,
            16 => LittleEndian::read_i16(bytes) as i64,
            _ => LittleEndian::read_i32(bytes) as i64,
        })
    }

    fn peek(&self) -> Result<u8, ParseError> {
        self.bytes.get(self.index).copied().ok_or(ParseError::Truncated)
    }

    fn byte(&mut self) -> Result<u8, ParseError> {
        let byte = self.peek()?;
        self.index += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ParseError> {
        let bytes = self.bytes.get(self.index .. self.index + len).ok_or(ParseError::Truncated)?;
        self.index += len;
        Ok(bytes)
    }
}

/// Emits the microcode of one instruction, step by step.
struct Lowering<'a> {
    arch: &'a Architecture,
    mc: &'a mut Microcode,
    cur: MicrocodeAddress,
    next: MicrocodeAddress,
}

impl Lowering<'_> {
    fn lower(&mut self, inst: &Instruction) -> Result<(), DecodeError> {
        use Mnemonic::*;

        let ops = &inst.operands;
        let malformed = || DecodeError::Malformed { addr: inst.addr, bytes: inst.bytes.clone() };
        let operand = |i: usize| ops.get(i).ok_or_else(malformed);

        match inst.mnemonic {
            Add | Or | And | Sub | Xor | Cmp | Test => {
                let a = self.read(operand(0)?);
                let b = self.read(operand(1)?);
                let res = match inst.mnemonic {
                    Add => a.add(&b),
                    Or => a.or(&b),
                    And | Test => a.and(&b),
                    Sub | Cmp => a.sub(&b),
                    _ => a.xor(&b),
                };

                // Flags go first so that they see the old operands.
                match inst.mnemonic {
                    Add => self.add_flags(&a, &b, &res),
                    Sub | Cmp => self.sub_flags(&a, &b, &res),
                    _ => self.logic_flags(&res),
                }

                if !matches!(inst.mnemonic, Cmp | Test) {
                    let dst = self.lvalue(operand(0)?).ok_or_else(malformed)?;
                    self.assign(dst, res);
                }
                self.fallthrough();
            },

            Inc | Dec => {
                let a = self.read(operand(0)?);
                let bits = a.bits();
                let one = Expr::constant(bits, 1);
                let sign = 1 << (bits - 1);
                let (res, overflow) = if inst.mnemonic == Inc {
                    (a.add(&one), sign)
                } else {
                    (a.sub(&one), sign - 1)
                };

                self.result_flags(&res);
                self.flag("of", res.eq(&Expr::constant(bits, overflow)));
                let dst = self.lvalue(operand(0)?).ok_or_else(malformed)?;
                self.assign(dst, res);
                self.fallthrough();
            },

            Mov => {
                let dst = self.lvalue(operand(0)?).ok_or_else(malformed)?;
                let src = self.read(operand(1)?);
                self.assign(dst, src);
                self.fallthrough();
            },

            Movzx | Movsx => {
                let dst = self.lvalue(operand(0)?).ok_or_else(malformed)?;
                let src = self.read(operand(1)?);
                let value = if inst.mnemonic == Movzx {
                    src.zero_extend(dst.bits())
                } else {
                    src.sign_extend(dst.bits())
                };
                self.assign(dst, value);
                self.fallthrough();
            },

            Lea => {
                let dst = self.lvalue(operand(0)?).ok_or_else(malformed)?;
                let addr = self.address(operand(1)?).ok_or_else(malformed)?;
                let value = if dst.bits() < 32 { addr.extract(0, dst.bits()) } else { addr };
                self.assign(dst, value);
                self.fallthrough();
            },

            Push => {
                let value = self.read(operand(0)?);
                self.push(value);
                self.fallthrough();
            },

            Pop => {
                let esp = self.reg("esp");
                let dst = self.lvalue(operand(0)?).ok_or_else(malformed)?;
                let bits = dst.bits();
                if dst == esp {
                    self.assign(esp.clone(), Expr::mem(esp, 32));
                } else {
                    self.assign(dst, Expr::mem(esp.clone(), bits));
                    self.assign(esp.clone(), esp.add(&Expr::constant(32, bits as u64 / 8)));
                }
                self.fallthrough();
            },

            Jmp => match operand(0)? {
                Operand::Target(target) => self.goto(*target),
                op => {
                    let target = self.read(op);
                    self.mc.add_jump(self.cur, target);
                },
            },

            Jcc(condition) => {
                let target = self.target(operand(0)?).ok_or_else(malformed)?;
                let cond = self.condition(condition);
                self.branch(cond, target);
            },

            Jecxz => {
                let target = self.target(operand(0)?).ok_or_else(malformed)?;
                let cond = self.reg("ecx").eq(&Expr::constant(32, 0));
                self.branch(cond, target);
            },

            Call => {
                let esp = self.reg("esp");
                let target = operand(0)?;
                self.push(Expr::constant(32, self.next.global));
                match target {
                    Operand::Target(target) => self.goto(*target),
                    op => {
                        // The target is computed before the return address
                        // is pushed.
                        let dynamic = self.read(op);
                        let dynamic = replace_subterm(&dynamic, &esp, &esp.add(&Expr::constant(32, 4)));
                        self.mc.add_jump(self.cur, dynamic);
                    },
                }
            },

            Ret => {
                let esp = self.reg("esp");
                let extra = match ops.first() {
                    Some(Operand::Immediate(bytes)) => bytes.value(),
                    _ => 0,
                };
                let popped = Expr::constant(32, 4 + extra);
                self.assign(esp.clone(), esp.add(&popped));
                self.mc.add_jump(self.cur, Expr::mem(esp.sub(&popped), 32));
            },

            Stosb | Movsb => {
                if inst.prefix.is_some() {
                    // The counter is tested at the instruction boundary and
                    // each iteration loops back to it.
                    let ecx = self.reg("ecx");
                    let done = ecx.eq(&Expr::constant(32, 0));
                    let body = self.cur + 1;
                    self.mc.add_skip(self.cur, self.next, done.clone());
                    self.mc.add_skip(self.cur, body, done.not());
                    self.cur = body;
                    self.string_step(inst.mnemonic);
                    let start = MicrocodeAddress::instruction(inst.addr);
                    self.mc.add_assignment(self.cur, ecx.clone(), ecx.sub(&Expr::constant(32, 1)), Some(start));
                } else {
                    self.string_step(inst.mnemonic);
                    self.fallthrough();
                }
            },

            Nop => self.fallthrough(),

            Hlt => {
                self.mc.add_node(self.cur);
            },
        }

        Ok(())
    }

    /// One iteration of a string instruction. The direction flag is not
    /// modelled, so the pointers always move forward.
    fn string_step(&mut self, mnemonic: Mnemonic) {
        let edi = self.reg("edi");
        let esi = self.reg("esi");
        let one = Expr::constant(32, 1);

        let value = match mnemonic {
            Mnemonic::Stosb => self.reg("al"),
            _ => Expr::mem(esi.clone(), 8),
        };
        self.assign(Expr::mem(edi.clone(), 8), value);
        if mnemonic == Mnemonic::Movsb {
            self.assign(esi.clone(), esi.add(&one));
        }
        self.assign(edi.clone(), edi.add(&one));
    }

    fn push(&mut self, value: Expr) {
        let esp = self.reg("esp");
        let size = Expr::constant(32, value.bits() as u64 / 8);
        self.assign(Expr::mem(esp.sub(&size), value.bits()), value);
        self.assign(esp.clone(), esp.sub(&size));
    }

    fn add_flags(&mut self, a: &Expr, b: &Expr, res: &Expr) {
        let msb = res.bits() - 1;
        self.flag("cf", res.ult(a));
        self.flag("of", a.xor(res).and(&b.xor(res)).extract(msb, 1));
        self.result_flags(res);
    }

    fn sub_flags(&mut self, a: &Expr, b: &Expr, res: &Expr) {
        let msb = res.bits() - 1;
        self.flag("cf", a.ult(b));
        self.flag("of", a.xor(b).and(&a.xor(res)).extract(msb, 1));
        self.result_flags(res);
    }

    fn logic_flags(&mut self, res: &Expr) {
        self.flag("cf", Expr::bool(false));
        self.flag("of", Expr::bool(false));
        self.result_flags(res);
    }

    /// Zero, sign and parity flag. The adjust flag is not modelled.
    fn result_flags(&mut self, res: &Expr) {
        let bits = res.bits();
        self.flag("zf", res.eq(&Expr::constant(bits, 0)));
        self.flag("sf", res.extract(bits - 1, 1));
        let odd = (1 .. 8).fold(res.extract(0, 1), |acc, i| acc.xor(&res.extract(i, 1)));
        self.flag("pf", odd.not());
    }

    fn condition(&self, condition: Condition) -> Expr {
        let flag = |name| self.reg(name);
        let less = flag("sf").xor(&flag("of"));
        let index = condition as usize;
        let positive = match index >> 1 {
            0 => flag("of"),
            1 => flag("cf"),
            2 => flag("zf"),
            3 => flag("cf").or(&flag("zf")),
            4 => flag("sf"),
            5 => flag("pf"),
            6 => less,
            _ => flag("zf").or(&less),
        };
        if index & 1 == 1 { positive.not() } else { positive }
    }

    fn branch(&mut self, cond: Expr, target: u64) {
        let target = MicrocodeAddress::instruction(target);
        if target == self.next {
            self.fallthrough();
            return;
        }

        let negated = match cond.node() {
            ExprNode::Unary(UnOp::Not, inner) => inner.clone(),
            _ => cond.not(),
        };
        self.mc.add_skip(self.cur, target, cond);
        self.mc.add_skip(self.cur, self.next, negated);
    }

    fn reg(&self, name: &str) -> Expr {
        match self.arch.register(name) {
            Some(desc) => Expr::reg(desc),
            None => panic!("x86_32 has no register {}", name),
        }
    }

    fn flag(&mut self, name: &str, value: Expr) {
        let flag = self.reg(name);
        self.assign(flag, value);
    }

    fn read(&self, op: &Operand) -> Expr {
        match *op {
            Operand::Register(reg) => self.reg(reg.name()),
            Operand::Memory { width, base, index, disp } => {
                Expr::mem(self.effective_address(base, index, disp), width)
            },
            Operand::Immediate(int) => Expr::int(int),
            Operand::Target(target) => Expr::constant(32, target),
        }
    }

    fn lvalue(&self, op: &Operand) -> Option<Expr> {
        match op {
            Operand::Register(_) | Operand::Memory { .. } => Some(self.read(op)),
            _ => None,
        }
    }

    fn address(&self, op: &Operand) -> Option<Expr> {
        match *op {
            Operand::Memory { base, index, disp, .. } => Some(self.effective_address(base, index, disp)),
            _ => None,
        }
    }

    /// `base + index * scale + disp`, leaving out what is absent.
    fn effective_address(&self, base: Option<Register>, index: Option<(Register, u8)>, disp: i64)
    -> Expr {
        let mut terms = vec![];
        if let Some(base) = base {
            terms.push(self.reg(base.name()));
        }
        if let Some((index, scale)) = index {
            let index = self.reg(index.name());
            terms.push(if scale == 1 { index } else { index.mul(&Expr::constant(32, scale as u64)) });
        }
        if disp != 0 {
            terms.push(Expr::constant(32, disp as u64));
        }

        terms.into_iter()
            .reduce(|acc, term| acc.add(&term))
            .unwrap_or_else(|| Expr::constant(32, 0))
    }

    fn target(&self, op: &Operand) -> Option<u64> {
        match *op {
            Operand::Target(target) => Some(target),
            _ => None,
        }
    }

    fn assign(&mut self, lvalue: Expr, rhs: Expr) {
        self.cur = self.mc.add_assignment(self.cur, lvalue, rhs, None);
    }

    fn goto(&mut self, target: u64) {
        self.mc.add_fallthrough(self.cur, MicrocodeAddress::instruction(target));
    }

    fn fallthrough(&mut self) {
        self.mc.add_fallthrough(self.cur, self.next);
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.prefix {
            Some(Prefix::Rep) => write!(f, "rep ")?,
            Some(Prefix::Repne) => write!(f, "repne ")?,
            None => {},
        }
        write!(f, "{}", self.mnemonic)?;
        let mut first = true;
        for operand in &self.operands {
            if !first { write!(f, ",")?; } first = false;
            write!(f, " {}", operand)?;
        }
        Ok(())
    }
}

impl Display for Mnemonic {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Mnemonic::Jcc(condition) => write!(f, "j{}", condition),
            _ => write!(f, "{}", format!("{:?}", self).to_lowercase()),
        }
    }
}

impl Display for Condition {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_lowercase())
    }
}

impl Display for Operand {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Operand::Register(reg) => write!(f, "{}", reg),
            Operand::Memory { width, base, index, disp } => {
                let name = match width {
                    8 => "byte",
                    16 => "word",
                    _ => "dword",
                };
                write!(f, "{} ptr [", name)?;
                if let Some(base) = base {
                    write!(f, "{}", base)?;
                }
                if let Some((index, scale)) = index {
                    if base.is_some() {
                        write!(f, "+")?;
                    }
                    write!(f, "{}*{}", index, scale)?;
                }
                if base.is_none() && index.is_none() {
                    write!(f, "{:#x}", disp as u64 & mask(32))?;
                } else if disp > 0 {
                    write!(f, "+{:#x}", disp)?;
                } else if disp < 0 {
                    write!(f, "-{:#x}", -disp)?;
                }
                write!(f, "]")
            },
            Operand::Immediate(int) => write!(f, "{:#x}", int.value()),
            Operand::Target(target) => write!(f, "{:#x}", target),
        }
    }
}

/// Identifies a register.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Register {
    EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI,
    AX, CX, DX, BX, SP, BP, SI, DI,
    AL, CL, DL, BL, AH, CH, DH, BH,
}

impl Display for Register {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Register {
    /// The bit width of the register.
    pub fn width(self) -> Width {
        use Register::*;
        match self {
            EAX | ECX | EDX | EBX | ESP | EBP | ESI | EDI => 32,
            AX | CX | DX | BX | SP | BP | SI | DI => 16,
            AL | CL | DL | BL | AH | CH | DH | BH => 8,
        }
    }

    /// The name of the register in the architecture's table.
    pub fn name(self) -> &'static str {
        use Register::*;
        match self {
            EAX => "eax", ECX => "ecx", EDX => "edx", EBX => "ebx",
            ESP => "esp", EBP => "ebp", ESI => "esi", EDI => "edi",
            AX => "ax", CX => "cx", DX => "dx", BX => "bx",
            SP => "sp", BP => "bp", SI => "si", DI => "di",
            AL => "al", CL => "cl", DL => "dl", BL => "bl",
            AH => "ah", CH => "ch", DH => "dh", BH => "bh",
        }
    }

    /// Decodes the register from the bit pattern in the instruction.
    fn from_bits(bits: u8, width: Width) -> Register {
        use Register::*;
        let table = match width {
            8 => [AL, CL, DL, BL, AH, CH, DH, BH],
            16 => [AX, CX, DX, BX, SP, BP, SI, DI],
            _ => [EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI],
        };
        table[(bits & 0b111) as usize]
    }
}
