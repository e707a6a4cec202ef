//! Shared, immutable symbolic bit-vector expressions.

use std::collections::hash_map::DefaultHasher;
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::arch::RegisterDesc;
use crate::num::{Integer, Width};

mod rewrite;
mod simplify;

pub use rewrite::*;
pub use simplify::*;


/// A reference-counted expression tree.
///
/// Cloning an expression only bumps the reference count and subtrees are
/// shared between all trees built from them. Trees are never mutated, every
/// rewrite produces a new root that reuses the unchanged parts.
#[derive(Clone)]
pub struct Expr(Rc<ExprInner>);

struct ExprInner {
    node: ExprNode,
    bits: Width,
    hash: u64,
}

/// The node kinds of an expression.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum ExprNode {
    Constant(Integer),
    /// A free symbol. Pattern variables are also plain variables.
    Variable(String, Width),
    Register(Rc<RegisterDesc>),
    /// `bits` bits stored in memory at the address plus a byte offset.
    MemCell(Expr, u64, Width),
    Unary(UnOp, Expr),
    Binary(BinOp, Expr, Expr),
    Ternary(TernaryOp, Expr, Expr, Expr),
}

/// Unary operators.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum UnOp {
    Not,
    Neg,
    /// The `size` bits starting at bit `offset`.
    Extract { offset: Width, size: Width },
    ZeroExtend(Width),
    SignExtend(Width),
}

/// Binary operators.
///
/// On one-bit operands `And`, `Or` and `Xor` double as boolean connectives.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BinOp {
    Add, Sub, Mul, UDiv, URem,
    And, Or, Xor,
    Shl, Shr, Sar,
    /// Concatenation with the left operand as the high part.
    Concat,
    Eq, Ne, Ult, Ule, Slt, Sle,
}

/// Ternary operators.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TernaryOp {
    IfThenElse,
}

impl BinOp {
    /// Whether the operator yields a one-bit truth value.
    pub fn is_comparison(self) -> bool {
        use BinOp::*;
        matches!(self, Eq | Ne | Ult | Ule | Slt | Sle)
    }

    /// Whether `a op b == b op a`.
    pub fn is_commutative(self) -> bool {
        use BinOp::*;
        matches!(self, Add | Mul | And | Or | Xor | Eq | Ne)
    }

    /// Apply the operator to constants.
    pub fn apply(self, a: Integer, b: Integer) -> Integer {
        use BinOp::*;
        match self {
            Add => a + b,
            Sub => a - b,
            Mul => a * b,
            UDiv => a.udiv(b),
            URem => a.urem(b),
            And => a & b,
            Or => a | b,
            Xor => a ^ b,
            Shl => a.shl(b),
            Shr => a.shr(b),
            Sar => a.sar(b),
            Concat => a.concat(b),
            Eq => a.eq_bit(b),
            Ne => a.ne_bit(b),
            Ult => a.lt(b, false),
            Ule => a.le(b, false),
            Slt => a.lt(b, true),
            Sle => a.le(b, true),
        }
    }

    fn symbol(self) -> &'static str {
        use BinOp::*;
        match self {
            Add => "+", Sub => "-", Mul => "*", UDiv => "/u", URem => "%u",
            And => "&", Or => "|", Xor => "^",
            Shl => "<<", Shr => ">>", Sar => ">>s",
            Concat => "::",
            Eq => "==", Ne => "!=", Ult => "<u", Ule => "<=u", Slt => "<s", Sle => "<=s",
        }
    }
}

impl UnOp {
    /// Apply the operator to a constant.
    pub fn apply(self, a: Integer) -> Integer {
        match self {
            UnOp::Not => !a,
            UnOp::Neg => -a,
            UnOp::Extract { offset, size } => a.extract(offset, size),
            UnOp::ZeroExtend(bits) => a.zero_extend(bits),
            UnOp::SignExtend(bits) => a.sign_extend(bits),
        }
    }
}

macro_rules! bin_expr {
    ($func:ident, $op:ident) => {
        pub fn $func(&self, other: &Expr) -> Expr {
            Expr::binary(BinOp::$op, self.clone(), other.clone())
        }
    };
}

impl Expr {
    /// Wrap a node, computing its width and content hash.
    pub fn new(node: ExprNode) -> Expr {
        let bits = width_of(&node);
        let mut hasher = DefaultHasher::new();
        node.hash(&mut hasher);
        bits.hash(&mut hasher);
        Expr(Rc::new(ExprInner { node, bits, hash: hasher.finish() }))
    }

    /// A constant.
    pub fn int(value: Integer) -> Expr {
        Expr::new(ExprNode::Constant(value))
    }

    /// A constant with the given width.
    pub fn constant(bits: Width, value: u64) -> Expr {
        Expr::int(Integer::new(bits, value))
    }

    /// The one-bit truth value.
    pub fn bool(value: bool) -> Expr {
        Expr::int(Integer::from_bool(value))
    }

    /// A free variable.
    pub fn var(name: &str, bits: Width) -> Expr {
        Expr::new(ExprNode::Variable(name.to_string(), bits))
    }

    /// A register reference.
    pub fn reg(desc: Rc<RegisterDesc>) -> Expr {
        Expr::new(ExprNode::Register(desc))
    }

    /// A memory reference.
    pub fn mem(addr: Expr, bits: Width) -> Expr {
        Expr::memcell(addr, 0, bits)
    }

    /// A memory reference at a byte offset from an address.
    pub fn memcell(addr: Expr, offset: u64, bits: Width) -> Expr {
        Expr::new(ExprNode::MemCell(addr, offset, bits))
    }

    /// Apply a unary operator.
    pub fn unary(op: UnOp, a: Expr) -> Expr {
        Expr::new(ExprNode::Unary(op, a))
    }

    /// Apply a binary operator.
    pub fn binary(op: BinOp, a: Expr, b: Expr) -> Expr {
        Expr::new(ExprNode::Binary(op, a, b))
    }

    /// If-then-else.
    pub fn ite(cond: &Expr, then: &Expr, otherwise: &Expr) -> Expr {
        Expr::new(ExprNode::Ternary(
            TernaryOp::IfThenElse, cond.clone(), then.clone(), otherwise.clone(),
        ))
    }

    bin_expr!(add, Add);
    bin_expr!(sub, Sub);
    bin_expr!(mul, Mul);
    bin_expr!(udiv, UDiv);
    bin_expr!(urem, URem);
    bin_expr!(and, And);
    bin_expr!(or, Or);
    bin_expr!(xor, Xor);
    bin_expr!(shl, Shl);
    bin_expr!(shr, Shr);
    bin_expr!(sar, Sar);
    bin_expr!(concat, Concat);
    bin_expr!(eq, Eq);
    bin_expr!(ne, Ne);
    bin_expr!(ult, Ult);
    bin_expr!(ule, Ule);
    bin_expr!(slt, Slt);
    bin_expr!(sle, Sle);

    pub fn not(&self) -> Expr {
        Expr::unary(UnOp::Not, self.clone())
    }

    pub fn neg(&self) -> Expr {
        Expr::unary(UnOp::Neg, self.clone())
    }

    pub fn extract(&self, offset: Width, size: Width) -> Expr {
        Expr::unary(UnOp::Extract { offset, size }, self.clone())
    }

    pub fn zero_extend(&self, bits: Width) -> Expr {
        Expr::unary(UnOp::ZeroExtend(bits), self.clone())
    }

    pub fn sign_extend(&self, bits: Width) -> Expr {
        Expr::unary(UnOp::SignExtend(bits), self.clone())
    }

    /// The node of this expression.
    pub fn node(&self) -> &ExprNode {
        &self.0.node
    }

    /// The width in bits.
    pub fn bits(&self) -> Width {
        self.0.bits
    }

    /// Whether both handles point to the very same node.
    pub fn ptr_eq(&self, other: &Expr) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// The constant value if this is a constant.
    pub fn as_const(&self) -> Option<Integer> {
        match self.node() {
            ExprNode::Constant(int) => Some(*int),
            _ => None,
        }
    }

    /// Whether this is the one-bit constant true.
    pub fn is_true(&self) -> bool {
        self.bits() == 1 && self.as_const().map(Integer::is_true) == Some(true)
    }

    /// Whether this is the one-bit constant false.
    pub fn is_false(&self) -> bool {
        self.bits() == 1 && self.as_const().map(Integer::is_true) == Some(false)
    }

    /// The direct children in left-to-right order.
    pub fn children(&self) -> Vec<&Expr> {
        match self.node() {
            ExprNode::Constant(_) | ExprNode::Variable(..) | ExprNode::Register(_) => vec![],
            ExprNode::MemCell(addr, _, _) => vec![addr],
            ExprNode::Unary(_, a) => vec![a],
            ExprNode::Binary(_, a, b) => vec![a, b],
            ExprNode::Ternary(_, a, b, c) => vec![a, b, c],
        }
    }

    /// The same node with its children swapped out.
    ///
    /// Panics if the number of children does not fit the node.
    pub fn with_children(&self, mut children: Vec<Expr>) -> Expr {
        assert_eq!(children.len(), self.children().len(), "with_children: arity mismatch");
        let mut next = || children.remove(0);
        let node = match self.node() {
            ExprNode::Constant(_) | ExprNode::Variable(..) | ExprNode::Register(_) => {
                return self.clone();
            },
            ExprNode::MemCell(_, offset, bits) => ExprNode::MemCell(next(), *offset, *bits),
            ExprNode::Unary(op, _) => ExprNode::Unary(*op, next()),
            ExprNode::Binary(op, _, _) => {
                let a = next();
                ExprNode::Binary(*op, a, next())
            },
            ExprNode::Ternary(op, _, _, _) => {
                let a = next();
                let b = next();
                ExprNode::Ternary(*op, a, b, next())
            },
        };
        Expr::new(node)
    }

    /// The number of nodes in the tree, counting shared subtrees once per use.
    pub fn size(&self) -> usize {
        1 + self.children().into_iter().map(Expr::size).sum::<usize>()
    }

    /// Evaluate the expression with concrete values for its leaves.
    ///
    /// Returns `None` if a variable, register or memory cell has no value.
    pub fn evaluate<F>(&self, leaf: &F) -> Option<Integer> where F: Fn(&Expr) -> Option<Integer> {
        match self.node() {
            ExprNode::Constant(int) => Some(*int),
            ExprNode::Variable(..) | ExprNode::Register(_) | ExprNode::MemCell(..) => leaf(self),
            ExprNode::Unary(op, a) => Some(op.apply(a.evaluate(leaf)?)),
            ExprNode::Binary(op, a, b) => Some(op.apply(a.evaluate(leaf)?, b.evaluate(leaf)?)),
            ExprNode::Ternary(TernaryOp::IfThenElse, c, a, b) => {
                if c.evaluate(leaf)?.is_true() { a.evaluate(leaf) } else { b.evaluate(leaf) }
            },
        }
    }

    /// Call a function for every node, parents before children.
    pub fn traverse<F>(&self, f: &mut F) where F: FnMut(&Expr) {
        f(self);
        for child in self.children() {
            child.traverse(f);
        }
    }
}

/// Computes and checks the width of a node.
fn width_of(node: &ExprNode) -> Width {
    match node {
        ExprNode::Constant(int) => int.bits(),
        ExprNode::Variable(_, bits) => *bits,
        ExprNode::Register(desc) => desc.size,
        ExprNode::MemCell(_, _, bits) => {
            assert!(*bits > 0 && bits % 8 == 0, "memory cell width {} is not in bytes", bits);
            *bits
        },
        ExprNode::Unary(op, a) => match *op {
            UnOp::Not | UnOp::Neg => a.bits(),
            UnOp::Extract { offset, size } => {
                assert!(size > 0 && offset + size <= a.bits(),
                    "extract [{}; {}] out of range for width {}", offset, size, a.bits());
                size
            },
            UnOp::ZeroExtend(bits) | UnOp::SignExtend(bits) => {
                assert!(bits >= a.bits() && bits <= 64, "invalid extension to {} bits", bits);
                bits
            },
        },
        ExprNode::Binary(op, a, b) => {
            if *op == BinOp::Concat {
                assert!(a.bits() + b.bits() <= 64, "concatenation wider than 64 bits");
                a.bits() + b.bits()
            } else {
                assert_eq!(a.bits(), b.bits(),
                    "incompatible widths for {:?}: {} and {}", op, a, b);
                if op.is_comparison() { 1 } else { a.bits() }
            }
        },
        ExprNode::Ternary(TernaryOp::IfThenElse, c, a, b) => {
            assert_eq!(c.bits(), 1, "if-then-else condition must be one bit wide");
            assert_eq!(a.bits(), b.bits(), "if-then-else branches differ in width");
            a.bits()
        },
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Expr) -> bool {
        self.ptr_eq(other) || (
            self.0.hash == other.0.hash
            && self.0.bits == other.0.bits
            && self.0.node == other.0.node
        )
    }
}

impl Eq for Expr {}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.node() {
            ExprNode::Constant(int) => write!(f, "{}", int),
            ExprNode::Variable(name, _) => write!(f, "{}", name),
            ExprNode::Register(desc) => write!(f, "{}", desc),
            ExprNode::MemCell(addr, 0, bits) => write!(f, "[{}]:{}", addr, bits),
            ExprNode::MemCell(addr, offset, bits) => write!(f, "[{}+{:#x}]:{}", addr, offset, bits),
            ExprNode::Unary(op, a) => match op {
                UnOp::Not => write!(f, "(!{})", a),
                UnOp::Neg => write!(f, "(-{})", a),
                UnOp::Extract { offset, size } => write!(f, "{}[{}..{}]", a, offset, offset + size),
                UnOp::ZeroExtend(bits) => write!(f, "zext{}({})", bits, a),
                UnOp::SignExtend(bits) => write!(f, "sext{}({})", bits, a),
            },
            ExprNode::Binary(op, a, b) => write!(f, "({} {} {})", a, op.symbol(), b),
            ExprNode::Ternary(TernaryOp::IfThenElse, c, a, b) => {
                write!(f, "({} ? {} : {})", c, a, b)
            },
        }
    }
}

impl Debug for Expr {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result { Display::fmt(self, f) }
}
