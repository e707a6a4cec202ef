//! Satisfiability oracles for path conditions.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::expr::{collect_variables, simplify, Expr, ExprNode};
use crate::num::Integer;


/// The answer of a satisfiability check.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Satisfiability {
    Sat,
    Unsat,
    Unknown,
}

impl Satisfiability {
    /// Whether the formula could hold. Unknown answers count as feasible.
    pub fn is_feasible(self) -> bool {
        self != Satisfiability::Unsat
    }
}

/// Failures of a solver.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum SolverError {
    #[error("failed to initialize solver: {0}")]
    Init(String),
    #[error("solver backend failed: {0}")]
    Backend(String),
}

/// Decides whether one-bit formulas are satisfiable.
pub trait Solver {
    /// A short name for diagnostics.
    fn name(&self) -> &str;

    /// Check whether some assignment of the free symbols makes the formula
    /// true.
    fn check_sat(&mut self, formula: &Expr) -> Result<Satisfiability, SolverError>;
}

/// A solver without external dependencies.
///
/// It simplifies the formula and, if free variables remain whose combined
/// width is small enough, tries every assignment. Everything else is
/// unknown.
#[derive(Debug, Clone)]
pub struct SimplifySolver {
    max_enumeration_bits: u32,
}

impl SimplifySolver {
    /// Create a solver that enumerates up to 16 bits of free variables.
    pub fn new() -> SimplifySolver {
        SimplifySolver::with_enumeration_bound(16)
    }

    /// Create a solver with a custom enumeration bound.
    pub fn with_enumeration_bound(max_enumeration_bits: u32) -> SimplifySolver {
        SimplifySolver { max_enumeration_bits: max_enumeration_bits.min(24) }
    }
}

impl Default for SimplifySolver {
    fn default() -> SimplifySolver {
        SimplifySolver::new()
    }
}

impl Solver for SimplifySolver {
    fn name(&self) -> &str {
        "simplify"
    }

    fn check_sat(&mut self, formula: &Expr) -> Result<Satisfiability, SolverError> {
        assert_eq!(formula.bits(), 1, "formulas must be one bit wide");
        let formula = simplify(formula);
        if let Some(value) = formula.as_const() {
            return Ok(if value.is_true() { Satisfiability::Sat } else { Satisfiability::Unsat });
        }

        let mut opaque = false;
        formula.traverse(&mut |e| {
            opaque |= matches!(e.node(), ExprNode::Register(_) | ExprNode::MemCell(..));
        });

        let vars: Vec<(String, u32)> = collect_variables(&formula).into_iter().collect();
        let total: u32 = vars.iter().map(|(_, bits)| bits).sum();
        if opaque || total > self.max_enumeration_bits {
            return Ok(Satisfiability::Unknown);
        }

        for assignment in 0 .. 1u64 << total {
            let mut values = BTreeMap::new();
            let mut shift = 0;
            for (name, bits) in &vars {
                values.insert(name.as_str(), Integer::new(*bits, assignment >> shift));
                shift += bits;
            }

            let result = formula.evaluate(&|leaf: &Expr| match leaf.node() {
                ExprNode::Variable(name, _) => values.get(name.as_str()).copied(),
                _ => None,
            });

            if result.map(Integer::is_true) == Some(true) {
                return Ok(Satisfiability::Sat);
            }
        }

        Ok(Satisfiability::Unsat)
    }
}

#[cfg(feature = "z3")]
pub use self::z3_backend::Z3Solver;

#[cfg(feature = "z3")]
mod z3_backend {
    use z3::ast::{Ast, Bool as Z3Bool, BV as Z3BitVec};
    use z3::{Config, Context as Z3Context, SatResult};

    use super::{Satisfiability, Solver, SolverError};
    use crate::expr::{BinOp, Expr, ExprNode, TernaryOp, UnOp};

    /// Decides formulas with the Z3 SMT solver.
    pub struct Z3Solver {
        ctx: Z3Context,
    }

    impl Z3Solver {
        /// Create a new solver with its own Z3 context.
        pub fn new() -> Result<Z3Solver, SolverError> {
            let config = Config::new();
            Ok(Z3Solver { ctx: Z3Context::new(&config) })
        }
    }

    impl Solver for Z3Solver {
        fn name(&self) -> &str {
            "z3"
        }

        fn check_sat(&mut self, formula: &Expr) -> Result<Satisfiability, SolverError> {
            let one = Z3BitVec::from_u64(&self.ctx, 1, 1);
            let assertion = to_z3_ast(&self.ctx, formula)._eq(&one);
            let solver = z3::Solver::new(&self.ctx);
            solver.assert(&assertion);
            Ok(match solver.check() {
                SatResult::Sat => Satisfiability::Sat,
                SatResult::Unsat => Satisfiability::Unsat,
                SatResult::Unknown => Satisfiability::Unknown,
            })
        }
    }

    /// Translate an expression into a Z3 bit-vector. Registers and memory
    /// cells become free constants named after their display form.
    fn to_z3_ast<'ctx>(ctx: &'ctx Z3Context, expr: &Expr) -> Z3BitVec<'ctx> {
        let bits = expr.bits();
        let boolean = |b: Z3Bool<'ctx>| {
            b.ite(&Z3BitVec::from_u64(ctx, 1, 1), &Z3BitVec::from_u64(ctx, 0, 1))
        };

        match expr.node() {
            ExprNode::Constant(int) => Z3BitVec::from_u64(ctx, int.value(), bits),
            ExprNode::Variable(name, _) => Z3BitVec::new_const(ctx, name.as_str(), bits),
            ExprNode::Register(_) | ExprNode::MemCell(..) => {
                Z3BitVec::new_const(ctx, expr.to_string(), bits)
            },
            ExprNode::Unary(op, a) => {
                let a_ast = to_z3_ast(ctx, a);
                match *op {
                    UnOp::Not => a_ast.bvnot(),
                    UnOp::Neg => a_ast.bvneg(),
                    UnOp::Extract { offset, size } => a_ast.extract(offset + size - 1, offset),
                    UnOp::ZeroExtend(to) => a_ast.zero_ext(to - a.bits()),
                    UnOp::SignExtend(to) => a_ast.sign_ext(to - a.bits()),
                }
            },
            ExprNode::Binary(op, a, b) => {
                let x = to_z3_ast(ctx, a);
                let y = to_z3_ast(ctx, b);
                match op {
                    BinOp::Add => x.bvadd(&y),
                    BinOp::Sub => x.bvsub(&y),
                    BinOp::Mul => x.bvmul(&y),
                    BinOp::UDiv => x.bvudiv(&y),
                    BinOp::URem => x.bvurem(&y),
                    BinOp::And => x.bvand(&y),
                    BinOp::Or => x.bvor(&y),
                    BinOp::Xor => x.bvxor(&y),
                    BinOp::Shl => x.bvshl(&y),
                    BinOp::Shr => x.bvlshr(&y),
                    BinOp::Sar => x.bvashr(&y),
                    BinOp::Concat => x.concat(&y),
                    BinOp::Eq => boolean(x._eq(&y)),
                    BinOp::Ne => boolean(x._eq(&y).not()),
                    BinOp::Ult => boolean(x.bvult(&y)),
                    BinOp::Ule => boolean(x.bvule(&y)),
                    BinOp::Slt => boolean(x.bvslt(&y)),
                    BinOp::Sle => boolean(x.bvsle(&y)),
                }
            },
            ExprNode::Ternary(TernaryOp::IfThenElse, c, a, b) => {
                let one = Z3BitVec::from_u64(ctx, 1, 1);
                to_z3_ast(ctx, c)._eq(&one).ite(&to_z3_ast(ctx, a), &to_z3_ast(ctx, b))
            },
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn decides_bit_vector_formulas() {
            let mut solver = Z3Solver::new().unwrap();
            let x = Expr::var("x", 8);

            let contradiction = x.ult(&Expr::constant(8, 5)).and(&Expr::constant(8, 7).ult(&x));
            assert_eq!(solver.check_sat(&contradiction), Ok(Satisfiability::Unsat));
            assert_eq!(solver.check_sat(&x.eq(&Expr::constant(8, 3))), Ok(Satisfiability::Sat));

            // Wider than the enumerating solver can handle.
            let wide = Expr::var("w", 32);
            let formula = wide.add(&Expr::constant(32, 1)).eq(&Expr::constant(32, 0));
            assert_eq!(solver.check_sat(&formula), Ok(Satisfiability::Sat));
            assert_eq!(solver.check_sat(&formula.and(&wide.eq(&Expr::constant(32, 0)))), Ok(Satisfiability::Unsat));
        }
    }
}
