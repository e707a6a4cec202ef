//! Simplification and normal forms.

use super::{bottom_up_rewrite, BinOp, Expr, ExprNode, TernaryOp, UnOp};
use crate::num::Integer;


/// One bottom-up pass of constant folding and algebraic identities.
pub fn simplify_level0(expr: &Expr) -> Expr {
    bottom_up_rewrite(expr, &mut level0)
}

/// Simplify until a pass leaves the expression unchanged.
///
/// Every rule either shrinks the tree or moves constants to a fixed side,
/// so the loop terminates.
pub fn simplify(expr: &Expr) -> Expr {
    let mut current = expr.clone();
    loop {
        let next = simplify_level0(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

/// Normalize a one-bit formula into a disjunction of conjunctions of literals.
pub fn rewrite_in_dnf(expr: &Expr) -> Expr {
    assert_eq!(expr.bits(), 1, "only one-bit formulas have a disjunctive normal form");
    let pre = simplify(expr);
    let clauses = dnf_clauses(&pre, false);

    let disjunction = clauses.into_iter()
        .map(|clause| {
            clause.into_iter()
                .reduce(|a, b| a.and(&b))
                .unwrap_or_else(|| Expr::bool(true))
        })
        .reduce(|a, b| a.or(&b))
        .unwrap_or_else(|| Expr::bool(false));

    simplify_level0(&disjunction)
}

/// Whether a one-bit formula is a disjunction of conjunctions of literals.
pub fn is_dnf(expr: &Expr) -> bool {
    fn is_literal(e: &Expr) -> bool {
        match connective(e) {
            None => true,
            Some(Connective::Not(a)) => connective(a).is_none(),
            Some(_) => false,
        }
    }

    fn is_conjunction(e: &Expr) -> bool {
        match connective(e) {
            Some(Connective::And(a, b)) => is_conjunction(a) && is_conjunction(b),
            _ => is_literal(e),
        }
    }

    match connective(expr) {
        Some(Connective::Or(a, b)) => is_dnf(a) && is_dnf(b),
        _ => is_conjunction(expr),
    }
}

/// A view of one-bit nodes as boolean connectives.
enum Connective<'a> {
    Not(&'a Expr),
    And(&'a Expr, &'a Expr),
    Or(&'a Expr, &'a Expr),
    Xor(&'a Expr, &'a Expr),
    Ite(&'a Expr, &'a Expr, &'a Expr),
}

fn connective(e: &Expr) -> Option<Connective<'_>> {
    if e.bits() != 1 {
        return None;
    }
    match e.node() {
        ExprNode::Unary(UnOp::Not, a) => Some(Connective::Not(a)),
        ExprNode::Binary(BinOp::And, a, b) => Some(Connective::And(a, b)),
        ExprNode::Binary(BinOp::Or, a, b) => Some(Connective::Or(a, b)),
        ExprNode::Binary(BinOp::Xor, a, b) => Some(Connective::Xor(a, b)),
        ExprNode::Ternary(TernaryOp::IfThenElse, c, a, b) => Some(Connective::Ite(c, a, b)),
        _ => None,
    }
}

/// The clauses of the formula, or of its negation if `negated` is set.
fn dnf_clauses(e: &Expr, negated: bool) -> Vec<Vec<Expr>> {
    if let Some(value) = e.as_const() {
        return if value.is_true() != negated { vec![vec![]] } else { vec![] };
    }

    match (connective(e), negated) {
        (Some(Connective::Not(a)), _) => dnf_clauses(a, !negated),
        (Some(Connective::Or(a, b)), false) | (Some(Connective::And(a, b)), true) => {
            let mut clauses = dnf_clauses(a, negated);
            clauses.extend(dnf_clauses(b, negated));
            clauses
        },
        (Some(Connective::And(a, b)), false) | (Some(Connective::Or(a, b)), true) => {
            cross(dnf_clauses(a, negated), dnf_clauses(b, negated))
        },
        (Some(Connective::Xor(a, b)), _) => {
            // a ^ b == (a & !b) | (!a & b), and its negation swaps one side.
            let mut clauses = cross(dnf_clauses(a, false), dnf_clauses(b, !negated));
            clauses.extend(cross(dnf_clauses(a, true), dnf_clauses(b, negated)));
            clauses
        },
        (Some(Connective::Ite(c, a, b)), _) => {
            let mut clauses = cross(dnf_clauses(c, false), dnf_clauses(a, negated));
            clauses.extend(cross(dnf_clauses(c, true), dnf_clauses(b, negated)));
            clauses
        },
        (None, false) => vec![vec![e.clone()]],
        (None, true) => vec![vec![e.not()]],
    }
}

fn cross(left: Vec<Vec<Expr>>, right: Vec<Vec<Expr>>) -> Vec<Vec<Expr>> {
    let mut clauses = Vec::with_capacity(left.len() * right.len());
    for l in &left {
        for r in &right {
            let mut clause = l.clone();
            clause.extend(r.iter().cloned());
            clauses.push(clause);
        }
    }
    clauses
}

/// The level-0 rule for a single node whose children are already simplified.
fn level0(e: &Expr) -> Option<Expr> {
    match e.node() {
        ExprNode::Unary(op, a) => unary(*op, a),
        ExprNode::Binary(op, a, b) => binary(*op, a, b),
        ExprNode::Ternary(TernaryOp::IfThenElse, c, a, b) => {
            if let Some(cond) = c.as_const() {
                Some(if cond.is_true() { a.clone() } else { b.clone() })
            } else if a == b {
                Some(a.clone())
            } else {
                None
            }
        },
        _ => None,
    }
}

fn unary(op: UnOp, a: &Expr) -> Option<Expr> {
    if let Some(value) = a.as_const() {
        return Some(Expr::int(op.apply(value)));
    }

    match (op, a.node()) {
        (UnOp::Not, ExprNode::Unary(UnOp::Not, x)) => Some(x.clone()),
        (UnOp::Neg, ExprNode::Unary(UnOp::Neg, x)) => Some(x.clone()),

        // Negated comparisons flip into the complementary comparison.
        (UnOp::Not, ExprNode::Binary(cmp, x, y)) if cmp.is_comparison() => {
            Some(match cmp {
                BinOp::Eq => x.ne(y),
                BinOp::Ne => x.eq(y),
                BinOp::Ult => y.ule(x),
                BinOp::Ule => y.ult(x),
                BinOp::Slt => y.sle(x),
                BinOp::Sle => y.slt(x),
                _ => return None,
            })
        },

        (UnOp::Extract { offset: 0, size }, _) if size == a.bits() => Some(a.clone()),
        (UnOp::Extract { offset, size }, inner) => extract(offset, size, inner),

        (UnOp::ZeroExtend(bits), _) | (UnOp::SignExtend(bits), _) if bits == a.bits() => {
            Some(a.clone())
        },
        (UnOp::ZeroExtend(bits), ExprNode::Unary(UnOp::ZeroExtend(_), x)) => {
            Some(x.zero_extend(bits))
        },
        (UnOp::SignExtend(bits), ExprNode::Unary(UnOp::SignExtend(_), x)) => {
            Some(x.sign_extend(bits))
        },

        _ => None,
    }
}

fn extract(offset: u32, size: u32, inner: &ExprNode) -> Option<Expr> {
    match inner {
        ExprNode::Unary(UnOp::Extract { offset: first, .. }, x) => {
            Some(x.extract(first + offset, size))
        },
        ExprNode::Binary(BinOp::Concat, high, low) => {
            if offset + size <= low.bits() {
                Some(low.extract(offset, size))
            } else if offset >= low.bits() {
                Some(high.extract(offset - low.bits(), size))
            } else {
                None
            }
        },
        ExprNode::Unary(UnOp::ZeroExtend(_), x) => {
            if offset + size <= x.bits() {
                Some(x.extract(offset, size))
            } else if offset >= x.bits() {
                Some(Expr::constant(size, 0))
            } else {
                None
            }
        },
        ExprNode::Unary(UnOp::SignExtend(_), x) if offset + size <= x.bits() => {
            Some(x.extract(offset, size))
        },
        // Low bits of sums, products and bitwise operations only depend on
        // the low bits of their operands.
        ExprNode::Binary(op @ (BinOp::And | BinOp::Or | BinOp::Xor), x, y) => {
            Some(Expr::binary(*op, x.extract(offset, size), y.extract(offset, size)))
        },
        ExprNode::Binary(op @ (BinOp::Add | BinOp::Sub | BinOp::Mul), x, y)
            if offset == 0 && is_narrowable(x, size) && is_narrowable(y, size) => {
            Some(Expr::binary(*op, x.extract(0, size), y.extract(0, size)))
        },
        _ => None,
    }
}

/// Whether extracting the low bits of `e` makes the tree smaller, which is
/// what keeps pushing extractions through arithmetic terminating.
fn is_narrowable(e: &Expr, size: u32) -> bool {
    match e.node() {
        ExprNode::Constant(_) => true,
        ExprNode::Unary(UnOp::ZeroExtend(_), x) | ExprNode::Unary(UnOp::SignExtend(_), x) => {
            x.bits() >= size
        },
        ExprNode::Binary(BinOp::Concat, _, low) => low.bits() >= size,
        _ => false,
    }
}

fn binary(op: BinOp, a: &Expr, b: &Expr) -> Option<Expr> {
    use BinOp::*;

    let bits = a.bits();
    let zero = Integer::zero(bits);
    let one = Integer::new(bits, 1);

    match (a.as_const(), b.as_const()) {
        (Some(x), Some(y)) => return Some(Expr::int(op.apply(x, y))),
        // Constants go to the right of commutative operators.
        (Some(_), None) if op.is_commutative() => return Some(Expr::binary(op, b.clone(), a.clone())),
        _ => {},
    }

    let rhs = b.as_const();
    let lhs = a.as_const();

    match op {
        Add => {
            if rhs == Some(zero) {
                return Some(a.clone());
            }
            // (x + c1) + c2  =>  x + (c1 + c2)
            if let (Some(c2), ExprNode::Binary(Add, x, c1)) = (rhs, a.node()) {
                if let Some(c1) = c1.as_const() {
                    return Some(x.add(&Expr::int(c1 + c2)));
                }
            }
            None
        },
        Sub => {
            if a == b {
                Some(Expr::int(zero))
            } else if rhs == Some(zero) {
                Some(a.clone())
            } else if let Some(c) = rhs {
                Some(a.add(&Expr::int(-c)))
            } else if lhs == Some(zero) {
                Some(b.neg())
            } else {
                None
            }
        },
        Mul => {
            if rhs == Some(zero) {
                Some(Expr::int(zero))
            } else if rhs == Some(one) {
                Some(a.clone())
            } else {
                None
            }
        },
        UDiv => if rhs == Some(one) { Some(a.clone()) } else { None },
        URem => if rhs == Some(one) { Some(Expr::int(zero)) } else { None },
        And => {
            if a == b || rhs.map(Integer::is_ones) == Some(true) {
                Some(a.clone())
            } else if rhs == Some(zero) {
                Some(Expr::int(zero))
            } else {
                None
            }
        },
        Or => {
            if a == b || rhs == Some(zero) {
                Some(a.clone())
            } else if rhs.map(Integer::is_ones) == Some(true) {
                Some(b.clone())
            } else {
                None
            }
        },
        Xor => {
            if a == b {
                Some(Expr::int(zero))
            } else if rhs == Some(zero) {
                Some(a.clone())
            } else if bits == 1 && rhs == Some(one) {
                Some(a.not())
            } else {
                None
            }
        },
        Shl | Shr | Sar => {
            if rhs == Some(zero) {
                Some(a.clone())
            } else if lhs == Some(zero) {
                Some(a.clone())
            } else {
                None
            }
        },
        Concat => {
            // x[o+s2..] :: x[o..o+s2]  =>  x[o..]
            match (a.node(), b.node()) {
                (
                    ExprNode::Unary(UnOp::Extract { offset: ho, size: hs }, x),
                    ExprNode::Unary(UnOp::Extract { offset: lo, size: ls }, y),
                ) if x == y && lo + ls == *ho => Some(x.extract(*lo, ls + hs)),
                _ => None,
            }
        },
        Eq | Ule | Sle if a == b => Some(Expr::bool(true)),
        Ne | Ult | Slt if a == b => Some(Expr::bool(false)),
        Eq | Ne if bits == 1 => {
            // Comparisons of a truth value with a constant are the value itself.
            let c = rhs?;
            Some(if c.is_true() == (op == Eq) { a.clone() } else { a.not() })
        },
        Ult if rhs == Some(zero) => Some(Expr::bool(false)),
        Ule if lhs == Some(zero) => Some(Expr::bool(true)),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn n(x: u64) -> Expr { Expr::constant(32, x) }
    fn x() -> Expr { Expr::var("x", 32) }
    fn y() -> Expr { Expr::var("y", 32) }
    fn p() -> Expr { Expr::var("p", 1) }
    fn q() -> Expr { Expr::var("q", 1) }
    fn r() -> Expr { Expr::var("r", 1) }

    #[test]
    fn folding() {
        assert_eq!(simplify(&n(2).add(&n(3)).mul(&n(4))), n(20));
        assert_eq!(simplify(&n(0).sub(&n(1))), n(0xffff_ffff));
        assert_eq!(simplify(&n(7).eq(&n(7))), Expr::bool(true));
        assert_eq!(simplify(&n(0x1234).extract(8, 8)), Expr::constant(8, 0x12));
        assert_eq!(simplify(&Expr::ite(&n(1).ult(&n(2)), &x(), &y())), x());
    }

    #[test]
    fn identities() {
        assert_eq!(simplify(&x().add(&n(0))), x());
        assert_eq!(simplify(&n(0).add(&x())), x());
        assert_eq!(simplify(&x().sub(&x())), n(0));
        assert_eq!(simplify(&x().xor(&x())), n(0));
        assert_eq!(simplify(&x().mul(&n(1))), x());
        assert_eq!(simplify(&x().and(&n(0xffff_ffff))), x());
        assert_eq!(simplify(&x().not().not()), x());
        assert_eq!(simplify(&x().eq(&x())), Expr::bool(true));
        assert_eq!(simplify(&Expr::ite(&p(), &x(), &x())), x());
    }

    #[test]
    fn reassociation() {
        assert_eq!(simplify(&x().add(&n(5)).add(&n(10))), x().add(&n(15)));
        assert_eq!(simplify(&x().sub(&n(4)).add(&n(4))), x());
        assert_eq!(simplify(&n(8).add(&x()).sub(&n(8))), x());
    }

    #[test]
    fn bit_slicing() {
        let full = x().extract(8, 24).concat(&x().extract(0, 8));
        assert_eq!(simplify(&full), x());

        let bytes = x().extract(16, 8).concat(&x().extract(8, 8));
        assert_eq!(simplify(&bytes), x().extract(8, 16));

        let widened = x().extract(0, 8).zero_extend(32).extract(0, 8);
        assert_eq!(simplify(&widened), x().extract(0, 8));

        let upper = x().extract(0, 8).zero_extend(32).extract(8, 8);
        assert_eq!(simplify(&upper), Expr::constant(8, 0));

        let merged = y().extract(0, 24).concat(&x().extract(0, 8)).extract(0, 8);
        assert_eq!(simplify(&merged), x().extract(0, 8));

        let sum = x().add(&n(0x101)).extract(0, 8);
        assert_eq!(simplify(&sum), x().add(&n(0x101)).extract(0, 8));
    }

    #[test]
    fn flags() {
        assert_eq!(simplify(&p().eq(&Expr::bool(true))), p());
        assert_eq!(simplify(&p().eq(&Expr::bool(false))), p().not());
        assert_eq!(simplify(&x().eq(&y()).not()), x().ne(&y()));
        assert_eq!(simplify(&x().ult(&y()).not()), y().ule(&x()));
    }

    #[test]
    fn idempotence() {
        let samples = vec![
            x().add(&n(3)).sub(&n(1)).mul(&n(1)),
            x().extract(16, 16).concat(&x().extract(0, 16)).add(&y().xor(&y())),
            Expr::ite(&p().and(&Expr::bool(true)), &x().add(&n(1)), &x().sub(&n(0xffff_ffff))),
            x().eq(&y()).not().or(&p().not().not()).and(&q()),
            Expr::mem(x().add(&n(4)).add(&n(4)), 16).sign_extend(32).extract(0, 16),
        ];

        for e in samples {
            let once = simplify(&e);
            assert_eq!(simplify(&once), once, "not idempotent on {}", e);
        }
    }

    #[test]
    fn dnf_shape() {
        let samples = vec![
            p().or(&q()).and(&r()),
            p().or(&q()).and(&q().or(&r())).not(),
            p().xor(&q()).and(&r().not()),
            Expr::ite(&p(), &q().or(&r()), &x().eq(&y())),
            p().and(&q()).or(&r()).not().not(),
            x().ult(&y()).and(&p().or(&x().eq(&n(0))).not()),
        ];

        for e in samples {
            let dnf = rewrite_in_dnf(&e);
            assert!(is_dnf(&dnf), "not in dnf: {}", dnf);
        }

        assert!(!is_dnf(&p().or(&q()).and(&r())));
        assert_eq!(rewrite_in_dnf(&p().or(&q()).and(&r())), p().and(&r()).or(&q().and(&r())));
        assert_eq!(rewrite_in_dnf(&p().and(&p().not()).or(&Expr::bool(true))), Expr::bool(true));
    }
}
