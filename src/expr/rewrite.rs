//! Structural rewriting and pattern matching over expression trees.

use std::collections::BTreeMap;
use thiserror::Error;

use super::{Expr, ExprNode};


/// Variable bindings produced by a successful pattern match.
pub type Bindings = BTreeMap<String, Expr>;

/// The tree does not have the shape of the pattern.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("pattern does not match")]
pub struct NoMatch;

/// Apply a rule to every subtree, children before parents, and return the
/// new root.
///
/// The rule returns `None` to keep a node. Untouched subtrees are reused,
/// only the path from a rewritten node to the root is rebuilt.
pub fn bottom_up_rewrite<F>(tree: &Expr, rule: &mut F) -> Expr
where F: FnMut(&Expr) -> Option<Expr> {
    let result: Result<Expr, std::convert::Infallible> =
        try_bottom_up_rewrite(tree, &mut |e| Ok(rule(e)));
    match result {
        Ok(expr) => expr,
        Err(never) => match never {},
    }
}

/// Like [`bottom_up_rewrite`] with a rule that may fail. The first error
/// aborts the rewrite.
pub fn try_bottom_up_rewrite<F, E>(tree: &Expr, rule: &mut F) -> Result<Expr, E>
where F: FnMut(&Expr) -> Result<Option<Expr>, E> {
    let children = tree.children();
    let node = if children.is_empty() {
        tree.clone()
    } else {
        let mut changed = false;
        let mut rewritten = Vec::with_capacity(children.len());
        for child in children {
            let new = try_bottom_up_rewrite(child, rule)?;
            changed |= !new.ptr_eq(child);
            rewritten.push(new);
        }
        if changed { tree.with_children(rewritten) } else { tree.clone() }
    };

    Ok(rule(&node)?.unwrap_or(node))
}

/// Substitute every subterm structurally equal to `pattern` by `value`.
///
/// Matching is outermost first, so a replaced subterm is not searched again.
pub fn replace_subterm(tree: &Expr, pattern: &Expr, value: &Expr) -> Expr {
    if tree == pattern {
        return value.clone();
    }

    let children = tree.children();
    if children.is_empty() {
        return tree.clone();
    }

    let mut changed = false;
    let mut rewritten = Vec::with_capacity(children.len());
    for child in children {
        let new = replace_subterm(child, pattern, value);
        changed |= !new.ptr_eq(child);
        rewritten.push(new);
    }

    if changed { tree.with_children(rewritten) } else { tree.clone() }
}

/// Replace every occurrence of a named variable.
pub fn replace_variable(tree: &Expr, name: &str, value: &Expr) -> Expr {
    bottom_up_rewrite(tree, &mut |e| match e.node() {
        ExprNode::Variable(var, _) if var == name => Some(value.clone()),
        _ => None,
    })
}

/// Replace all bound variables by their bindings.
pub fn instantiate(tree: &Expr, bindings: &Bindings) -> Expr {
    bottom_up_rewrite(tree, &mut |e| match e.node() {
        ExprNode::Variable(var, _) => bindings.get(var).cloned(),
        _ => None,
    })
}

/// Match a tree against a pattern.
///
/// Variables of the pattern named in `free_vars` match any subtree of the
/// same width. Every other pattern node must be structurally present in the
/// tree. A variable appearing twice must bind structurally equal subtrees.
pub fn pattern_match(tree: &Expr, pattern: &Expr, free_vars: &[&str])
-> Result<Bindings, NoMatch> {
    let mut bindings = Bindings::new();
    match_into(tree, pattern, free_vars, &mut bindings)?;
    Ok(bindings)
}

fn match_into(tree: &Expr, pattern: &Expr, free_vars: &[&str], bindings: &mut Bindings)
-> Result<(), NoMatch> {
    if let ExprNode::Variable(name, bits) = pattern.node() {
        if free_vars.contains(&name.as_str()) {
            if *bits != tree.bits() {
                return Err(NoMatch);
            }
            return match bindings.get(name) {
                Some(bound) if bound != tree => Err(NoMatch),
                Some(_) => Ok(()),
                None => {
                    bindings.insert(name.clone(), tree.clone());
                    Ok(())
                },
            };
        }
    }

    if tree.bits() != pattern.bits() {
        return Err(NoMatch);
    }

    let same_head = match (tree.node(), pattern.node()) {
        (ExprNode::Constant(a), ExprNode::Constant(b)) => a == b,
        (ExprNode::Variable(a, x), ExprNode::Variable(b, y)) => a == b && x == y,
        (ExprNode::Register(a), ExprNode::Register(b)) => a == b,
        (ExprNode::MemCell(_, a, x), ExprNode::MemCell(_, b, y)) => a == b && x == y,
        (ExprNode::Unary(a, _), ExprNode::Unary(b, _)) => a == b,
        (ExprNode::Binary(a, _, _), ExprNode::Binary(b, _, _)) => a == b,
        (ExprNode::Ternary(a, ..), ExprNode::Ternary(b, ..)) => a == b,
        _ => false,
    };

    if !same_head {
        return Err(NoMatch);
    }

    for (child, sub) in tree.children().into_iter().zip(pattern.children()) {
        match_into(child, sub, free_vars, bindings)?;
    }

    Ok(())
}

/// The subtree bound to `var` when the tree matches the pattern, or `None`
/// if the tree does not match.
pub fn extract_binding(var: &str, tree: &Expr, pattern: &Expr, free_vars: &[&str])
-> Option<Expr> {
    pattern_match(tree, pattern, free_vars).ok()?.remove(var)
}

/// Rewrite every subtree matching `pattern` into `value` with the pattern's
/// bindings substituted, children before parents.
pub fn rewrite_pattern(tree: &Expr, pattern: &Expr, free_vars: &[&str], value: &Expr) -> Expr {
    bottom_up_rewrite(tree, &mut |e| {
        pattern_match(e, pattern, free_vars).ok()
            .map(|bindings| instantiate(value, &bindings))
    })
}

/// The distinct address expressions of all memory cells in the tree, in
/// order of first occurrence.
pub fn collect_memcell_addresses(tree: &Expr) -> Vec<Expr> {
    let mut addresses: Vec<Expr> = vec![];
    tree.traverse(&mut |e| {
        if let ExprNode::MemCell(addr, offset, _) = e.node() {
            let addr = if *offset == 0 {
                addr.clone()
            } else {
                addr.add(&Expr::constant(addr.bits(), *offset))
            };
            if !addresses.contains(&addr) {
                addresses.push(addr);
            }
        }
    });
    addresses
}

/// The names of all free variables in the tree with their widths.
pub fn collect_variables(tree: &Expr) -> BTreeMap<String, u32> {
    let mut vars = BTreeMap::new();
    tree.traverse(&mut |e| {
        if let ExprNode::Variable(name, bits) = e.node() {
            vars.insert(name.clone(), *bits);
        }
    });
    vars
}


#[cfg(test)]
mod tests {
    use super::*;

    fn n(x: u64) -> Expr { Expr::constant(32, x) }
    fn x() -> Expr { Expr::var("x", 32) }
    fn y() -> Expr { Expr::var("y", 32) }
    fn a() -> Expr { Expr::var("A", 32) }

    #[test]
    fn replacing() {
        let tree = x().add(&n(1)).mul(&x().add(&n(1)));
        let replaced = replace_subterm(&tree, &x().add(&n(1)), &y());
        assert_eq!(replaced, y().mul(&y()));

        let unrelated = y().sub(&n(3));
        let tree = unrelated.add(&x());
        let replaced = replace_variable(&tree, "x", &n(7));
        assert_eq!(replaced, unrelated.add(&n(7)));

        // The untouched subtree is shared with the original.
        match replaced.node() {
            ExprNode::Binary(_, left, _) => assert!(left.ptr_eq(&unrelated)),
            _ => panic!("expected binary node"),
        }
    }

    #[test]
    fn unchanged_trees_are_reused() {
        let tree = x().add(&n(1)).sub(&y());
        let same = bottom_up_rewrite(&tree, &mut |_| None);
        assert!(same.ptr_eq(&tree));
    }

    #[test]
    fn rewrite_order() {
        let tree = x().add(&y());
        let mut seen = vec![];
        bottom_up_rewrite(&tree, &mut |e| { seen.push(e.to_string()); None });
        assert_eq!(seen, ["x", "y", "(x + y)"]);

        let failed: Result<Expr, &str> = try_bottom_up_rewrite(&tree, &mut |e| {
            if e == &y() { Err("y") } else { Ok(None) }
        });
        assert_eq!(failed, Err("y"));
    }

    #[test]
    fn matching() {
        let pattern = a().add(&n(1));
        let bindings = pattern_match(&x().mul(&y()).add(&n(1)), &pattern, &["A"]).unwrap();
        assert_eq!(bindings["A"], x().mul(&y()));

        assert_eq!(pattern_match(&x().add(&n(2)), &pattern, &["A"]), Err(NoMatch));
        assert_eq!(pattern_match(&x().sub(&n(1)), &pattern, &["A"]), Err(NoMatch));

        // Consistent bindings for repeated variables.
        let twice = a().add(&a());
        assert!(pattern_match(&x().add(&x()), &twice, &["A"]).is_ok());
        assert_eq!(pattern_match(&x().add(&y()), &twice, &["A"]), Err(NoMatch));

        // Non-free variables must match exactly.
        assert!(pattern_match(&x(), &a(), &[]).is_err());
        assert!(pattern_match(&x(), &x(), &[]).is_ok());
    }

    #[test]
    fn extracting() {
        let pattern = Expr::mem(a(), 32);
        assert_eq!(extract_binding("A", &Expr::mem(x(), 32), &pattern, &["A"]), Some(x()));
        assert_eq!(extract_binding("A", &x(), &pattern, &["A"]), None);
    }

    #[test]
    fn pattern_rewriting() {
        // A - B  =>  A + -B
        let b = Expr::var("B", 32);
        let tree = x().sub(&y()).sub(&n(2));
        let rewritten = rewrite_pattern(&tree, &a().sub(&b), &["A", "B"], &a().add(&b.neg()));
        assert_eq!(rewritten, x().add(&y().neg()).add(&n(2).neg()));
    }

    #[test]
    fn memcells() {
        let tree = Expr::mem(x(), 8).zero_extend(32).add(&Expr::memcell(x(), 4, 32))
            .add(&Expr::mem(x(), 32));
        assert_eq!(collect_memcell_addresses(&tree), vec![x(), x().add(&n(4))]);
        assert_eq!(collect_variables(&tree).len(), 1);
    }
}
