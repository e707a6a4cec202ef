//! Visualization of recovered programs as graphviz files.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Result, Write};

use crate::ir::{Microcode, MicrocodeAddress, Statement, Target, Unresolved};
use crate::loader::SymbolTable;

pub const BR: &str = "<br align=\"left\"/>";


/// Write the instruction level graph: one box per decoded instruction with
/// the internal steps of each instruction collapsed.
///
/// Instructions are coloured by the symbol they belong to and the
/// entrypoint is drawn in red.
pub fn write_instruction_graph<W: Write>(
    mut f: W,
    program: &Microcode,
    symbols: &SymbolTable,
    title: &str,
) -> Result<()> {
    write_header(&mut f, &format!("Control flow graph for {}", escape(title)))?;

    let instructions: Vec<MicrocodeAddress> = program.nodes()
        .map(|node| node.addr)
        .filter(|addr| addr.is_boundary())
        .collect();

    let mut ids = Ids::default();
    let mut used_symbols = BTreeMap::new();

    for &addr in &instructions {
        let id = ids.get(addr);
        write!(f, "b{} [label=<<b>{:x}", id, addr.global)?;
        if let Some(name) = symbols.name(addr.global) {
            write!(f, " &lt;{}&gt;", escape(name))?;
        }
        write!(f, "</b>{}", BR)?;
        if let Some(annotation) = program.get_node(addr).ok().and_then(|n| n.annotation.as_ref()) {
            write!(f, "{}{}", escape(annotation), BR)?;
        }
        write!(f, ">, shape=box")?;

        if let Some((_, name)) = symbols.containing(addr.global) {
            let color = symbol_color(name);
            used_symbols.insert(name.to_string(), color);
            write!(f, ", style=filled, fillcolor=\"#{:06x}\"", color)?;
        } else if program.successor_instructions(addr).is_empty() {
            write!(f, ", style=filled, fillcolor=\"#dddddd\"")?;
        }

        if program.entrypoint == Some(addr) {
            write!(f, ", color=red, peripheries=2")?;
        }
        writeln!(f, "]")?;
    }

    // Targets without a node show why they are missing.
    let mut missing = BTreeSet::new();
    for &addr in &instructions {
        for target in program.successor_instructions(addr) {
            if !program.contains(target) {
                missing.insert(target);
            }
        }
    }
    let reasons: BTreeMap<_, _> = program.unresolved().collect();
    for &target in &missing {
        let reason = match reasons.get(&target) {
            Some(Unresolved::OutOfBounds) => "out of bounds",
            Some(Unresolved::Unexplored) | None => "unexplored",
            Some(Unresolved::DynamicJump(_)) => "unresolved",
        };
        writeln!(
            f, "b{} [label=<<b>{:x}</b>{}{}{}>, shape=box, style=dashed]",
            ids.get(target), target.global, BR, reason, BR,
        )?;
    }

    for &addr in &instructions {
        for target in program.successor_instructions(addr) {
            writeln!(f, "b{} -> b{} [color=grey]", ids.get(addr), ids.get(target))?;
        }
    }

    for (addr, target) in program.unresolved_jumps() {
        let site = MicrocodeAddress::instruction(addr.global);
        let id = ids.get(site);
        writeln!(f, "u{} [label=<{}>, shape=plaintext]", id, escape(&target.to_string()))?;
        writeln!(f, "b{} -> u{} [style=dashed, color=red]", id, id)?;
    }

    if !used_symbols.is_empty() {
        writeln!(f, "subgraph cluster_symbols {{")?;
        writeln!(f, "label=\"Symbols\"")?;
        for (index, (name, color)) in used_symbols.iter().enumerate() {
            writeln!(
                f, "s{} [label=<{}>, shape=box, style=filled, fillcolor=\"#{:06x}\"]",
                index, escape(name), color,
            )?;
        }
        writeln!(f, "}}")?;
    }

    write_footer(&mut f)
}

/// Write every micro step with guards and statements on the edges.
pub fn write_microcode_graph<W: Write>(mut f: W, program: &Microcode, title: &str) -> Result<()> {
    write_header(&mut f, &format!("Microcode of {}", escape(title)))?;

    let mut ids = Ids::default();
    for node in program.nodes() {
        write!(f, "b{} [label=<<b>{}</b>", ids.get(node.addr), node.addr)?;
        if let Some(annotation) = &node.annotation {
            write!(f, "{}{}", BR, escape(annotation))?;
        }
        write!(f, ">, shape=box")?;
        if program.entrypoint == Some(node.addr) {
            write!(f, ", color=red, peripheries=2")?;
        }
        writeln!(f, "]")?;
    }

    for node in program.nodes() {
        let from = ids.get(node.addr);
        for arrow in &node.arrows {
            let mut label = String::new();
            if !arrow.guard.is_true() {
                label.push_str(&format!("if {}{}", escape(&arrow.guard.to_string()), BR));
            }
            if let Statement::Assign { lvalue, rhs } = &arrow.stmt {
                label.push_str(&escape(&format!("{} := {}", lvalue, rhs)));
                label.push_str(BR);
            }

            match &arrow.target {
                Target::Static(to) => {
                    writeln!(f, "b{} -> b{} [label=<{}>]", from, ids.get(*to), label)?;
                },
                Target::Dynamic(target) => {
                    label.push_str(&format!("goto {}", escape(&target.to_string())));
                    for to in &node.resolved {
                        writeln!(f, "b{} -> b{} [label=<{}>, style=dashed]", from, ids.get(*to), label)?;
                    }
                },
            }
        }
    }

    write_footer(&mut f)
}

/// Write the preamble of the graphviz file.
fn write_header<W: Write>(mut f: W, title: &str) -> Result<()> {
    writeln!(f, "digraph Flow {{")?;
    writeln!(f, "label=<{}<br/><br/>>", title)?;
    writeln!(f, "labelloc=\"t\"")?;
    writeln!(f, "graph [fontname=\"Source Code Pro\"]")?;
    writeln!(f, "node [fontname=\"Source Code Pro\"]")?;
    writeln!(f, "edge [fontname=\"Source Code Pro\"]")
}

/// Write the closing of the file.
fn write_footer<W: Write>(mut f: W) -> Result<()> {
    writeln!(f, "}}")
}

/// Stable node identifiers in order of first use.
#[derive(Default)]
struct Ids(BTreeMap<MicrocodeAddress, usize>);

impl Ids {
    fn get(&mut self, addr: MicrocodeAddress) -> usize {
        let next = self.0.len();
        *self.0.entry(addr).or_insert(next)
    }
}

/// A light colour derived from the symbol name.
fn symbol_color(name: &str) -> u32 {
    let rgb = name.bytes().fold(0u64, |rgb, c| {
        (0x3141596 * c as u64).wrapping_add(rgb << 3)
    });
    (rgb as u32 & 0xffffff) | 0x808080
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;

    fn at(global: u64, local: u32) -> MicrocodeAddress {
        MicrocodeAddress::new(global, local)
    }

    fn program() -> Microcode {
        let mut mc = Microcode::new();
        let x = Expr::var("x", 1);
        mc.add_skip(at(0x10, 0), at(0x10, 1), x.clone());
        mc.add_skip(at(0x10, 0), at(0x20, 0), x.not());
        mc.add_fallthrough(at(0x10, 1), at(0x9000, 0));
        mc.annotate(at(0x10, 0), "jcc <somewhere>".into());
        mc.add_jump(at(0x20, 0), Expr::var("t", 32));
        mc.mark_unresolved(at(0x20, 0), Unresolved::DynamicJump(Expr::var("t", 32)));
        mc.mark_unresolved(at(0x9000, 0), Unresolved::OutOfBounds);
        mc.entrypoint = Some(at(0x10, 0));
        mc
    }

    fn render<F>(writer: F) -> String where F: FnOnce(&mut Vec<u8>) -> Result<()> {
        let mut out = vec![];
        writer(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn instruction_graph() {
        let mut symbols = SymbolTable::new();
        symbols.insert(0x10, "main");
        let dot = render(|out| write_instruction_graph(out, &program(), &symbols, "test"));

        assert!(dot.starts_with("digraph Flow {"));
        assert!(dot.ends_with("}\n"));
        assert!(dot.contains("b0 [label=<<b>10 &lt;main&gt;</b>"));
        assert!(dot.contains("jcc &lt;somewhere&gt;"));
        assert!(dot.contains("color=red, peripheries=2"));
        assert!(dot.contains("out of bounds"));
        assert!(dot.contains("b0 -> b1 [color=grey]"));
        assert!(dot.contains("subgraph cluster_symbols"));
        assert!(!dot.contains("10.1"));
    }

    #[test]
    fn microcode_graph() {
        let dot = render(|out| write_microcode_graph(out, &program(), "test"));
        assert!(dot.contains("<b>0x10.1</b>"));
        assert!(dot.contains("if x"));
        assert!(dot.contains("if (!x)"));
    }

    #[test]
    fn colors_are_light() {
        for name in &["main", "_start", "helper"] {
            assert_eq!(symbol_color(name) & 0x808080, 0x808080);
        }
        assert_eq!(symbol_color("main"), symbol_color("main"));
    }
}
