//! Microcode: the graph that machine instructions are lowered into.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::ops::Add;
use thiserror::Error;

use crate::expr::{Expr, ExprNode};


/// Identifies one micro step: the address of the machine instruction and
/// the index of the step within its lowering.
///
/// Local index zero is the instruction boundary.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MicrocodeAddress {
    pub global: u64,
    pub local: u32,
}

impl MicrocodeAddress {
    /// Create a new address.
    pub fn new(global: u64, local: u32) -> MicrocodeAddress {
        MicrocodeAddress { global, local }
    }

    /// The boundary address of an instruction.
    pub fn instruction(global: u64) -> MicrocodeAddress {
        MicrocodeAddress { global, local: 0 }
    }

    /// Whether this is the first step of an instruction.
    pub fn is_boundary(self) -> bool {
        self.local == 0
    }
}

/// Moves the local index forward.
impl Add<u32> for MicrocodeAddress {
    type Output = MicrocodeAddress;

    fn add(self, steps: u32) -> MicrocodeAddress {
        MicrocodeAddress::new(self.global, self.local + steps)
    }
}

impl Display for MicrocodeAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:#x}.{}", self.global, self.local)
    }
}

/// What happens when an arrow is taken.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Statement {
    Skip,
    /// Store the right hand side into a register or memory cell.
    Assign { lvalue: Expr, rhs: Expr },
}

impl Display for Statement {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Statement::Skip => write!(f, "skip"),
            Statement::Assign { lvalue, rhs } => write!(f, "{} := {}", lvalue, rhs),
        }
    }
}

/// Where an arrow leads.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Target {
    Static(MicrocodeAddress),
    /// A target computed at run time, evaluating to an instruction address.
    Dynamic(Expr),
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Target::Static(addr) => write!(f, "{}", addr),
            Target::Dynamic(expr) => write!(f, "*{}", expr),
        }
    }
}

/// A guarded edge of the microcode graph.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Arrow {
    pub src: MicrocodeAddress,
    pub target: Target,
    pub guard: Expr,
    pub stmt: Statement,
}

impl Arrow {
    /// The static target, if any.
    pub fn static_target(&self) -> Option<MicrocodeAddress> {
        match self.target {
            Target::Static(addr) => Some(addr),
            Target::Dynamic(_) => None,
        }
    }
}

impl Display for Arrow {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.target)?;
        if !self.guard.is_true() {
            write!(f, " if {}", self.guard)?;
        }
        if self.stmt != Statement::Skip {
            write!(f, " do {}", self.stmt)?;
        }
        Ok(())
    }
}

/// A node of the graph with its outgoing arrows.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Node {
    pub addr: MicrocodeAddress,
    pub arrows: Vec<Arrow>,
    /// Disassembly of the instruction, set on boundary nodes.
    pub annotation: Option<String>,
    /// Targets that dynamic arrows of this node were resolved to.
    pub resolved: BTreeSet<MicrocodeAddress>,
}

impl Node {
    fn new(addr: MicrocodeAddress) -> Node {
        Node { addr, arrows: vec![], annotation: None, resolved: BTreeSet::new() }
    }
}

/// Why a target address was left without a node.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Unresolved {
    /// The target lies outside of the memory image.
    OutOfBounds,
    /// A dynamic jump at this address could not be reduced to a bounded
    /// set of targets.
    DynamicJump(Expr),
    /// The target was reached by the graph but the exploration stopped
    /// before getting there.
    Unexplored,
}

/// There is no node at the address.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("no microcode node at {0}")]
pub struct NodeNotFound(pub MicrocodeAddress);

/// The partially discovered program.
///
/// Nodes are only ever added, so the graph grows monotonically during a
/// recovery run. A node is present exactly when its instruction was decoded.
#[derive(Debug, Clone, Default)]
pub struct Microcode {
    nodes: BTreeMap<MicrocodeAddress, Node>,
    unresolved: BTreeMap<MicrocodeAddress, Unresolved>,
    pub entrypoint: Option<MicrocodeAddress>,
}

impl Microcode {
    /// Create an empty graph.
    pub fn new() -> Microcode {
        Microcode::default()
    }

    /// Make sure a node exists at the address.
    pub fn add_node(&mut self, addr: MicrocodeAddress) -> &mut Node {
        self.nodes.entry(addr).or_insert_with(|| Node::new(addr))
    }

    /// Add a guarded arrow without a statement. An existing skip between the
    /// same addresses gets its guard replaced.
    pub fn add_skip(&mut self, from: MicrocodeAddress, to: MicrocodeAddress, guard: Expr) {
        assert_eq!(guard.bits(), 1, "guards must be one bit wide");
        let node = self.add_node(from);
        let target = Target::Static(to);
        let existing = node.arrows.iter_mut()
            .find(|arrow| arrow.target == target && arrow.stmt == Statement::Skip);

        match existing {
            Some(arrow) => arrow.guard = guard,
            None => node.arrows.push(Arrow { src: from, target, guard, stmt: Statement::Skip }),
        }
    }

    /// Add an unconditional skip.
    pub fn add_fallthrough(&mut self, from: MicrocodeAddress, to: MicrocodeAddress) {
        self.add_skip(from, to, Expr::bool(true));
    }

    /// Add an assignment arrow leading to `to`, or to the next local step.
    /// Returns the target.
    pub fn add_assignment(
        &mut self,
        from: MicrocodeAddress,
        lvalue: Expr,
        rhs: Expr,
        to: Option<MicrocodeAddress>,
    ) -> MicrocodeAddress {
        assert!(
            matches!(lvalue.node(), ExprNode::Register(_) | ExprNode::MemCell(..)),
            "cannot assign to {}", lvalue,
        );
        assert_eq!(lvalue.bits(), rhs.bits(), "assignment of {} to {} changes width", rhs, lvalue);

        let to = to.unwrap_or(from + 1);
        self.add_node(from).arrows.push(Arrow {
            src: from,
            target: Target::Static(to),
            guard: Expr::bool(true),
            stmt: Statement::Assign { lvalue, rhs },
        });
        to
    }

    /// Add a dynamic arrow whose target is computed at run time.
    pub fn add_jump(&mut self, from: MicrocodeAddress, target: Expr) {
        self.add_guarded_jump(from, target, Expr::bool(true));
    }

    /// Add a dynamic arrow that is only taken under a guard.
    pub fn add_guarded_jump(&mut self, from: MicrocodeAddress, target: Expr, guard: Expr) {
        assert_eq!(guard.bits(), 1, "guards must be one bit wide");
        self.add_node(from).arrows.push(Arrow {
            src: from,
            target: Target::Dynamic(target),
            guard,
            stmt: Statement::Skip,
        });
    }

    /// Attach the disassembly to an instruction.
    pub fn annotate(&mut self, addr: MicrocodeAddress, text: String) {
        self.add_node(addr).annotation = Some(text);
    }

    /// Remember that a dynamic arrow at `from` led to `to`.
    pub fn add_resolved_target(&mut self, from: MicrocodeAddress, to: MicrocodeAddress) {
        self.add_node(from).resolved.insert(to);
    }

    /// Record an address that will not get a node.
    pub fn mark_unresolved(&mut self, addr: MicrocodeAddress, reason: Unresolved) {
        self.unresolved.insert(addr, reason);
    }

    /// The node at the address.
    pub fn get_node(&self, addr: MicrocodeAddress) -> Result<&Node, NodeNotFound> {
        self.nodes.get(&addr).ok_or(NodeNotFound(addr))
    }

    /// Whether a node exists at the address.
    pub fn contains(&self, addr: MicrocodeAddress) -> bool {
        self.nodes.contains_key(&addr)
    }

    /// All nodes ordered by address.
    pub fn nodes(&self) -> impl Iterator<Item=&Node> {
        self.nodes.values()
    }

    /// The number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The recorded unresolved addresses.
    pub fn unresolved(&self) -> impl Iterator<Item=(&MicrocodeAddress, &Unresolved)> {
        self.unresolved.iter()
    }

    /// The jump sites whose dynamic targets could not be resolved.
    pub fn unresolved_jumps(&self) -> impl Iterator<Item=(MicrocodeAddress, &Expr)> {
        self.unresolved.iter().filter_map(|(addr, reason)| match reason {
            Unresolved::DynamicJump(target) => Some((*addr, target)),
            Unresolved::OutOfBounds | Unresolved::Unexplored => None,
        })
    }

    /// Targets of arrows that neither have a node nor were recorded as
    /// unresolved.
    pub fn dangling_targets(&self) -> BTreeSet<MicrocodeAddress> {
        self.nodes.values()
            .flat_map(|node| {
                node.arrows.iter().filter_map(Arrow::static_target)
                    .chain(node.resolved.iter().copied())
            })
            .filter(|target| !self.nodes.contains_key(target)
                && !self.unresolved.contains_key(target))
            .collect()
    }

    /// The instruction boundaries directly reachable from the node,
    /// looking through the internal steps of its instruction.
    pub fn successor_instructions(&self, addr: MicrocodeAddress) -> BTreeSet<MicrocodeAddress> {
        let mut result = BTreeSet::new();
        let mut seen = BTreeSet::new();
        self.collect_successors(addr, &mut result, &mut seen);
        result
    }

    fn collect_successors(
        &self,
        addr: MicrocodeAddress,
        result: &mut BTreeSet<MicrocodeAddress>,
        seen: &mut BTreeSet<MicrocodeAddress>,
    ) {
        let node = match self.nodes.get(&addr) {
            Some(node) => node,
            None => return,
        };

        let targets = node.arrows.iter().filter_map(Arrow::static_target)
            .chain(node.resolved.iter().copied());

        for target in targets {
            if target.is_boundary() {
                result.insert(target);
            } else if seen.insert(target) {
                self.collect_successors(target, result, seen);
            }
        }
    }
}

impl Display for Microcode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "Microcode [")?;
        if !self.nodes.is_empty() {
            writeln!(f)?;
        }
        for node in self.nodes.values() {
            if let Some(annotation) = &node.annotation {
                writeln!(f, "    {}: {}", node.addr, annotation)?;
            }
            for arrow in &node.arrows {
                writeln!(f, "        {}", arrow)?;
            }
        }
        write!(f, "]")
    }
}
