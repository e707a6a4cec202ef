//! Stepping symbolic states along the arrows of the microcode graph.

use std::rc::Rc;
use log::{debug, warn};

use super::{SymbolicMemory, SymbolicState};
use crate::arch::Architecture;
use crate::concrete::{ConcreteMemory, UndefinedValue};
use crate::config::DynamicJumpPolicy;
use crate::decoder::{DecodeError, Decoder};
use crate::expr::{simplify, try_bottom_up_rewrite, Expr, ExprNode};
use crate::ir::{Arrow, Microcode, MicrocodeAddress, Statement, Target, Unresolved};
use crate::num::mask;
use crate::solver::Solver;


/// Advances symbolic states one micro step at a time.
///
/// The simulator owns the microcode graph while it is being discovered and
/// asks the decoder for instructions the first time a state reaches them.
pub struct Simulator<D, S> {
    program: Microcode,
    decoder: D,
    solver: S,
    memory: Rc<ConcreteMemory>,
    policy: DynamicJumpPolicy,
    arrow_queries: usize,
}

impl<D: Decoder, S: Solver> Simulator<D, S> {
    /// Create a simulator over a memory image.
    pub fn new(decoder: D, solver: S, memory: Rc<ConcreteMemory>, policy: DynamicJumpPolicy)
    -> Simulator<D, S> {
        Simulator {
            program: Microcode::new(),
            decoder,
            solver,
            memory,
            policy,
            arrow_queries: 0,
        }
    }

    /// The initial state at an entrypoint with some registers seeded.
    pub fn init(&self, entry: u64, registers: &[(String, u64)])
    -> Result<SymbolicState, UndefinedValue> {
        let arch = self.decoder.arch();
        let mut memory = SymbolicMemory::new(self.memory.clone(), arch.endianness);
        for (name, value) in registers {
            match arch.register(name) {
                Some(reg) => memory.set_register(&reg, &Expr::constant(reg.size, *value))?,
                None => warn!("ignoring unknown register {} in initial state", name),
            }
        }

        Ok(SymbolicState {
            pc: MicrocodeAddress::instruction(entry),
            memory,
            path_condition: Expr::bool(true),
        })
    }

    /// The outgoing arrows at the state's location, decoding the instruction
    /// if it was not seen before.
    pub fn get_arrows(&mut self, state: &SymbolicState) -> Result<Vec<Arrow>, DecodeError> {
        self.arrow_queries += 1;

        let pc = state.pc;
        let instruction = MicrocodeAddress::instruction(pc.global);
        if !self.program.contains(instruction) {
            debug!("decoding instruction at {:#x}", pc.global);
            self.decoder.decode(&mut self.program, &self.memory, pc.global)?;
        }

        Ok(self.program.get_node(pc)
            .map(|node| node.arrows.clone())
            .unwrap_or_default())
    }

    /// Take an arrow from a state.
    ///
    /// Returns no state if the guard is infeasible, one state for static
    /// arrows and possibly several for dynamic arrows with symbolic targets.
    pub fn step(&mut self, state: &SymbolicState, arrow: &Arrow)
    -> Result<Vec<SymbolicState>, UndefinedValue> {
        let guard = self.eval(state, &arrow.guard)?;
        let path_condition = match self.restrict(&state.path_condition, &guard) {
            Some(condition) => condition,
            None => {
                debug!("infeasible arrow {}", arrow);
                return Ok(vec![]);
            },
        };

        // Dynamic targets are evaluated before the statement runs.
        let targets = match &arrow.target {
            Target::Static(to) => vec![(*to, path_condition)],
            Target::Dynamic(expr) => {
                let target = self.eval(state, expr)?;
                self.resolve_dynamic(arrow.src, &target, &path_condition)
            },
        };

        let mut next = state.clone();
        self.exec(&mut next, &arrow.stmt)?;

        Ok(targets.into_iter()
            .map(|(pc, path_condition)| SymbolicState {
                pc,
                memory: next.memory.clone(),
                path_condition,
            })
            .collect())
    }

    /// Run a statement on a state.
    pub fn exec(&self, state: &mut SymbolicState, stmt: &Statement) -> Result<(), UndefinedValue> {
        let (lvalue, rhs) = match stmt {
            Statement::Skip => return Ok(()),
            Statement::Assign { lvalue, rhs } => (lvalue, rhs),
        };

        let value = self.eval(state, rhs)?;
        match lvalue.node() {
            ExprNode::Register(reg) => state.memory.set_register(reg, &value),
            ExprNode::MemCell(addr, offset, _) => {
                let addr = self.eval(state, addr)?;
                let addr = concrete_address(&addr, *offset)?;
                state.memory.put(addr, &value);
                Ok(())
            },
            _ => panic!("exec: cannot assign to {}", lvalue),
        }
    }

    /// Substitute the current values of all registers and memory cells and
    /// simplify.
    pub fn eval(&self, state: &SymbolicState, expr: &Expr) -> Result<Expr, UndefinedValue> {
        let substituted = try_bottom_up_rewrite(expr, &mut |e| match e.node() {
            ExprNode::Register(reg) => state.memory.get_register(reg).map(Some),
            ExprNode::MemCell(addr, offset, bits) => {
                let addr = concrete_address(&simplify(addr), *offset)?;
                state.memory.get(addr, *bits).map(Some)
            },
            _ => Ok(None),
        })?;
        Ok(simplify(&substituted))
    }

    /// The path conditions of both sides of a branch on `cond`, each `None`
    /// if that side is infeasible.
    pub fn split(&mut self, state: &SymbolicState, cond: &Expr) -> (Option<Expr>, Option<Expr>) {
        let taken = self.restrict(&state.path_condition, cond);
        let not_taken = self.restrict(&state.path_condition, &cond.not());
        (taken, not_taken)
    }

    /// The path condition strengthened by a guard, unless that is infeasible.
    fn restrict(&mut self, path_condition: &Expr, guard: &Expr) -> Option<Expr> {
        match to_bool(guard) {
            Some(true) => return Some(path_condition.clone()),
            Some(false) => return None,
            None => {},
        }

        let restricted = simplify(&path_condition.and(guard));
        if self.is_feasible(&restricted) { Some(restricted) } else { None }
    }

    /// Ask the solver whether a formula is satisfiable. Solver failures
    /// count as feasible.
    pub fn is_feasible(&mut self, formula: &Expr) -> bool {
        if let Some(value) = to_bool(formula) {
            return value;
        }
        match self.solver.check_sat(formula) {
            Ok(result) => result.is_feasible(),
            Err(err) => {
                warn!("{} solver failed on {}: {}", self.solver.name(), formula, err);
                true
            },
        }
    }

    /// The successors of a dynamic jump to an evaluated target.
    fn resolve_dynamic(&mut self, src: MicrocodeAddress, target: &Expr, path_condition: &Expr)
    -> Vec<(MicrocodeAddress, Expr)> {
        if let Some(value) = target.as_const() {
            let to = MicrocodeAddress::instruction(value.value());
            self.program.add_resolved_target(src, to);
            return vec![(to, path_condition.clone())];
        }

        if !self.policy.map_to_memory || self.policy.threshold == 0 {
            warn!("unresolved dynamic jump at {} to {}", src, target);
            self.program.mark_unresolved(src, Unresolved::DynamicJump(target.clone()));
            return vec![];
        }

        let bits = target.bits();
        let mut found = vec![];
        let mut remaining = path_condition.clone();
        for addr in self.memory.defined_addresses() {
            if found.len() >= self.policy.threshold || addr > mask(bits) {
                break;
            }

            let candidate = Expr::constant(bits, addr);
            let condition = simplify(&path_condition.and(&target.eq(&candidate)));
            if self.is_feasible(&condition) {
                remaining = remaining.and(&target.ne(&candidate));
                found.push((MicrocodeAddress::instruction(addr), condition));
            }
        }

        if self.is_feasible(&simplify(&remaining)) {
            warn!("dynamic jump at {} to {} has more than {} targets", src, target, found.len());
            self.program.mark_unresolved(src, Unresolved::DynamicJump(target.clone()));
        }

        for (to, _) in &found {
            self.program.add_resolved_target(src, *to);
        }

        found
    }

    /// The graph discovered so far.
    pub fn program(&self) -> &Microcode {
        &self.program
    }

    /// Mutable access to the graph.
    pub fn program_mut(&mut self) -> &mut Microcode {
        &mut self.program
    }

    /// Give up the simulator and keep the graph.
    pub fn into_program(self) -> Microcode {
        self.program
    }

    /// The architecture of the decoder.
    pub fn arch(&self) -> &Architecture {
        self.decoder.arch()
    }

    /// The concrete base image.
    pub fn memory(&self) -> &Rc<ConcreteMemory> {
        &self.memory
    }

    /// How often arrows were requested.
    pub fn arrow_queries(&self) -> usize {
        self.arrow_queries
    }
}

/// The truth value of a constant formula.
pub fn to_bool(expr: &Expr) -> Option<bool> {
    if expr.bits() != 1 {
        return None;
    }
    expr.as_const().map(|value| value.is_true())
}

fn concrete_address(addr: &Expr, offset: u64) -> Result<u64, UndefinedValue> {
    match addr.as_const() {
        Some(value) => Ok(value.value().wrapping_add(offset) & mask(addr.bits())),
        None => Err(UndefinedValue::SymbolicAddress(addr.clone())),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::num::Integer;
    use crate::solver::{Satisfiability, SimplifySolver, SolverError};

    /// A decoder for graphs that were built by hand.
    struct Prebuilt(Architecture);

    impl Decoder for Prebuilt {
        fn arch(&self) -> &Architecture {
            &self.0
        }

        fn decode(&mut self, _: &mut Microcode, _: &ConcreteMemory, addr: u64)
        -> Result<u64, DecodeError> {
            Err(DecodeError::Unsupported { addr, bytes: vec![] })
        }

        fn next_address(&self, _: &ConcreteMemory, addr: u64) -> Result<u64, DecodeError> {
            Ok(addr + 1)
        }
    }

    /// Answers every query with the same verdict.
    struct Fixed(Satisfiability);

    impl Solver for Fixed {
        fn name(&self) -> &str { "fixed" }
        fn check_sat(&mut self, _: &Expr) -> Result<Satisfiability, SolverError> { Ok(self.0) }
    }

    fn at(global: u64) -> MicrocodeAddress { MicrocodeAddress::instruction(global) }

    fn simulator<S: Solver>(solver: S, policy: DynamicJumpPolicy) -> Simulator<Prebuilt, S> {
        let mut image = ConcreteMemory::new();
        image.put_bytes(0x10, &[0x90; 8]);
        image.put(0x100, Integer::new(32, 0x14), crate::num::Endianness::Little);
        Simulator::new(Prebuilt(Architecture::x86_32()), solver, Rc::new(image), policy)
    }

    fn reg<D: Decoder, S: Solver>(sim: &Simulator<D, S>, name: &str) -> Expr {
        Expr::reg(sim.arch().register(name).unwrap())
    }

    #[test]
    fn assignments_and_evaluation() {
        let mut sim = simulator(SimplifySolver::new(), DynamicJumpPolicy::default());
        let eax = reg(&sim, "eax");
        let ebx = reg(&sim, "ebx");
        let state = sim.init(0x10, &[("ebx".into(), 0x100)]).unwrap();

        // eax := [ebx] + 1
        let rhs = Expr::mem(ebx.clone(), 32).add(&Expr::constant(32, 1));
        sim.program_mut().add_assignment(at(0x10), eax.clone(), rhs, None);
        let arrows = sim.get_arrows(&state).unwrap();
        assert_eq!(arrows.len(), 1);

        let next = sim.step(&state, &arrows[0]).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].pc, MicrocodeAddress::new(0x10, 1));
        assert_eq!(sim.eval(&next[0], &eax), Ok(Expr::constant(32, 0x15)));
        assert_eq!(sim.eval(&state, &eax), Err(UndefinedValue::Register("eax".into())));

        // Evaluation is referentially transparent.
        let e = eax.add(&ebx);
        assert_eq!(sim.eval(&next[0], &e), sim.eval(&next[0], &e));
    }

    #[test]
    fn memory_writes() {
        let mut sim = simulator(SimplifySolver::new(), DynamicJumpPolicy::default());
        let esp = reg(&sim, "esp");
        let mut state = sim.init(0x10, &[("esp".into(), 0x8000)]).unwrap();

        let slot = Expr::mem(esp.sub(&Expr::constant(32, 4)), 32);
        let stmt = Statement::Assign { lvalue: slot.clone(), rhs: Expr::var("v", 32) };
        sim.exec(&mut state, &stmt).unwrap();
        assert_eq!(sim.eval(&state, &slot), Ok(Expr::var("v", 32)));
        assert_eq!(state.memory.get(0x7ffc, 8), Ok(Expr::var("v", 32).extract(0, 8)));

        let through = Expr::mem(Expr::var("p", 32), 8);
        assert!(matches!(sim.eval(&state, &through), Err(UndefinedValue::SymbolicAddress(_))));
    }

    #[test]
    fn guards_follow_the_solver() {
        let zf = Expr::var("zf", 1);
        let mut sim = simulator(SimplifySolver::new(), DynamicJumpPolicy::default());
        sim.program_mut().add_skip(at(0x10), at(0x20), zf.clone());
        sim.program_mut().add_skip(at(0x10), at(0x11), zf.not());

        let state = sim.init(0x10, &[]).unwrap();
        let arrows = sim.get_arrows(&state).unwrap();
        let successors: Vec<_> = arrows.iter()
            .flat_map(|arrow| sim.step(&state, arrow).unwrap())
            .collect();
        assert_eq!(successors.len(), 2);
        assert_eq!(successors[0].path_condition, zf);
        assert_eq!(successors[1].path_condition, zf.not());

        let (taken, not_taken) = sim.split(&successors[0], &zf);
        assert_eq!(taken, Some(zf.clone()));
        assert_eq!(not_taken, None);

        let mut pessimist = simulator(Fixed(Satisfiability::Unsat), DynamicJumpPolicy::default());
        pessimist.program_mut().add_skip(at(0x10), at(0x20), zf.clone());
        let arrows = pessimist.get_arrows(&state).unwrap();
        assert!(pessimist.step(&state, &arrows[0]).unwrap().is_empty());
    }

    #[test]
    fn dynamic_jumps() {
        let target = Expr::mem(Expr::constant(32, 0x100), 32);
        let mut sim = simulator(SimplifySolver::new(), DynamicJumpPolicy::default());
        sim.program_mut().add_jump(at(0x10), target);
        let state = sim.init(0x10, &[]).unwrap();
        let arrows = sim.get_arrows(&state).unwrap();
        let next = sim.step(&state, &arrows[0]).unwrap();
        assert_eq!(next.iter().map(|s| s.pc).collect::<Vec<_>>(), vec![at(0x14)]);
        assert!(sim.program().get_node(at(0x10)).unwrap().resolved.contains(&at(0x14)));

        // A symbolic target is mapped onto the image up to the threshold.
        let byte = Expr::var("b", 8).zero_extend(32);
        let policy = DynamicJumpPolicy { threshold: 3, map_to_memory: true };
        let mut sim = simulator(SimplifySolver::new(), policy);
        sim.program_mut().add_jump(at(0x10), byte.clone());
        let arrows = sim.get_arrows(&state).unwrap();
        let next = sim.step(&state, &arrows[0]).unwrap();
        assert_eq!(next.iter().map(|s| s.pc).collect::<Vec<_>>(), vec![at(0x10), at(0x11), at(0x12)]);
        assert_eq!(sim.program().unresolved_jumps().count(), 1);

        // Without mapping the jump is only reported.
        let mut sim = simulator(SimplifySolver::new(), DynamicJumpPolicy::default());
        sim.program_mut().add_jump(at(0x10), byte);
        let arrows = sim.get_arrows(&state).unwrap();
        let next = sim.step(&state, &arrows[0]).unwrap();
        assert!(next.is_empty());
        assert_eq!(sim.program().unresolved_jumps().count(), 1);
    }

    #[test]
    fn undecodable_instructions() {
        let mut sim = simulator(SimplifySolver::new(), DynamicJumpPolicy::default());
        let state = sim.init(0x30, &[]).unwrap();
        assert!(sim.get_arrows(&state).is_err());
        assert_eq!(sim.arrow_queries(), 1);
    }
}
