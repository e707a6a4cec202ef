//! Control flow recovery by exploring symbolic states.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::concrete::{ConcreteMemory, UndefinedValue};
use crate::config::{ConfigError, RecoveryConfig};
use crate::decoder::{DecodeError, Decoder};
use crate::ir::{Microcode, MicrocodeAddress, Unresolved};
use crate::loader::Image;
use crate::solver::{Solver, SolverError};
use crate::sym::{Simulator, SymbolicState};


/// The outcome of a recovery run.
#[derive(Debug, Clone)]
pub struct Recovery {
    pub program: Microcode,
    pub stats: RecoveryStats,
}

/// Counters describing how the exploration went.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct RecoveryStats {
    /// States that were expanded.
    pub expanded: usize,
    /// States dropped because an equal state was expanded before.
    pub duplicates: usize,
    /// States dropped because their instruction hit the visit limit.
    pub throttled: usize,
    /// States at addresses outside of the memory image.
    pub undefined_targets: usize,
    /// States abandoned because a value they needed was undefined.
    pub undefined_values: usize,
    /// Expanded states without any feasible successor.
    pub dead_states: usize,
    /// Jump sites whose dynamic targets were not fully resolved.
    pub unresolved_jumps: usize,
}

/// Why a recovery run failed.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("failed to set up the solver: {0}")]
    SolverInit(#[source] SolverError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build the initial state: {0}")]
    InitialState(#[from] UndefinedValue),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Recover the microcode graph of an image, starting at its entrypoint.
///
/// The solver is created through `solver` before anything else happens, so
/// that a failing oracle aborts the run before the first state is explored.
pub fn symbexec<D, S, F>(image: &Image, decoder: D, solver: F, config: &RecoveryConfig)
-> Result<Recovery, RecoveryError>
where
    D: Decoder,
    S: Solver,
    F: FnOnce() -> Result<S, SolverError>,
{
    let solver = solver().map_err(|err| {
        error!("cannot start recovery: {}", err);
        RecoveryError::SolverInit(err)
    })?;

    let (image_proc, decoder_proc) = (image.arch.processor, decoder.arch().processor);
    if image_proc != decoder_proc {
        error!("cannot decode {} code with a {} decoder", image_proc, decoder_proc);
        return Err(ConfigError::ArchitectureMismatch {
            image: image_proc,
            decoder: decoder_proc,
        }.into());
    }
    config.validate(decoder.arch())?;
    for (name, value) in &config.init_registers {
        info!("initial value of {} is {:#x}", name, value);
    }
    if config.max_visits_per_address > 0 {
        info!("expanding each instruction at most {} times", config.max_visits_per_address);
    }
    info!("exploring from {:#x} using the {} solver", image.entrypoint, solver.name());

    let mut driver = Driver::new(decoder, solver, image.memory.clone(), config);
    let init = driver.simulator().init(image.entrypoint, &config.init_registers)?;
    driver.push(init);
    driver.run()?;

    let mut recovery = driver.finish();
    recovery.program.entrypoint = Some(MicrocodeAddress::instruction(image.entrypoint));
    info!(
        "recovered {} nodes from {} states, {} unresolved jumps",
        recovery.program.len(), recovery.stats.expanded, recovery.stats.unresolved_jumps,
    );

    Ok(recovery)
}

/// The worklist loop over symbolic states.
///
/// States are expanded in last-in first-out order. A state equal to one
/// expanded before is dropped, as is every further state at an instruction
/// that already reached the configured visit limit. The limit bounds loops
/// at the price of missing paths that need more iterations.
pub struct Driver<'c, D, S> {
    simulator: Simulator<D, S>,
    config: &'c RecoveryConfig,
    todo: Vec<SymbolicState>,
    visited: HashSet<SymbolicState>,
    visits: HashMap<u64, usize>,
    stats: RecoveryStats,
}

impl<'c, D: Decoder, S: Solver> Driver<'c, D, S> {
    /// Create a driver with an empty worklist.
    pub fn new(decoder: D, solver: S, memory: Rc<ConcreteMemory>, config: &'c RecoveryConfig)
    -> Driver<'c, D, S> {
        Driver {
            simulator: Simulator::new(decoder, solver, memory, config.dynamic_jumps.clone()),
            config,
            todo: vec![],
            visited: HashSet::new(),
            visits: HashMap::new(),
            stats: RecoveryStats::default(),
        }
    }

    /// Add a state to the worklist.
    pub fn push(&mut self, state: SymbolicState) {
        self.todo.push(state);
    }

    /// Explore until the worklist is empty.
    ///
    /// A decoding failure is fatal: the worklist and the visited states are
    /// dropped before the error is returned.
    pub fn run(&mut self) -> Result<(), DecodeError> {
        while let Some(state) = self.todo.pop() {
            if let Err(err) = self.expand(state) {
                error!("aborting recovery: {}", err);
                self.todo.clear();
                self.visited.clear();
                return Err(err);
            }
        }
        Ok(())
    }

    fn expand(&mut self, state: SymbolicState) -> Result<(), DecodeError> {
        if self.visited.contains(&state) {
            debug!("dropping duplicate state at {}", state.pc);
            self.stats.duplicates += 1;
            return Ok(());
        }

        let pc = state.pc;
        let instruction = MicrocodeAddress::instruction(pc.global);
        if !self.simulator.program().contains(instruction)
            && !self.simulator.memory().is_defined(pc.global) {
            warn!("undefined jump target {:#x}", pc.global);
            self.simulator.program_mut().mark_unresolved(instruction, Unresolved::OutOfBounds);
            self.stats.undefined_targets += 1;
            return Ok(());
        }

        let max = self.config.max_visits_per_address;
        if pc.is_boundary() && max > 0 {
            let count = self.visits.entry(pc.global).or_insert(0);
            if *count >= max {
                if *count == max {
                    warn!("instruction at {:#x} reached {} visits, pruning further states", pc.global, max);
                }
                *count += 1;
                self.stats.throttled += 1;
                self.visited.insert(state);
                return Ok(());
            }
            *count += 1;
        }

        if self.config.show_states {
            debug!("expanding {}", state);
        } else {
            debug!("expanding state at {}", pc);
        }

        self.stats.expanded += 1;
        let arrows = self.simulator.get_arrows(&state)?;

        let mut successors = vec![];
        for arrow in &arrows {
            match self.simulator.step(&state, arrow) {
                Ok(next) => successors.extend(next),
                Err(err) => {
                    warn!("abandoning state at {}: {}", pc, err);
                    self.stats.undefined_values += 1;
                    self.visited.insert(state);
                    return Ok(());
                },
            }
        }

        if successors.is_empty() {
            debug!("no feasible successor at {}", pc);
            self.stats.dead_states += 1;
        }

        self.visited.insert(state);
        self.todo.extend(successors);
        Ok(())
    }

    /// The simulator holding the graph.
    pub fn simulator(&self) -> &Simulator<D, S> {
        &self.simulator
    }

    /// The counters so far.
    pub fn stats(&self) -> &RecoveryStats {
        &self.stats
    }

    /// How many states are waiting.
    pub fn pending(&self) -> usize {
        self.todo.len()
    }

    /// The number of distinct states remembered as expanded.
    pub fn visited(&self) -> usize {
        self.visited.len()
    }

    /// End the exploration and take the graph. Targets that were never
    /// reached are recorded as unexplored.
    pub fn finish(self) -> Recovery {
        let mut program = self.simulator.into_program();
        for target in program.dangling_targets() {
            program.mark_unresolved(target, Unresolved::Unexplored);
        }

        let mut stats = self.stats;
        stats.unresolved_jumps = program.unresolved_jumps().count();
        Recovery { program, stats }
    }
}
