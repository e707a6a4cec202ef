use std::rc::Rc;

use microsym::arch::{Architecture, Processor};
use microsym::concrete::{ConcreteMemory, UndefinedValue};
use microsym::config::{ConfigError, DynamicJumpPolicy, RecoveryConfig};
use microsym::dot::write_instruction_graph;
use microsym::expr::{Expr, ExprNode, UnOp};
use microsym::ir::{MicrocodeAddress, Unresolved};
use microsym::loader::{Loader, RawLoader, SymbolTable};
use microsym::num::{Endianness, Integer};
use microsym::recovery::{symbexec, Driver, RecoveryError};
use microsym::solver::{Satisfiability, SimplifySolver, Solver, SolverError};
use microsym::sym::{Simulator, SymbolicState};
use microsym::x86_32::X86_32Decoder;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn at(global: u64) -> MicrocodeAddress {
    MicrocodeAddress::instruction(global)
}

/// Says yes to everything.
struct Permissive;

impl Solver for Permissive {
    fn name(&self) -> &str {
        "permissive"
    }

    fn check_sat(&mut self, _: &Expr) -> Result<Satisfiability, SolverError> {
        Ok(Satisfiability::Sat)
    }
}

/// Rejects every formula with a negation in it.
struct NoNegations;

impl Solver for NoNegations {
    fn name(&self) -> &str {
        "no-negations"
    }

    fn check_sat(&mut self, formula: &Expr) -> Result<Satisfiability, SolverError> {
        let mut negated = false;
        formula.traverse(&mut |e| negated |= matches!(e.node(), ExprNode::Unary(UnOp::Not, _)));
        Ok(if negated { Satisfiability::Unsat } else { Satisfiability::Sat })
    }
}

/// Take every arrow of the state.
fn successors<S: Solver>(sim: &mut Simulator<X86_32Decoder, S>, state: &SymbolicState)
-> Result<Vec<SymbolicState>, UndefinedValue> {
    let arrows = sim.get_arrows(state).unwrap();
    let mut next = vec![];
    for arrow in &arrows {
        next.extend(sim.step(state, arrow)?);
    }
    Ok(next)
}

/// `mov eax, dword ptr [ebx]; je 0x1012` with a dword at 0x2000.
fn load_then_branch() -> Rc<ConcreteMemory> {
    let mut memory = ConcreteMemory::new();
    memory.put_bytes(0x1000, &[0x8b, 0x03, 0x74, 0x0e]);
    memory.put_bytes(0x2000, &[0x78, 0x56, 0x34, 0x12]);
    Rc::new(memory)
}

fn branch_successors<S: Solver>(solver: S) -> Vec<SymbolicState> {
    let mut sim = Simulator::new(
        X86_32Decoder::new(),
        solver,
        load_then_branch(),
        DynamicJumpPolicy::default(),
    );

    let mut state = sim.init(0x1000, &[("ebx".into(), 0x2000)]).unwrap();
    let zf = sim.arch().register("zf").unwrap();
    state.memory.set_register(&zf, &Expr::var("z", 1)).unwrap();

    // Through the two steps of the move.
    let mut states = successors(&mut sim, &state).unwrap();
    assert_eq!(states.len(), 1);
    states = successors(&mut sim, &states[0]).unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].pc, at(0x1002));

    let eax = sim.arch().register("eax").unwrap();
    assert_eq!(states[0].memory.get_register(&eax).unwrap(), Expr::constant(32, 0x12345678));

    successors(&mut sim, &states[0]).unwrap()
}

#[test]
fn undefined_base_register_abandons_the_branch() {
    init();

    let mut sim = Simulator::new(
        X86_32Decoder::new(),
        Permissive,
        load_then_branch(),
        DynamicJumpPolicy::default(),
    );
    let state = sim.init(0x1000, &[]).unwrap();
    assert_eq!(successors(&mut sim, &state), Err(UndefinedValue::Register("ebx".into())));

    let config = RecoveryConfig::default();
    let mut driver = Driver::new(X86_32Decoder::new(), Permissive, load_then_branch(), &config);
    let state = driver.simulator().init(0x1000, &[]).unwrap();
    driver.push(state);
    driver.run().unwrap();
    assert_eq!(driver.stats().undefined_values, 1);
    assert_eq!(driver.stats().expanded, 1);
}

#[test]
fn both_branches_when_feasible() {
    init();

    let states = branch_successors(Permissive);
    let mut targets: Vec<_> = states.iter().map(|s| s.pc).collect();
    targets.sort();
    assert_eq!(targets, vec![at(0x1004), at(0x1012)]);
    assert!(states.iter().all(|s| !s.path_condition.is_true()));
}

#[test]
fn one_branch_when_the_other_is_infeasible() {
    init();

    let states = branch_successors(NoNegations);
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].pc, at(0x1012));
    assert_eq!(states[0].path_condition, Expr::var("z", 1));
}

#[test]
fn equal_states_are_expanded_once() {
    init();

    let mut memory = ConcreteMemory::new();
    memory.put_bytes(0x1000, &[0xf4]);

    let config = RecoveryConfig::default();
    let mut driver = Driver::new(X86_32Decoder::new(), SimplifySolver::new(), Rc::new(memory), &config);
    let state = driver.simulator().init(0x1000, &[]).unwrap();
    driver.push(state.clone());
    driver.push(state);
    driver.run().unwrap();

    assert_eq!(driver.stats().expanded, 1);
    assert_eq!(driver.stats().duplicates, 1);
    assert_eq!(driver.simulator().arrow_queries(), 1);
}

#[test]
fn visit_limit_bounds_loops() {
    init();

    // 0x1000: inc eax
    // 0x1001: jmp 0x1000
    let image = RawLoader::new(0x1000, Architecture::x86_32())
        .load(&[0x40, 0xeb, 0xfd])
        .unwrap();

    let mut config = RecoveryConfig { max_visits_per_address: 3, ..RecoveryConfig::default() };
    config.set_init_register("eax", 0);

    let recovery = symbexec(&image, X86_32Decoder::new(), || Ok(SimplifySolver::new()), &config).unwrap();
    assert_eq!(recovery.stats.throttled, 1);
    assert!(recovery.program.contains(at(0x1000)));
    assert!(recovery.program.contains(at(0x1001)));
    assert!(recovery.program.dangling_targets().is_empty());
}

#[test]
fn memory_layers() {
    let mut memory = ConcreteMemory::new();
    memory.put(0x100, Integer::new(8, 0xab), Endianness::Little);

    for &endianness in &[Endianness::Little, Endianness::Big] {
        assert_eq!(memory.get(0x100, 8, endianness), Ok(Integer::new(8, 0xab)));
        assert_eq!(memory.get(0xff, 16, endianness), Err(UndefinedValue::Address(0xff)));
    }

    let mut overlay = ConcreteMemory::with_base(Rc::new(memory));
    overlay.put_byte(0x100, 0xcd);
    overlay.put_byte(0xff, 0x01);
    assert_eq!(overlay.get_byte(0x100), Some(0xcd));
    assert_eq!(overlay.get(0xff, 16, Endianness::Big), Ok(Integer::new(16, 0x01cd)));
    assert_eq!(overlay.base().and_then(|base| base.get_byte(0x100)), Some(0xab));
}

#[test]
fn failing_solver_stops_before_exploring() {
    init();

    let image = RawLoader::new(0x1000, Architecture::x86_32()).load(&[0xf4]).unwrap();
    let result = symbexec(
        &image,
        X86_32Decoder::new(),
        || Err::<SimplifySolver, _>(SolverError::Init("no backend".into())),
        &RecoveryConfig::default(),
    );
    assert!(matches!(result, Err(RecoveryError::SolverInit(SolverError::Init(_)))));
}

#[test]
fn unknown_registers_are_rejected() {
    let image = RawLoader::new(0x1000, Architecture::x86_32()).load(&[0xf4]).unwrap();
    let mut config = RecoveryConfig::default();
    config.set_init_register("r7", 1);

    let result = symbexec(&image, X86_32Decoder::new(), || Ok(SimplifySolver::new()), &config);
    assert!(matches!(result, Err(RecoveryError::Config(_))));
}

#[test]
fn images_for_another_processor_are_rejected() {
    init();

    let image = RawLoader::new(0x1000, Architecture::arm(Endianness::Little)).load(&[0xf4]).unwrap();
    let result = symbexec(&image, X86_32Decoder::new(), || Ok(SimplifySolver::new()), &RecoveryConfig::default());
    assert!(matches!(
        result,
        Err(RecoveryError::Config(ConfigError::ArchitectureMismatch { image: Processor::Arm, decoder: Processor::X86_32 })),
    ));
}

#[test]
fn undecodable_code_is_fatal() {
    init();

    // nop; then an opcode that is not supported
    let image = RawLoader::new(0x1000, Architecture::x86_32()).load(&[0x90, 0x0f, 0x0b]).unwrap();
    let result = symbexec(&image, X86_32Decoder::new(), || Ok(SimplifySolver::new()), &RecoveryConfig::default());
    assert!(matches!(result, Err(RecoveryError::Decode(_))));
}

#[test]
fn call_fill_and_return() {
    init();

    let code = [
        0xe8, 0x05, 0x00, 0x00, 0x00,   // 0x1000: call 0x100a
        0xf4,                           // 0x1005: hlt
        0x90, 0x90, 0x90, 0x90,         // 0x1006: nop (never reached)
        0xb9, 0x04, 0x00, 0x00, 0x00,   // 0x100a: mov ecx, 0x4
        0xbf, 0x00, 0x20, 0x00, 0x00,   // 0x100f: mov edi, 0x2000
        0xb8, 0xab, 0x00, 0x00, 0x00,   // 0x1014: mov eax, 0xab
        0xf3, 0xaa,                     // 0x1019: rep stosb
        0xc3,                           // 0x101b: ret
    ];

    let mut loader = RawLoader::new(0x1000, Architecture::x86_32());
    loader.symbols = SymbolTable::parse("0x1000 _start\n0x100a fill").unwrap();
    let image = loader.load(&code).unwrap();

    let config = RecoveryConfig::from_properties("
        # stack somewhere above the code
        disas.symsim.x86_32.init-esp = 0x8000
    ").unwrap();

    let recovery = symbexec(&image, X86_32Decoder::new(), || Ok(SimplifySolver::new()), &config).unwrap();
    let program = &recovery.program;

    for &addr in &[0x1000, 0x1005, 0x100a, 0x100f, 0x1014, 0x1019, 0x101b] {
        assert!(program.contains(at(addr)), "missing instruction at {:#x}", addr);
    }
    assert!(!program.contains(at(0x1006)));
    assert_eq!(program.entrypoint, Some(at(0x1000)));
    assert_eq!(recovery.stats.unresolved_jumps, 0);
    assert_eq!(recovery.stats.undefined_values, 0);
    assert!(program.dangling_targets().is_empty());
    assert!(!program.unresolved().any(|(_, reason)| *reason == Unresolved::Unexplored));

    let ret = program.nodes()
        .find(|node| node.addr.global == 0x101b && !node.resolved.is_empty())
        .unwrap();
    assert!(ret.resolved.contains(&at(0x1005)));

    let mut dot = vec![];
    write_instruction_graph(&mut dot, program, &image.symbols, "fill").unwrap();
    let dot = String::from_utf8(dot).unwrap();
    assert!(dot.contains("call 0x100a"));
    assert!(dot.contains("rep stosb"));
    assert!(dot.contains("&lt;fill&gt;"));
}
