use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{command, value_parser, Arg, ArgAction, ArgMatches};
use log::{info, LevelFilter};

use microsym::arch::Architecture;
use microsym::config::{parse_int, RecoveryConfig};
use microsym::dot::{write_instruction_graph, write_microcode_graph};
use microsym::loader::{Image, Loader, RawLoader, SymbolTable};
use microsym::recovery::{symbexec, Recovery};
use microsym::solver::{SimplifySolver, Solver, SolverError};
use microsym::x86_32::X86_32Decoder;

const LOGGING_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const ARCHITECTURES: [&str; 1] = ["x86-32"];
const SOLVERS: [&str; 2] = ["simplify", "z3"];

fn args() -> ArgMatches {
    command!()
        .arg(
            Arg::new("input-file")
                .help("Raw binary to recover the control flow of")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .required(true),
        )
        .arg(
            Arg::new("verbose")
                .help("Logging level to use")
                .short('v')
                .long("verbose")
                .value_name("LEVEL")
                .value_parser(LOGGING_LEVELS)
                .default_value(LOGGING_LEVELS[3]),
        )
        .arg(
            Arg::new("base")
                .help("Address the binary is loaded at")
                .short('b')
                .long("base")
                .value_name("ADDRESS")
                .default_value("0x0"),
        )
        .arg(
            Arg::new("entry")
                .help("Address to start at, defaults to the base address")
                .short('e')
                .long("entry")
                .value_name("ADDRESS"),
        )
        .arg(
            Arg::new("arch")
                .help("Architecture of the binary")
                .long("arch")
                .value_name("ARCH")
                .value_parser(ARCHITECTURES)
                .default_value(ARCHITECTURES[0]),
        )
        .arg(
            Arg::new("solver")
                .help("Oracle deciding the feasibility of paths")
                .short('s')
                .long("solver")
                .value_name("SOLVER")
                .value_parser(SOLVERS)
                .default_value(SOLVERS[0]),
        )
        .arg(
            Arg::new("config")
                .help("Properties file with `key = value` lines")
                .short('c')
                .long("config")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("define")
                .help("Set a single property")
                .short('D')
                .value_name("KEY=VALUE")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("symbols")
                .help("Symbol file with `address name` lines")
                .long("symbols")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("init-esp")
                .help("Initial value of the stack pointer")
                .long("init-esp")
                .value_name("ADDRESS"),
        )
        .arg(
            Arg::new("max-visits")
                .help("How often one instruction may be expanded, zero for no bound")
                .long("max-visits")
                .value_name("NUMBER")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("dynamic-jump-threshold")
                .help("The most targets a computed jump is resolved to")
                .long("dynamic-jump-threshold")
                .value_name("NUMBER")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("map-dynamic-jump-to-memory")
                .help("Try the addresses of the image as targets of computed jumps")
                .long("map-dynamic-jump-to-memory")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("show-states")
                .help("Log every expanded state at debug level")
                .long("show-states")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("microcode")
                .help("Draw every micro step instead of whole instructions")
                .short('m')
                .long("microcode")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("output-file")
                .help("Graphviz file to write to, standard output if absent")
                .short('o')
                .long("output")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf)),
        )
        .get_matches()
}

fn main() -> Result<()> {
    let matches = args();

    let level = match matches.get_one::<String>("verbose").map(String::as_str) {
        Some("trace") => LevelFilter::Trace,
        Some("debug") => LevelFilter::Debug,
        Some("info") => LevelFilter::Info,
        Some("error") => LevelFilter::Error,
        _ => LevelFilter::Warn,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .init();

    let config = configure(&matches)?;
    let image = load(&matches)?;

    let recovery = match matches.get_one::<String>("solver").map(String::as_str) {
        Some("z3") => recover_with_z3(&image, &config)?,
        _ => recover(&image, &config, || Ok(SimplifySolver::new()))?,
    };

    let stats = &recovery.stats;
    info!(
        "{} states expanded, {} duplicates, {} throttled, {} abandoned, {} undefined targets",
        stats.expanded, stats.duplicates, stats.throttled,
        stats.undefined_values, stats.undefined_targets,
    );

    let input = input_file(&matches);
    let title = input.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    match matches.get_one::<PathBuf>("output-file") {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            write_graph(BufWriter::new(file), &matches, &recovery, &image, &title)?;
        },
        None => write_graph(io::stdout().lock(), &matches, &recovery, &image, &title)?,
    }

    Ok(())
}

/// Collect the options from the properties file, the `-D` definitions and
/// the dedicated flags, later sources overriding earlier ones.
fn configure(matches: &ArgMatches) -> Result<RecoveryConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            RecoveryConfig::from_properties(&text)
                .with_context(|| format!("invalid configuration in {}", path.display()))?
        },
        None => RecoveryConfig::default(),
    };

    for define in matches.get_many::<String>("define").into_iter().flatten() {
        let (key, value) = match define.split_once('=') {
            Some(pair) => pair,
            None => bail!("expected `key=value` instead of {:?}", define),
        };
        config.set_property(key.trim(), value.trim())?;
    }

    if let Some(esp) = matches.get_one::<String>("init-esp") {
        config.set_init_register("esp", parse_int("init-esp", esp)?);
    }
    if let Some(&max) = matches.get_one::<usize>("max-visits") {
        config.max_visits_per_address = max;
    }
    if let Some(&threshold) = matches.get_one::<usize>("dynamic-jump-threshold") {
        config.dynamic_jumps.threshold = threshold;
    }
    if matches.get_flag("map-dynamic-jump-to-memory") {
        config.dynamic_jumps.map_to_memory = true;
    }
    if matches.get_flag("show-states") {
        config.show_states = true;
    }

    Ok(config)
}

fn load(matches: &ArgMatches) -> Result<Image> {
    let arch = match matches.get_one::<String>("arch").map(String::as_str) {
        Some("x86-32") | None => Architecture::x86_32(),
        Some(other) => bail!("unsupported architecture {}", other),
    };

    let base = address(matches, "base")?.unwrap_or(0);
    let mut loader = RawLoader::new(base, arch);
    loader.entry = address(matches, "entry")?;

    if let Some(path) = matches.get_one::<PathBuf>("symbols") {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        loader.symbols = SymbolTable::parse(&text)
            .with_context(|| format!("invalid symbol file {}", path.display()))?;
    }

    let input = input_file(matches);
    loader.load_file(input)
        .with_context(|| format!("failed to load {}", input.display()))
}

fn recover<S, F>(image: &Image, config: &RecoveryConfig, solver: F) -> Result<Recovery>
where
    S: Solver,
    F: FnOnce() -> Result<S, SolverError>,
{
    // The error may hold shared expressions, so it is rendered here.
    symbexec(image, X86_32Decoder::new(), solver, config)
        .map_err(|err| anyhow!("control flow recovery failed: {}", err))
}

#[cfg(feature = "z3")]
fn recover_with_z3(image: &Image, config: &RecoveryConfig) -> Result<Recovery> {
    recover(image, config, microsym::solver::Z3Solver::new)
}

#[cfg(not(feature = "z3"))]
fn recover_with_z3(_: &Image, _: &RecoveryConfig) -> Result<Recovery> {
    bail!("this build does not include the z3 solver, rebuild with `--features z3`")
}

fn write_graph<W: Write>(
    mut f: W,
    matches: &ArgMatches,
    recovery: &Recovery,
    image: &Image,
    title: &str,
) -> Result<()> {
    if matches.get_flag("microcode") {
        write_microcode_graph(&mut f, &recovery.program, title)?;
    } else {
        write_instruction_graph(&mut f, &recovery.program, &image.symbols, title)?;
    }
    f.flush()?;
    Ok(())
}

fn input_file(matches: &ArgMatches) -> &Path {
    matches.get_one::<PathBuf>("input-file")
        .map(PathBuf::as_path)
        .unwrap_or_else(|| panic!("argument \"input-file\" has to be set in CLI at all times"))
}

fn address(matches: &ArgMatches, arg: &str) -> Result<Option<u64>> {
    matches.get_one::<String>(arg)
        .map(|value| parse_int(arg, value))
        .transpose()
        .map_err(Into::into)
}
