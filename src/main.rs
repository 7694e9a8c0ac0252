/// Tierkeeper - tiering simulation CLI
///
/// Drives a set of synthetic functions through the engine: calls, hot loops,
/// bailouts, property invalidations and collections, then prints the engine
/// statistics.
use std::env;
use std::process;
use std::sync::Arc;

use tierkeeper::backend::*;
use tracing::{info, warn, Level};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_usage() {
    eprintln!("Tierkeeper v{}", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    tierkeeper [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -h, --help              Print this help message");
    eprintln!("    -V, --version           Print version information");
    eprintln!("    -c, --config <FILE>     Load tiering configuration from a TOML file");
    eprintln!("    -f, --functions <N>     Number of simulated functions (default: 8)");
    eprintln!("    -n, --steps <N>         Number of simulation steps (default: 2000)");
    eprintln!("    -v, --verbose           Log debug output (repeat for trace)");
    eprintln!();
    eprintln!("EXAMPLES:");
    eprintln!("    tierkeeper");
    eprintln!("    tierkeeper --config tiering.toml --steps 10000 -v");
}

struct Options {
    config: Option<String>,
    functions: usize,
    steps: usize,
    verbosity: u8,
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();

    let mut options = Options {
        config: None,
        functions: 8,
        steps: 2000,
        verbosity: 0,
    };
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                process::exit(0);
            }
            "-V" | "--version" => {
                println!("Tierkeeper {}", VERSION);
                process::exit(0);
            }
            "-c" | "--config" => {
                i += 1;
                let path = args.get(i).ok_or("Missing file after --config")?;
                options.config = Some(path.clone());
            }
            "-f" | "--functions" => {
                i += 1;
                options.functions = parse_count(args.get(i), "--functions")?;
            }
            "-n" | "--steps" => {
                i += 1;
                options.steps = parse_count(args.get(i), "--steps")?;
            }
            "-v" | "--verbose" => options.verbosity += 1,
            "-vv" => options.verbosity += 2,
            arg => return Err(format!("Unknown option: {}", arg)),
        }
        i += 1;
    }
    Ok(options)
}

fn parse_count(value: Option<&String>, flag: &str) -> Result<usize, String> {
    let value = value.ok_or_else(|| format!("Missing number after {}", flag))?;
    value
        .parse()
        .map_err(|e| format!("Invalid number '{}' for {}: {}", value, flag, e))
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

/// Byte code for simulated function `index`: sizes and loop counts vary
fn synthetic_output(index: usize) -> ByteCodeOutput {
    let statements = 2 + index % 5;
    let len = 24 + index * 16;
    let properties = (0..2).map(|p| PropertyId((index * 2 + p) as u32 % 6)).collect();
    ByteCodeOutput {
        byte_code: (0..len).map(|b| (b * 7 + index) as u8).collect(),
        inline_cache_layout: InlineCacheLayout {
            property: 2,
            ..Default::default()
        },
        inline_cache_properties: properties,
        statements: (0..statements)
            .map(|s| StatementData::new((s * 40) as i32, (s * len / statements) as i32))
            .collect(),
        loop_headers: if index % 3 == 0 { vec![4..20] } else { Vec::new() },
        ..Default::default()
    }
}

/// Reparses redeferred functions from their name
struct SyntheticParser;

impl ByteCodeGenerator for SyntheticParser {
    fn generate(&self, name: &str, _source: std::ops::Range<u32>) -> Result<ByteCodeOutput, ParseError> {
        let index = name
            .strip_prefix("fn")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| ParseError::Syntax(format!("unknown function '{}'", name)))?;
        Ok(synthetic_output(index))
    }
}

fn simulate(engine: &mut Engine, functions: usize, steps: usize) -> EngineResult<()> {
    let ids: Vec<FunctionId> = (0..functions)
        .map(|i| engine.add_function(&format!("fn{}", i), (i as u32 * 100)..(i as u32 * 100 + 90)))
        .collect();
    for (i, &f) in ids.iter().enumerate() {
        engine.mark_script_complete(f, synthetic_output(i))?;
    }

    for step in 0..steps {
        engine.enter_script();
        for (i, &f) in ids.iter().enumerate() {
            // Lower-numbered functions are hotter
            if step % (i + 1) != 0 {
                continue;
            }
            let target = engine.on_function_call(f)?;
            let t = TypeRef::new(0x4000 + ((step % (i + 2)) as u64) * 0x40);
            engine.record_inline_cache_access(f, 0, t, 1, CacheSource::Local)?;
            if i % 3 == 0 {
                engine.on_loop_iterations(f, 0, 8)?;
            }
            // Cold functions bail out of native code now and then
            if target.native().is_some() && i >= functions / 2 && step % 97 == 0 {
                if let Some(ep) = engine.function(f).and_then(FunctionUnit::default_entry_point) {
                    engine.on_bailout(ep)?;
                }
            }
        }
        engine.leave_script();

        if step % 500 == 499 {
            let patches = engine.invalidate_property_guards(PropertyId((step / 500) as u32 % 6), &[]);
            info!(step, patches = patches.len(), "property guards invalidated");
        }
        if step % 50 == 49 {
            engine.try_enter_expirable_collect_mode();
            engine.on_collection();
        }
        engine.checkpoint();
    }
    engine.wait_for_compiles();
    Ok(())
}

fn main() {
    let options = match parse_args() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            process::exit(1);
        }
    };
    init_logging(options.verbosity);

    let config = match &options.config {
        Some(path) => match TieringConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: failed to load '{}': {}", path, e);
                process::exit(1);
            }
        },
        None => TieringConfig::default(),
    };

    let mut engine = match Engine::new(config, Arc::new(SyntheticBackend::default())) {
        Ok(engine) => engine.with_byte_code_generator(Box::new(SyntheticParser)),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = simulate(&mut engine, options.functions, options.steps) {
        warn!(%e, "simulation stopped early");
    }

    println!("{}", engine.stats());
    println!(
        "live native code: {} bytes in {} allocations",
        engine.code_allocator().live_bytes(),
        engine.code_allocator().live_allocations()
    );
    println!("entry points: {}", engine.entry_point_count());
    engine.shutdown();
}
