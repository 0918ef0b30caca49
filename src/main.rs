//! ILC replay entry point: CLI wiring and scenario-driven engine construction.

use std::path::Path;
use std::process;

use tracing::Level;

use ilc_engine::config::ScenarioConfig;
use ilc_engine::io::export::export_csv;
use ilc_engine::sim::engine::Simulation;

/// Preset used when neither `--scenario` nor `--preset` is given.
const DEFAULT_PRESET: &str = "office";

/// Parsed CLI arguments.
struct CliArgs {
    scenario_path: Option<String>,
    preset: Option<String>,
    seed_override: Option<u64>,
    telemetry_out: Option<String>,
    verbose: bool,
    #[cfg(feature = "api")]
    serve: bool,
    #[cfg(feature = "api")]
    port: u16,
}

fn print_help() {
    eprintln!("ilc-engine - demand-limiting curtailment engine replay");
    eprintln!();
    eprintln!("Usage: ilc-engine [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --scenario <path>        Load scenario from TOML config file");
    eprintln!(
        "  --preset <name>          Use a built-in preset ({})",
        ScenarioConfig::PRESETS.join(", ")
    );
    eprintln!("  --seed <u64>             Override random seed");
    eprintln!("  --telemetry-out <path>   Export tick records to CSV");
    eprintln!("  --verbose, -v            Log engine decisions at debug level");
    #[cfg(feature = "api")]
    {
        eprintln!("  --serve                  Start REST API server after the replay");
        eprintln!("  --port <u16>             API server port (default: 3000)");
    }
    eprintln!("  --help                   Show this help message");
    eprintln!();
    eprintln!("If no --scenario or --preset is given, the {DEFAULT_PRESET} preset is used.");
}

/// Returns the value following a flag, or exits with a message.
fn flag_value<'a>(args: &'a [String], i: usize, flag: &str, what: &str) -> &'a str {
    match args.get(i) {
        Some(v) => v.as_str(),
        None => {
            eprintln!("error: {flag} requires {what}");
            process::exit(1);
        }
    }
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        scenario_path: None,
        preset: None,
        seed_override: None,
        telemetry_out: None,
        verbose: false,
        #[cfg(feature = "api")]
        serve: false,
        #[cfg(feature = "api")]
        port: 3000,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            "--scenario" => {
                i += 1;
                cli.scenario_path =
                    Some(flag_value(&args, i, "--scenario", "a path argument").to_string());
            }
            "--preset" => {
                i += 1;
                cli.preset = Some(flag_value(&args, i, "--preset", "a name argument").to_string());
            }
            "--seed" => {
                i += 1;
                let raw = flag_value(&args, i, "--seed", "a u64 argument");
                match raw.parse::<u64>() {
                    Ok(s) => cli.seed_override = Some(s),
                    Err(_) => {
                        eprintln!("error: --seed value \"{raw}\" is not a valid u64");
                        process::exit(1);
                    }
                }
            }
            "--telemetry-out" => {
                i += 1;
                cli.telemetry_out =
                    Some(flag_value(&args, i, "--telemetry-out", "a path argument").to_string());
            }
            "--verbose" | "-v" => {
                cli.verbose = true;
            }
            #[cfg(feature = "api")]
            "--serve" => {
                cli.serve = true;
            }
            #[cfg(feature = "api")]
            "--port" => {
                i += 1;
                let raw = flag_value(&args, i, "--port", "a u16 argument");
                match raw.parse::<u16>() {
                    Ok(p) => cli.port = p,
                    Err(_) => {
                        eprintln!("error: --port value \"{raw}\" is not a valid u16");
                        process::exit(1);
                    }
                }
            }
            other => {
                eprintln!("error: unknown argument \"{other}\"");
                print_help();
                process::exit(1);
            }
        }
        i += 1;
    }

    if cli.scenario_path.is_some() && cli.preset.is_some() {
        eprintln!("error: --scenario and --preset are mutually exclusive");
        process::exit(1);
    }

    cli
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = parse_args();
    init_logging(cli.verbose);

    // --scenario takes priority, then --preset, then the default preset
    let loaded = match (&cli.scenario_path, &cli.preset) {
        (Some(path), _) => ScenarioConfig::from_toml_file(Path::new(path)),
        (None, Some(name)) => ScenarioConfig::from_preset(name),
        (None, None) => ScenarioConfig::from_preset(DEFAULT_PRESET),
    };
    let mut scenario = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    if let Some(seed) = cli.seed_override {
        scenario.simulation.seed = seed;
    }

    let errors = scenario.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("{e}");
        }
        process::exit(1);
    }

    let mut simulation = match Simulation::from_config(&scenario) {
        Ok(sim) => sim,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };
    let results = simulation.run();
    let kpi = simulation.report(&results);

    for r in &results {
        println!("{r}");
    }
    println!("\n{kpi}");

    if let Some(ref path) = cli.telemetry_out {
        if let Err(e) = export_csv(&results, Path::new(path)) {
            eprintln!("error: failed to write CSV: {e}");
            process::exit(1);
        }
        eprintln!("Telemetry written to {path}");
    }

    #[cfg(feature = "api")]
    if cli.serve {
        use std::net::SocketAddr;
        use std::sync::Arc;

        use ilc_engine::api::{AppState, ScenarioSummary, serve};

        let state = Arc::new(AppState {
            scenario: ScenarioSummary::from_config(&scenario),
            kpi,
            results,
        });
        let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
        let rt = tokio::runtime::Runtime::new().unwrap_or_else(|e| {
            eprintln!("error: failed to create tokio runtime: {e}");
            process::exit(1);
        });
        if let Err(e) = rt.block_on(serve(state, addr)) {
            eprintln!("error: API server failed: {e}");
            process::exit(1);
        }
    }
}
