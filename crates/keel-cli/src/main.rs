use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use keel_core::{CallOutcome, ContractId, Error, ModuleInfo, Runtime, RuntimeConfig, StateSnapshot};
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;

/// Keel - sandboxed contract execution engine CLI
///
/// Inspect, deploy and call WebAssembly contracts and read their state.
#[derive(Parser)]
#[command(name = "keel", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Directory of the durable state log (in-memory when omitted)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON runtime configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log more (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Print nothing on success
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a module without deploying it
    Inspect {
        /// Path to a .wasm or .wat module
        file: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Deploy a module and print its contract identity
    Deploy {
        /// Path to a .wasm or .wat module
        file: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Call an entry point of a contract
    Call {
        /// Contract identity (hex), or a module path to deploy first
        contract: String,
        /// Entry point name
        function: String,
        /// Arguments as hex
        #[arg(long, conflicts_with = "args_file")]
        args: Option<String>,
        /// Read arguments from a file
        #[arg(long)]
        args_file: Option<PathBuf>,
        /// Fuel budget (defaults to the configured default budget)
        #[arg(long)]
        budget: Option<u64>,
        /// Call this many times in a row
        #[arg(long, default_value_t = 1)]
        repeat: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the committed state of a contract
    State {
        /// Contract identity (hex), or a module path to deploy first
        contract: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List deployed contracts
    Contracts {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Rewrite the state log as one checkpoint per contract
    Compact {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show version information
    Version,
}

// ── Exit codes ────────────────────────────────────────────

const EXIT_OK: i32 = 0;
const EXIT_CONTRACT: i32 = 1;
const EXIT_ERROR: i32 = 2;

/// Failures of a contract or module are 1; everything else is 2
fn exit_code(err: &Error) -> i32 {
    if err.is_execution_failure()
        || matches!(err, Error::InvalidModule(_) | Error::ResourceExhausted(_))
    {
        EXIT_CONTRACT
    } else {
        EXIT_ERROR
    }
}

/// A failure annotated with the exit code it maps to
struct Failure {
    code: i32,
    message: String,
}

impl From<Error> for Failure {
    fn from(err: Error) -> Self {
        Failure {
            code: exit_code(&err),
            message: err.to_string(),
        }
    }
}

impl Failure {
    fn usage(message: impl Into<String>) -> Self {
        Failure {
            code: EXIT_ERROR,
            message: message.into(),
        }
    }
}

type CliResult = Result<(), Failure>;

fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli.global) {
        Ok(config) => config,
        Err(failure) => exit_with(failure, cli.global.quiet),
    };
    init_logging(&cli.global, &config);
    tracing::debug!(data_dir = ?config.data_dir, "configuration loaded");

    let result = match cli.command {
        Commands::Version => {
            println!(
                "keel {} (keel-core {})",
                env!("CARGO_PKG_VERSION"),
                env!("CARGO_PKG_VERSION")
            );
            Ok(())
        }
        Commands::Inspect { file, json } => cmd_inspect(config, &file, json, cli.global.quiet),
        command => Runtime::open(config)
            .map_err(Failure::from)
            .and_then(|rt| run_command(&rt, command, cli.global.quiet)),
    };

    match result {
        Ok(()) => process::exit(EXIT_OK),
        Err(failure) => exit_with(failure, cli.global.quiet),
    }
}

fn exit_with(failure: Failure, quiet: bool) -> ! {
    if !quiet || failure.code == EXIT_ERROR {
        eprintln!("{} {}", "error:".red().bold(), failure.message);
    }
    process::exit(failure.code)
}

fn load_config(global: &GlobalArgs) -> Result<RuntimeConfig, Failure> {
    let mut config = match &global.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| {
                Failure::usage(format!("cannot read config {}: {}", path.display(), e))
            })?;
            RuntimeConfig::parse(&text)?
        }
        None => RuntimeConfig::default(),
    };
    if let Some(dir) = &global.data_dir {
        config = config.with_data_dir(dir);
    }
    config.validate()?;
    Ok(config)
}

fn init_logging(global: &GlobalArgs, config: &RuntimeConfig) {
    let level = if global.quiet {
        "error"
    } else {
        match global.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        match (&config.log_filter, global.verbose) {
            (Some(directive), 0) => EnvFilter::new(directive),
            _ => EnvFilter::new(level),
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_command(rt: &Runtime, command: Commands, quiet: bool) -> CliResult {
    match command {
        Commands::Deploy { file, json } => cmd_deploy(rt, &file, json, quiet),
        Commands::Call {
            contract,
            function,
            args,
            args_file,
            budget,
            repeat,
            json,
        } => {
            let args = read_args(args.as_deref(), args_file.as_deref())?;
            let id = resolve_contract(rt, &contract)?;
            cmd_call(rt, &id, &function, &args, budget, repeat, json, quiet)
        }
        Commands::State { contract, json } => {
            let id = resolve_contract(rt, &contract)?;
            cmd_state(rt, &id, json, quiet)
        }
        Commands::Contracts { json } => cmd_contracts(rt, json, quiet),
        Commands::Compact { json } => cmd_compact(rt, json, quiet),
        Commands::Version | Commands::Inspect { .. } => Ok(()),
    }
}

// ── Input helpers ─────────────────────────────────────────

/// Read a module file; `.wat` text is compiled to a binary first
fn read_module(path: &Path) -> Result<Vec<u8>, Failure> {
    let bytes = std::fs::read(path)
        .map_err(|e| Failure::usage(format!("cannot read {}: {}", path.display(), e)))?;
    let is_text = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("wat"))
        .unwrap_or(false);
    if is_text {
        return wat::parse_bytes(&bytes).map(|b| b.into_owned()).map_err(|e| Failure {
            code: EXIT_CONTRACT,
            message: format!("invalid module: {}", e),
        });
    }
    Ok(bytes)
}

fn read_args(hex_args: Option<&str>, file: Option<&Path>) -> Result<Vec<u8>, Failure> {
    match (hex_args, file) {
        (Some(text), _) => hex::decode(text.trim_start_matches("0x"))
            .map_err(|e| Failure::usage(format!("--args is not valid hex: {}", e))),
        (None, Some(path)) => std::fs::read(path)
            .map_err(|e| Failure::usage(format!("cannot read {}: {}", path.display(), e))),
        (None, None) => Ok(Vec::new()),
    }
}

/// A 64-character hex identity, or a module path that is deployed first
fn resolve_contract(rt: &Runtime, target: &str) -> Result<ContractId, Failure> {
    if let Ok(id) = target.parse::<ContractId>() {
        return Ok(id);
    }
    let path = Path::new(target);
    if path.exists() {
        let code = read_module(path)?;
        return Ok(rt.deploy(&code)?);
    }
    Err(Failure::usage(format!(
        "'{}' is neither a contract identity nor a module file",
        target
    )))
}

// ── Commands ──────────────────────────────────────────────

fn cmd_inspect(config: RuntimeConfig, file: &Path, json: bool, quiet: bool) -> CliResult {
    let code = read_module(file)?;
    // Inspection never touches the data directory
    let config = RuntimeConfig {
        data_dir: None,
        ..config
    };
    let rt = Runtime::open(config)?;
    let info = rt.inspect(&code)?;
    if json {
        println!("{}", module_json(&info));
    } else if !quiet {
        print_module(&info);
    }
    Ok(())
}

fn cmd_deploy(rt: &Runtime, file: &Path, json: bool, quiet: bool) -> CliResult {
    let code = read_module(file)?;
    let id = rt.deploy(&code)?;
    let info = rt.module_info(&id)?;
    if json {
        println!("{}", module_json(&info));
    } else if !quiet {
        println!("{} deployed {}", "✓".green(), id.to_string().bold());
        print_module(&info);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_call(
    rt: &Runtime,
    id: &ContractId,
    function: &str,
    args: &[u8],
    budget: Option<u64>,
    repeat: u32,
    json: bool,
    quiet: bool,
) -> CliResult {
    let budget = budget.unwrap_or(rt.config().default_budget);
    let mut outcomes = Vec::new();
    for _ in 0..repeat.max(1) {
        outcomes.push(rt.call_with_budget(id, function, args, budget)?);
    }

    if json {
        let calls: Vec<_> = outcomes.iter().map(call_json).collect();
        let output = if calls.len() == 1 {
            calls.into_iter().next().unwrap_or_default()
        } else {
            serde_json::Value::Array(calls)
        };
        println!("{}", output);
    } else if !quiet {
        for outcome in &outcomes {
            println!(
                "{} {} → {}",
                "✓".green(),
                function.bold(),
                if outcome.output.is_empty() {
                    "(empty)".dimmed().to_string()
                } else {
                    hex::encode(&outcome.output)
                }
            );
            println!(
                "  fuel used: {}  writes: {}  contracts: {}  elapsed: {:?}",
                outcome.receipt.fuel_used,
                outcome.receipt.writes,
                outcome.receipt.contracts.len(),
                outcome.receipt.elapsed
            );
        }
    }
    Ok(())
}

fn cmd_state(rt: &Runtime, id: &ContractId, json: bool, quiet: bool) -> CliResult {
    let snapshot = rt.get_state(id)?;
    if json {
        println!("{}", state_json(id, &snapshot));
    } else if !quiet {
        println!("{} {}", "contract".bold(), id);
        println!("  version: {}", snapshot.version);
        if snapshot.entries.is_empty() {
            println!("  {}", "(no entries)".dimmed());
        }
        for (key, value) in &snapshot.entries {
            println!("  {} = {}", display_bytes(key).cyan(), hex::encode(value));
        }
    }
    Ok(())
}

fn cmd_contracts(rt: &Runtime, json: bool, quiet: bool) -> CliResult {
    let ids = rt.contracts();
    if json {
        let list: Vec<_> = ids
            .iter()
            .map(|id| serde_json::Value::String(id.to_hex()))
            .collect();
        println!("{}", serde_json::json!({ "contracts": list }));
    } else if !quiet {
        if ids.is_empty() {
            println!("{}", "no contracts deployed".dimmed());
        }
        for id in ids {
            println!("{}", id);
        }
    }
    Ok(())
}

fn cmd_compact(rt: &Runtime, json: bool, quiet: bool) -> CliResult {
    let stats = rt
        .compact()?
        .ok_or_else(|| Failure::usage("compact requires --data-dir"))?;
    if json {
        println!(
            "{}",
            serde_json::json!({
                "modules": stats.modules,
                "contracts": stats.contracts,
                "bytes_before": stats.bytes_before,
                "bytes_after": stats.bytes_after,
            })
        );
    } else if !quiet {
        println!(
            "{} compacted log: {} → {} bytes ({} modules, {} contracts)",
            "✓".green(),
            stats.bytes_before,
            stats.bytes_after,
            stats.modules,
            stats.contracts
        );
    }
    Ok(())
}

// ── Output ────────────────────────────────────────────────

fn print_module(info: &ModuleInfo) {
    println!("  id: {}", info.id);
    println!("  size: {} bytes", info.size);
    println!("  entry points: {}", info.entry_points.join(", "));
    if !info.imports.is_empty() {
        println!("  imports: {}", info.imports.join(", "));
    }
}

fn module_json(info: &ModuleInfo) -> serde_json::Value {
    serde_json::json!({
        "id": info.id.to_hex(),
        "size": info.size,
        "entry_points": info.entry_points,
        "imports": info.imports,
    })
}

fn call_json(outcome: &CallOutcome) -> serde_json::Value {
    serde_json::json!({
        "output": hex::encode(&outcome.output),
        "fuel_used": outcome.receipt.fuel_used,
        "writes": outcome.receipt.writes,
        "contracts": outcome.receipt.contracts.iter().map(ContractId::to_hex).collect::<Vec<_>>(),
        "elapsed_us": outcome.receipt.elapsed.as_micros() as u64,
    })
}

fn state_json(id: &ContractId, snapshot: &StateSnapshot) -> serde_json::Value {
    let entries: serde_json::Map<String, serde_json::Value> = snapshot
        .entries
        .iter()
        .map(|(k, v)| (hex::encode(k), serde_json::Value::String(hex::encode(v))))
        .collect();
    serde_json::json!({
        "contract": id.to_hex(),
        "version": snapshot.version,
        "entries": entries,
    })
}

/// Printable keys as text, anything else as hex
fn display_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) if text.chars().all(|c| !c.is_control()) => text.to_string(),
        _ => format!("0x{}", hex::encode(bytes)),
    }
}
