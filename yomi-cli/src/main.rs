//! Yomi CLI - コマンドラインインターフェース
//!
//! 変数の生存判定とasyncアンワインドを行うリゾルバ yomi のREPLインターフェース

use anyhow::Result;
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use yomi_core::parse::{parse_break_location, BreakLocation};
use yomi_core::{
    Command, Debugger, FrameOrigin, LogicalStack, Resolution, ResolverConfig, StopReason, Symbol,
};

/// Yomi - Variable liveness and async unwind resolver
#[derive(Parser)]
#[command(name = "yomi")]
#[command(version = "0.1.0")]
#[command(about = "Debugger core for moved-from variables and async call chains", long_about = None)]
struct Cli {
    /// Resolver configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Maximum number of async frames to reconstruct
    #[arg(long, global = true)]
    max_async_depth: Option<usize>,

    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: DebugCommand,
}

#[derive(Subcommand)]
enum DebugCommand {
    /// Launch and debug an executable
    Run {
        /// Path to the executable binary
        binary: String,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Attach to an existing process
    Attach {
        /// Path to the executable binary
        binary: String,

        /// Process ID to attach to
        #[arg(short, long)]
        pid: i32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    println!("Yomi - variable liveness & async unwind resolver");
    println!("Version 0.1.0");
    println!();

    let config = load_config(&cli)?;
    let mut debugger = init_debugger(config, cli.command)?;
    run_repl(&mut debugger)?;

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// 設定ファイルを読み、コマンドライン引数で上書きする
fn load_config(cli: &Cli) -> Result<ResolverConfig> {
    let mut config = match &cli.config {
        Some(path) => ResolverConfig::load(path)?,
        None => ResolverConfig::default(),
    };
    if let Some(depth) = cli.max_async_depth {
        config.max_async_depth = depth;
    }
    config.validate()?;
    Ok(config)
}

/// デバッガを初期化してプロセスにアタッチまたは起動する
fn init_debugger(config: ResolverConfig, command: DebugCommand) -> Result<Debugger> {
    let mut debugger = Debugger::new(config);

    match command {
        DebugCommand::Run { binary, args } => {
            debugger.load_binary(&binary)?;
            println!("Loaded DWARF information from {}", binary);

            debugger.spawn(&binary, &args)?;
            println!("Process spawned and stopped at first instruction");
            println!("Set breakpoints and use 'continue' to continue execution");
            println!();
        }
        DebugCommand::Attach { binary, pid } => {
            debugger.load_binary(&binary)?;
            println!("Loaded DWARF information from {}", binary);

            debugger.attach(pid)?;
            println!("Attached to process {}", pid);
            println!();
        }
    }

    Ok(debugger)
}

fn history_path() -> Option<PathBuf> {
    home::home_dir().map(|dir| dir.join(".yomi_history"))
}

/// REPLループを実行する
fn run_repl(debugger: &mut Debugger) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;
    let history = history_path();
    if let Some(path) = &history {
        // 初回起動時は履歴ファイルがない
        let _ = rl.load_history(path);
    }

    loop {
        match rl.readline("(yomi) ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match Command::parse(line) {
                    Some(Command::Quit) => break,
                    Some(command) => {
                        if let Err(e) = handle_command(debugger, command) {
                            eprintln!("error: {}", e);
                        }
                    }
                    None => {
                        println!("Unknown command: {}", line);
                        println!("Type 'help' for available commands.");
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    if let Some(path) = &history {
        if let Err(e) = rl.save_history(path) {
            tracing::debug!("Failed to save history: {}", e);
        }
    }
    println!("Goodbye!");
    Ok(())
}

fn handle_command(debugger: &mut Debugger, command: Command) -> Result<()> {
    match command {
        Command::Help => print_help(),
        Command::Break(location) => handle_break(debugger, &location)?,
        Command::Continue => {
            println!("Continuing execution...");
            let reason = debugger.continue_and_wait()?;
            report_stop(debugger, reason)?;
        }
        Command::Step => {
            let reason = debugger.step()?;
            report_stop(debugger, reason)?;
        }
        Command::Threads => {
            let current = debugger.current_thread()?;
            for thread in debugger.threads()? {
                let marker = if thread == current { "*" } else { " " };
                println!("{} {}", marker, thread);
            }
        }
        Command::SelectThread(tid) => {
            debugger.select_thread(tid)?;
            println!("Selected tid {}", tid);
        }
        Command::Backtrace => {
            let stack = debugger.backtrace()?;
            print_backtrace(debugger, &stack);
        }
        Command::FrameVariable { name: Some(name), frame } => {
            let resolution = debugger.resolve(frame, &name)?;
            println!("{}", describe(&name, &resolution));
        }
        Command::FrameVariable { name: None, frame } => {
            let variables = debugger.resolve_all(frame)?;
            if variables.is_empty() {
                println!("No variables in frame #{}", frame);
            }
            for (name, resolution) in variables {
                println!("{}", describe(&name, &resolution));
            }
        }
        Command::Print { name, frame } => match debugger.resolve(frame, &name)? {
            Resolution::Value(value) => println!("{}", value),
            Resolution::Deinitialized { .. } => {
                return Err(anyhow::anyhow!("variable {} has been deinitialized", name))
            }
            Resolution::NotFound(reason) => {
                return Err(anyhow::anyhow!("cannot evaluate {}: {}", name, reason))
            }
        },
        Command::Classify { frame } => {
            let kind = debugger.classify(frame)?;
            println!("frame #{}: {}", frame, kind);
        }
        Command::Find(pattern) => {
            let symbols = debugger.find_symbols(&pattern);
            print_symbol_list(&format!("Symbols matching '{}'", pattern), &symbols, Some(20));
        }
        Command::StatisticsDump => println!("{}", debugger.statistics_json()?),
        Command::Quit => {}
    }

    Ok(())
}

/// `frame variable` の1行分の表示
fn describe(name: &str, resolution: &Resolution) -> String {
    match resolution {
        Resolution::Value(value) => value.to_string(),
        Resolution::Deinitialized { type_name } => format!(
            "({}) {} = <deinitialized>",
            type_name.as_deref().unwrap_or("?"),
            name
        ),
        Resolution::NotFound(reason) => format!("{} = <unavailable: {}>", name, reason),
    }
}

/// Breakコマンドを処理する
fn handle_break(debugger: &mut Debugger, location: &str) -> Result<()> {
    match parse_break_location(location) {
        BreakLocation::Address(addr) => {
            let id = debugger.set_breakpoint(addr)?;
            println!("Breakpoint {} set at 0x{:x}", id, addr);
        }
        BreakLocation::Symbol(name) => {
            let (id, addr) = debugger.set_breakpoint_by_symbol(&name)?;
            println!("Breakpoint {} set at '{}' (0x{:x})", id, name, addr);
        }
    }
    Ok(())
}

fn report_stop(debugger: &Debugger, reason: StopReason) -> Result<()> {
    println!();
    match reason {
        StopReason::Breakpoint | StopReason::Step => {
            let pc = debugger.get_pc()?;
            let label = if reason == StopReason::Breakpoint {
                "Breakpoint hit"
            } else {
                "Stepped"
            };
            match debugger.source_location(pc) {
                Some(location) => println!("{} at 0x{:x} ({})", label, pc, location),
                None => println!("{} at 0x{:x}", label, pc),
            }
        }
        StopReason::Signal(signal) => println!("Received signal: {:?}", signal),
        StopReason::Exited(code) => println!("Process exited with code {}", code),
        StopReason::Other => println!("Process stopped (unknown reason)"),
    }
    Ok(())
}

fn print_backtrace(debugger: &Debugger, stack: &LogicalStack) {
    for frame in stack.frames() {
        let symbol = frame.symbol.as_deref().unwrap_or("??");
        let origin = match frame.origin {
            FrameOrigin::Physical { .. } => String::new(),
            FrameOrigin::AsyncContext { context, .. } => format!(" [async ctx 0x{:x}]", context),
        };
        match debugger.source_location(frame.lookup_pc()) {
            Some(location) => println!(
                "  #{:<3} 0x{:016x} {}{} at {}",
                frame.index, frame.pc, symbol, origin, location
            ),
            None => println!("  #{:<3} 0x{:016x} {}{}", frame.index, frame.pc, symbol, origin),
        }
    }
    if let Some(truncation) = stack.truncation() {
        println!("  ... backtrace truncated: {}", truncation);
    }
}

/// シンボルリストを表示するヘルパー関数
fn print_symbol_list(title: &str, symbols: &[Symbol], limit: Option<usize>) {
    if symbols.is_empty() {
        println!("No {} found", title);
        return;
    }

    let display_limit = limit.unwrap_or(symbols.len());
    println!("{} ({} found):", title, symbols.len());

    for (i, sym) in symbols.iter().take(display_limit).enumerate() {
        if sym.size > 0 {
            println!(
                "  {}. {} @ 0x{:x} (size: {})",
                i + 1,
                sym.display_name(),
                sym.address,
                sym.size
            );
        } else {
            println!("  {}. {} @ 0x{:x}", i + 1, sym.display_name(), sym.address);
        }
    }

    if symbols.len() > display_limit {
        println!("  ... and {} more", symbols.len() - display_limit);
    }
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help                        - Show this help message");
    println!("  quit/exit/q                 - Exit the debugger");
    println!();
    println!("Execution:");
    println!("  break <symbol|*addr>        - Set breakpoint at symbol or address");
    println!("  continue (c)                - Continue execution");
    println!("  step (s)                    - Execute one instruction");
    println!("  threads / thread <tid>      - List or select stopped threads");
    println!();
    println!("Inspection:");
    println!("  bt                          - Logical backtrace including async frames");
    println!("  frame variable [name] [n]   - Show variables of frame n (alias: v)");
    println!("  print <name> [n]            - Evaluate a variable (alias: p)");
    println!("  classify [n]                - Show how physical frame n is classified");
    println!("  find <pattern>              - Find symbols matching pattern");
    println!("  statistics dump             - Print resolver statistics as JSON");
    println!();
    println!("Examples:");
    println!("  break $s4main17copyableVarTestyyF");
    println!("  fr v k");
    println!("  p k 2");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_deinitialized_with_type() {
        let resolution = Resolution::Deinitialized {
            type_name: Some("a.K".to_string()),
        };
        assert_eq!(describe("a", &resolution), "(a.K) a = <deinitialized>");

        let untyped = Resolution::Deinitialized { type_name: None };
        assert_eq!(describe("k", &untyped), "(?) k = <deinitialized>");
    }
}
