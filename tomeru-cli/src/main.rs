//! tomeru CLI - コマンドラインインターフェース
//!
//! ネイティブデバッガ tomeru のREPLインターフェース

use anyhow::Result;
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use std::sync::Arc;
use tomeru_core::config::CtrlConfig;
use tomeru_core::errors::ERR_SYMBOL_NOT_FOUND;
use tomeru_core::exception_codes::ExceptionCodeKind;
use tomeru_core::parse::parse_address;
use tomeru_core::unwind::describe_frame;
use tomeru_core::{Command, Debugger, OsHandle, RegBlock, StopCause, StopInfo};
use tomeru_target::registers::x64::GPR_NAMES;
use tomeru_target::DebugApi;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// tomeru - native debugger
#[derive(Parser)]
#[command(name = "tomeru")]
#[command(version = "0.1.0")]
#[command(about = "Native debugger with conditional breakpoints and trap-net stepping", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: DebugCommand,

    /// Directory for control-thread session logs
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Number of memory reader threads
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum DebugCommand {
    /// Launch and debug an executable
    Run {
        /// Path to the executable binary
        binary: String,

        /// Do not stop at the entry point
        #[arg(long)]
        no_entry_stop: bool,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Attach to an existing process
    Attach {
        /// Process ID to attach to
        #[arg(short, long)]
        pid: u32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    println!("tomeru - native debugger");
    println!("Version 0.1.0");
    println!();

    let mut config = CtrlConfig::default();
    if let Some(dir) = cli.log_dir {
        config.log_dir = dir;
    }
    if let Some(workers) = cli.workers {
        config.memory.workers = workers.max(1);
    }

    let mut debugger = Debugger::new(platform_api()?, config)?;
    if let Some(path) = debugger.ctrl().session_log_path() {
        println!("Session log: {}", path.display());
    }
    init_target(&mut debugger, cli.command)?;
    run_repl(&mut debugger)?;

    Ok(())
}

/// `RUST_LOG`があればそれを、なければ`-v`の数で決めたレベルを使う
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn platform_api() -> Result<Arc<dyn DebugApi>> {
    Ok(Arc::new(tomeru_target::ptrace::PtraceDebugApi::new()))
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn platform_api() -> Result<Arc<dyn DebugApi>> {
    anyhow::bail!("No debug backend is available for this platform")
}

/// プロセスを起動またはアタッチする
fn init_target(debugger: &mut Debugger, command: DebugCommand) -> Result<()> {
    match command {
        DebugCommand::Run {
            binary,
            no_entry_stop,
            args,
        } => {
            println!("Launching: {}", binary);
            let pid = debugger.launch(&binary, &args)?;
            println!("Process {} created", pid);

            let stop = debugger.run(!no_entry_stop)?;
            print_stop(debugger, &stop);
        }
        DebugCommand::Attach { pid } => {
            println!("Attaching to process: {}", pid);
            debugger.attach(pid)?;
            println!("Attached to process {}", pid);
        }
    }
    println!();
    Ok(())
}

/// REPLループを実行する
fn run_repl(debugger: &mut Debugger) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline("(tomeru) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match handle_command(debugger, line) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("Error: {}", e),
                }
                print_notices(debugger);
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

    if debugger.process().is_some() {
        if let Err(e) = debugger.kill() {
            eprintln!("Failed to kill the process: {}", e);
        }
    }
    println!("Goodbye!");
    Ok(())
}

/// コマンドを実行する（falseで終了）
fn handle_command(debugger: &mut Debugger, line: &str) -> Result<bool> {
    let Some(command) = Command::parse(line) else {
        println!("Unknown command: {}", line);
        println!("Type 'help' for available commands.");
        return Ok(true);
    };
    debug!("command: {:?}", command);

    match command {
        Command::Help => print_help(),
        Command::Quit => return Ok(false),
        Command::Break(location) => {
            let id = debugger.add_breakpoint(&location)?;
            println!("Breakpoint {} set at {}", id, location);
        }
        Command::Delete(id) => {
            let bp = debugger.remove_breakpoint(id)?;
            println!("Deleted breakpoint {} ({})", id, bp);
        }
        Command::Enable(id) => debugger.set_breakpoint_enabled(id, true)?,
        Command::Disable(id) => debugger.set_breakpoint_enabled(id, false)?,
        Command::Condition(id, condition) => {
            debugger.set_breakpoint_condition(id, &condition)?;
            if condition.is_empty() {
                println!("Breakpoint {} is now unconditional", id);
            }
        }
        Command::Breakpoints => {
            let breakpoints: Vec<_> = debugger.breakpoints().collect();
            if breakpoints.is_empty() {
                println!("No breakpoints");
            }
            for bp in breakpoints {
                println!("  {}: {}", bp.id, bp);
            }
        }
        Command::Continue => {
            let stop = debugger.continue_execution()?;
            print_stop(debugger, &stop);
        }
        Command::StepInst => {
            let stop = debugger.step_into_inst()?;
            print_stop(debugger, &stop);
        }
        Command::NextInst => {
            let stop = debugger.step_over_inst()?;
            print_stop(debugger, &stop);
        }
        Command::Finish => {
            let stop = debugger.step_out()?;
            print_stop(debugger, &stop);
        }
        Command::Backtrace => {
            for frame in debugger.backtrace()? {
                println!(
                    "{} in {}",
                    describe_frame(frame.index, &frame.regs),
                    frame.symbol.as_deref().unwrap_or("??")
                );
            }
        }
        Command::Registers => print_registers(&debugger.registers()?),
        Command::Examine(addr, len) => {
            let addr = resolve_address(debugger, &addr)?;
            let bytes = debugger.read_memory(addr, len)?;
            print_hex_dump(addr, &bytes);
        }
        Command::Disassemble => {
            for insn in debugger.disassemble_at_ip(8)? {
                println!("  {:#018x}:  {:<8} {}", insn.address, insn.mnemonic, insn.operands);
            }
        }
        Command::Threads => {
            let selected = debugger.thread();
            for thread in debugger.threads() {
                let marker = if Some(thread.handle.os) == selected { "*" } else { " " };
                println!("{} {} {}", marker, thread.handle.os, thread.string);
            }
        }
        Command::Thread(tid) => {
            debugger.select_thread(OsHandle(tid))?;
            println!("Switched to thread {}", tid);
        }
        Command::Modules => {
            for module in debugger.modules() {
                println!("  {} {}", module.vaddr_range(), module.string);
            }
        }
        Command::Kill => {
            debugger.kill()?;
            println!("Process killed");
        }
        Command::Detach => {
            debugger.detach()?;
            println!("Detached");
        }
    }

    Ok(true)
}

/// `$rax`のようなレジスタ名、シンボル名、またはアドレス
fn resolve_address(debugger: &Debugger, s: &str) -> Result<u64> {
    if let Some(name) = s.strip_prefix('$') {
        return debugger
            .registers()?
            .value_by_name(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown register: {}", name));
    }
    if let Some(addr) = debugger.resolve_symbol(s) {
        return Ok(addr);
    }
    parse_address(s).map_err(|_| anyhow::anyhow!("{}: {}", ERR_SYMBOL_NOT_FOUND, s))
}

/// 停止の情報を表示する
fn print_stop(debugger: &Debugger, stop: &StopInfo) {
    let ip = if stop.ip != 0 {
        stop.ip
    } else {
        debugger.registers().map(|r| r.ip()).unwrap_or(0)
    };
    let location = match debugger.symbolize(ip) {
        Some(symbol) => format!("{:#x} in {}", ip, symbol),
        None => format!("{:#x}", ip),
    };

    match stop.cause {
        StopCause::UserBreakpoint => println!("Breakpoint hit at {}", location),
        StopCause::EntryPoint => println!("Stopped at entry point {}", location),
        StopCause::Finished => println!("Stopped at {}", location),
        StopCause::InterruptedByException => {
            let name = ExceptionCodeKind::from_code(stop.exception_code)
                .map(|k| k.display_name())
                .unwrap_or("Unknown exception");
            println!("{} ({:#x}) at {}", name, stop.exception_code, location);
        }
        StopCause::InterruptedByHalt => println!("Interrupted at {}", location),
        StopCause::InterruptedByTrap => println!("Trap at {}", location),
        StopCause::Error | StopCause::Null => println!("Stopped ({})", stop.cause.name()),
    }
    if debugger.process().is_none() {
        println!("Process exited");
    }
}

fn print_notices(debugger: &mut Debugger) {
    debugger.pump_events();
    for notice in debugger.take_notices() {
        println!("{}", notice);
    }
}

fn print_registers(regs: &RegBlock) {
    match regs {
        RegBlock::X64(r) => {
            for (name, value) in GPR_NAMES.iter().zip(r.gpr.iter()) {
                println!("  {:<6} {:#018x}", name, value);
            }
            println!("  {:<6} {:#018x}", "rip", r.rip);
            println!("  {:<6} {:#018x}", "rflags", r.rflags);
            println!("  {:<6} {:#018x}", "fs_base", r.fs_base);
        }
        RegBlock::Arm64(r) => {
            for (i, value) in r.x.iter().enumerate() {
                println!("  x{:<5} {:#018x}", i, value);
            }
            println!("  {:<6} {:#018x}", "sp", r.sp);
            println!("  {:<6} {:#018x}", "pc", r.pc);
            println!("  {:<6} {:#018x}", "pstate", r.pstate);
        }
    }
}

fn print_hex_dump(addr: u64, bytes: &[u8]) {
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = chunk
            .iter()
            .map(|b| if b.is_ascii_graphic() { *b as char } else { '.' })
            .collect();
        println!("  {:#018x}: {:<47}  {}", addr + (i * 16) as u64, hex.join(" "), ascii);
    }
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help           - Show this help message");
    println!("  quit/exit/q    - Exit the debugger");
    println!();
    println!("Breakpoints:");
    println!("  break <loc> [if <cond>]  - Set breakpoint (symbol, symbol+off, file:line, 0xaddr)");
    println!("  delete <n>               - Delete breakpoint");
    println!("  enable/disable <n>       - Enable or disable breakpoint");
    println!("  condition <n> [cond]     - Change or clear breakpoint condition");
    println!("  info break               - List breakpoints");
    println!();
    println!("Execution:");
    println!("  continue (c)   - Continue execution");
    println!("  stepi (si)     - Step one instruction");
    println!("  nexti (ni)     - Step one instruction, stepping over calls");
    println!("  finish (f)     - Run until the current function returns");
    println!("  kill / detach  - End the debugging session");
    println!();
    println!("Inspection:");
    println!("  backtrace (bt) - Show call stack");
    println!("  regs           - Show registers");
    println!("  x <addr> [n]   - Dump n bytes of memory ($reg and symbols allowed)");
    println!("  disas          - Disassemble at the current instruction");
    println!("  threads        - List threads (thread <tid> to switch)");
    println!("  modules        - List loaded modules");
    println!();
    println!("Examples:");
    println!("  break main");
    println!("  break src/main.c:42 if *32 counter > 3");
    println!("  x $rsp 32");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_with_args() {
        let cli = Cli::try_parse_from(["tomeru", "-v", "run", "./app", "input.txt", "-n", "3"]).unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            DebugCommand::Run {
                binary,
                no_entry_stop,
                args,
            } => {
                assert_eq!(binary, "./app");
                assert!(!no_entry_stop);
                assert_eq!(args, vec!["input.txt", "-n", "3"]);
            }
            DebugCommand::Attach { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_parses_attach() {
        let cli = Cli::try_parse_from(["tomeru", "attach", "--pid", "42", "--log-dir", "/tmp/logs"]).unwrap();
        assert_eq!(cli.log_dir, Some(PathBuf::from("/tmp/logs")));
        assert!(matches!(cli.command, DebugCommand::Attach { pid: 42 }));
    }
}
