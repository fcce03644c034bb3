//! Rindo CLI - コマンドラインインターフェース
//!
//! ptraceベースのデバッガエンジン rindo のREPLインターフェース

mod command;

use anyhow::Result;
use clap::{Parser, Subcommand};
use command::Command;
use rindo_core::{ProcessContext, ProcessState, StdioHandle, StopReason};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

/// Rindo - Programmatic Debugger Engine
#[derive(Parser)]
#[command(name = "rindo")]
#[command(version = "0.1.0")]
#[command(about = "ptrace-based debugger engine", long_about = None)]
struct Cli {
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
        /// Process ID to attach to
        pid: i32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    println!("Rindo - Programmatic Debugger Engine");
    println!();

    let cli = Cli::parse();
    let (context, stdio) = init_context(cli.command)?;
    run_repl(&context, stdio)?;

    Ok(())
}

/// コンテキストを構築してプロセスを起動またはアタッチする
fn init_context(command: DebugCommand) -> Result<(ProcessContext, StdioHandle)> {
    match command {
        DebugCommand::Run { binary, args } => {
            println!("Launching: {}", binary);

            let context = rindo_core::debugger_with_args(&binary, args)?;
            let stdio = context.run()?;
            println!(
                "Process {} spawned and stopped before entry (load base 0x{:x})",
                context.pid()?,
                context.load_base()?
            );
            println!("Set breakpoints and use 'continue' to start execution");
            println!();
            Ok((context, stdio))
        }
        DebugCommand::Attach { pid } => {
            println!("Attaching to process: {}", pid);

            let context = rindo_core::attach(pid)?;
            let stdio = context.run()?;
            println!("Attached to process {}", pid);
            println!();
            Ok((context, stdio))
        }
    }
}

/// REPLループを実行する
fn run_repl(context: &ProcessContext, mut stdio: StdioHandle) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline("(rindo) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match Command::parse(line) {
                    Some(Command::Quit) => {
                        let _ = context.kill();
                        println!("Goodbye!");
                        break;
                    }
                    Some(cmd) => {
                        if let Err(e) = handle_command(context, &mut stdio, cmd) {
                            eprintln!("Error: {}", e);
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
                let _ = context.kill();
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                let _ = context.kill();
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

fn handle_command(
    context: &ProcessContext,
    stdio: &mut StdioHandle,
    cmd: Command,
) -> Result<()> {
    match cmd {
        Command::Help => print_help(),
        Command::Quit => unreachable!("quit is handled by the REPL loop"),
        Command::Continue => {
            println!("Continuing execution...");
            context.cont()?;
            print_stop(context)?;
        }
        Command::ContinueNb => {
            context.cont_nonblocking()?;
            println!("Process resumed (poll with 'state')");
        }
        Command::Step => {
            context.step()?;
            print_stop(context)?;
        }
        Command::Break { address, hardware } => {
            let bp = context.breakpoint(address, hardware)?;
            println!(
                "{} breakpoint set at 0x{:x} (resolved 0x{:x})",
                if hardware { "Hardware" } else { "Software" },
                address,
                bp.address()
            );
        }
        Command::Delete { address } => {
            let resolved = address.wrapping_add(context.load_base()?);
            let bp = context
                .breakpoints()
                .into_iter()
                .find(|b| b.address() == resolved || b.requested_address() == address)
                .ok_or_else(|| anyhow::anyhow!("No breakpoint at 0x{:x}", address))?;
            context.remove_breakpoint(&bp)?;
            println!("Breakpoint removed from 0x{:x}", bp.address());
        }
        Command::State => {
            let state = context.state()?;
            println!("State: {:?}", state);
            if state != ProcessState::Running {
                if let Some(reason) = context.stop_reason()? {
                    println!("Last stop: {:?}", reason);
                }
            }
        }
        Command::Breakpoints => {
            let bps = context.breakpoints();
            if bps.is_empty() {
                println!("No breakpoints set");
            }
            for bp in bps {
                println!(
                    "  0x{:x} ({:?}, {}, hit {} times)",
                    bp.address(),
                    bp.kind(),
                    if bp.is_enabled() { "enabled" } else { "disabled" },
                    bp.hit_count()
                );
            }
        }
        Command::Regs => {
            for name in [
                "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11",
                "r12", "r13", "r14", "r15", "rip", "eflags",
            ] {
                println!("  {:<7} 0x{:016x}", name, context.register(name)?);
            }
        }
        Command::Reg { name } => {
            println!("  {} = 0x{:x}", name, context.register(&name)?);
        }
        Command::SetReg { name, value } => {
            context.set_register(&name, value)?;
            println!("  {} = 0x{:x}", name, context.register(&name)?);
        }
        Command::Mem { address, len } => {
            let data = context.read_memory(address, len)?;
            for (i, chunk) in data.chunks(16).enumerate() {
                let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
                println!("  0x{:016x}: {}", address + (i * 16) as u64, hex.join(" "));
            }
        }
        Command::WriteMem { address, bytes } => {
            context.write_memory(address, &bytes)?;
            println!("Wrote {} bytes at 0x{:x}", bytes.len(), address);
        }
        Command::Input { line } => {
            stdio.send_line(line.as_bytes())?;
        }
        Command::Output => {
            let out = stdio.recv_available()?;
            if out.is_empty() {
                println!("(no output available)");
            } else {
                print!("{}", String::from_utf8_lossy(&out));
            }
            let err = stdio.recv_stderr_available()?;
            if !err.is_empty() {
                eprint!("{}", String::from_utf8_lossy(&err));
            }
        }
        Command::Kill => {
            context.kill()?;
            println!("Process killed");
        }
    }

    Ok(())
}

/// 停止理由とPCを表示する
fn print_stop(context: &ProcessContext) -> Result<()> {
    match context.stop_reason()? {
        Some(StopReason::BreakpointTrap) => {
            println!();
            println!("Breakpoint hit!");
            println!("Stopped at 0x{:x}", context.rip()?);
        }
        Some(StopReason::StepTrap) => {
            println!("Stopped at 0x{:x}", context.rip()?);
        }
        Some(StopReason::Signal(signal)) => {
            println!();
            println!("Received signal: {:?}", signal);
            println!("Stopped at 0x{:x}", context.rip()?);
        }
        Some(StopReason::Exited(code)) => {
            println!();
            println!("Process exited with code {}", code);
        }
        Some(StopReason::Killed(signal)) => {
            println!();
            println!("Process killed by signal {:?}", signal);
        }
        Some(StopReason::SyscallTrap) | Some(StopReason::Other) => {
            println!();
            println!("Process stopped");
        }
        None => {}
    }
    Ok(())
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help                 - Show this help message");
    println!("  quit/exit/q          - Kill the process and exit");
    println!();
    println!("Execution:");
    println!("  continue (c)         - Continue until the next stop");
    println!("  nb                   - Continue without waiting");
    println!("  step (s)             - Execute a single instruction");
    println!("  state (st)           - Show process state and last stop reason");
    println!("  kill (k)             - Kill the process");
    println!();
    println!("Breakpoints (addresses are pre-relocation):");
    println!("  break <addr> [hw]    - Set a software (or hardware) breakpoint");
    println!("  delete <addr>        - Remove a breakpoint");
    println!("  breakpoints (bps)    - List breakpoints");
    println!();
    println!("Registers and memory:");
    println!("  regs                 - Show general-purpose registers");
    println!("  reg <name>           - Show one register (aliases like eax/ax/al work)");
    println!("  set <name> <value>   - Write a register");
    println!("  mem <addr> <len> (x) - Dump memory");
    println!("  write <addr> <hex>   - Write bytes, e.g. write 0x1149 90cc");
    println!();
    println!("Process I/O (while running after 'nb'):");
    println!("  input <text> (in)    - Send a line to the process stdin");
    println!("  output (out)         - Read available process output");
    println!();
    println!("Examples:");
    println!("  break 0x1149");
    println!("  break 0x1150 hw");
    println!("  nb");
    println!("  input hello");
    println!("  state");
}
