use std::path::PathBuf;

use clap::{CommandFactory, Parser as ClapParser, ValueEnum, error::ErrorKind};
use colored::Colorize;
use itertools::Itertools;
use log::info;

use mplc::{
    backend::{
        CodegenOptions, compile,
        register_allocation::{Storage, allocate},
        simulator::simulate,
        targets::{PhysicalRegister, Target, TargetDescription, mips::MIPS, x64::X64},
    },
    execution::{ExecutionLimits, ExecutionResult},
    middle::{
        cfg::ControlFlowGraph,
        interpreter::interpret,
        liveness::function_liveness,
        tac::{Program, parser::parse_program, pretty_print::pretty_print_program},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Emit {
    /// The parsed three-address code
    Tac,
    /// Control flow graphs in Graphviz dot
    Cfg,
    /// Live registers before every statement
    Liveness,
    /// Register assignments after allocation
    Allocation,
    /// Lowered target code
    Target,
    /// Run the three-address code in the interpreter
    Interpret,
    /// Lower the program and run it on the target simulator
    Run,
}

#[derive(Debug, ClapParser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Three-address code to compile
    source_file: PathBuf,

    #[arg(long, value_enum, default_value_t = Target::X64)]
    target: Target,

    #[arg(long, value_enum, default_value_t = Emit::Target)]
    emit: Emit,

    /// Instructions executed before a run is abandoned
    #[arg(long, default_value_t = 10_000_000)]
    max_steps: u64,

    /// Text the running program reads as standard input
    #[arg(long, default_value = "")]
    stdin: String,

    /// Leave the originating statement out of the lowered code
    #[arg(long)]
    no_comments: bool,
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("{} {message}", "error:".red().bold());
    std::process::exit(1)
}

fn report(result: ExecutionResult) -> ! {
    print!("{}", result.stdout);
    info!("program exited with {}", result.exit_code);
    std::process::exit(result.exit_code as i32)
}

fn emit_for_target<R: PhysicalRegister>(program: &Program, target: &TargetDescription<R>, args: &Args) {
    let options = CodegenOptions {
        emit_comments: !args.no_comments,
    };
    let limits = ExecutionLimits {
        max_steps: args.max_steps,
        stdin: args.stdin.clone(),
    };
    let functions = || std::iter::once(&program.main).chain(&program.functions);

    match args.emit {
        Emit::Tac => pretty_print_program(program),
        Emit::Cfg => {
            for function in functions() {
                let cfg = ControlFlowGraph::build(&function.instructions).unwrap_or_else(|e| fail(e));
                println!("{}", cfg.to_dot(&function.name));
            }
        }
        Emit::Liveness => {
            for function in functions() {
                let liveness = function_liveness(function).unwrap_or_else(|e| fail(e));
                println!("{} {}:", "(function)".magenta(), function.name.blue());

                for (statement, live) in function.instructions.iter().zip(&liveness) {
                    let live = live.iter().map(|r| r.name()).join(", ");
                    println!("    {} {statement}", format!("{{{live}}}").bright_black());
                }
            }
        }
        Emit::Allocation => {
            let argument_registers = target.function_argument_registers.len();

            for function in functions() {
                let allocated = allocate(function, &target.general_purpose_registers, argument_registers)
                    .unwrap_or_else(|e| fail(e));

                print!("{}", allocated.function);
                for (register, storage) in &allocated.assignment.storage {
                    match storage {
                        Storage::Register(physical) => println!("    ; {register} -> {physical}"),
                        Storage::Stack(location) => println!("    ; {register} -> {location}"),
                    }
                }
                println!();
            }
        }
        Emit::Target => {
            let compiled = compile(program, target, &options).unwrap_or_else(|e| fail(e));
            print!("{compiled}");
        }
        Emit::Interpret => {
            let result = interpret(program, target.word_size, &limits).unwrap_or_else(|e| fail(e));
            report(result);
        }
        Emit::Run => {
            let compiled = compile(program, target, &options).unwrap_or_else(|e| fail(e));
            let result = simulate(&compiled, target, &limits).unwrap_or_else(|e| fail(e));
            report(result);
        }
    }
}

fn main() {
    env_logger::init();

    let args = Args::parse();

    if !args.source_file.is_file() {
        Args::command()
            .error(
                ErrorKind::InvalidValue,
                format!("Source file '{}' does not exist!", args.source_file.display()),
            )
            .exit()
    }

    let source = std::fs::read_to_string(&args.source_file).unwrap_or_else(|e| {
        Args::command()
            .error(
                ErrorKind::Io,
                format!("Failed to read '{}': {e}", args.source_file.display()),
            )
            .exit()
    });

    let program = parse_program(&source).unwrap_or_else(|e| fail(e));

    match args.target {
        Target::X64 => emit_for_target(&program, &*X64, &args),
        Target::Mips => emit_for_target(&program, &*MIPS, &args),
    }
}
