//! The main compiler binary. Takes a source file and emits either the
//! token stream, the parsed AST, the optimized AST, or the final
//! assembly, wrapping the assembly in the `.text`/`basic_main` header and
//! footer that `back::codegen` leaves to its caller.
//!
//! Run with `--help` for more info.

use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use teenybasicc::back::codegen;
use teenybasicc::front::{self, lex};
use teenybasicc::middle::optimize_program;
use tracing::error;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// The input file.
    file: String,
    /// What to emit.
    #[arg(value_enum, long, default_value_t = Emit::Asm)]
    emit: Emit,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Emit {
    /// The lexed token stream.
    Tokens,
    /// The parsed AST, before optimization.
    Ast,
    /// The optimized AST.
    Tir,
    /// The resulting assembly code (default).
    Asm,
}

const HEADER: &str = "\t.text\n\t.globl basic_main\nbasic_main:\n";
const FOOTER: &str = "\tret\n";

fn header_and_footer(body: &str) -> String {
    let mut out = String::with_capacity(HEADER.len() + body.len() + FOOTER.len());
    out.push_str(HEADER);
    out.push_str(body);
    out.push_str(FOOTER);
    out
}

fn run(args: &Args) -> Result<String, ExitCode> {
    let input = std::fs::read_to_string(&args.file).map_err(|err| {
        error!(file = %args.file, %err, "could not read input file");
        ExitCode::from(1)
    })?;

    if args.emit == Emit::Tokens {
        let tokens = lex::Lexer::tokenize(&input).map_err(|err| {
            error!(%err, "lex error");
            ExitCode::from(2)
        })?;
        return Ok(tokens.iter().map(|t| format!("{t}\n")).collect());
    }

    let mut program = front::parse(&input).map_err(|err| {
        error!(%err, "parse error");
        ExitCode::from(2)
    })?;
    if args.emit == Emit::Ast {
        return Ok(format!("{program:#?}\n"));
    }

    optimize_program(&mut program);
    if args.emit == Emit::Tir {
        return Ok(format!("{program:#?}\n"));
    }

    let body = codegen::compile(&program).map_err(|err| {
        error!(%err, "codegen error");
        ExitCode::from(3)
    })?;
    Ok(header_and_footer(&body))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(
            |_| tracing_subscriber::EnvFilter::new("info"),
        ))
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(text) => {
            print!("{text}");
            ExitCode::SUCCESS
        }
        Err(code) => code,
    }
}
