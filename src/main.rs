use std::fs;
use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};
use rchicc::{CompileError, codegen, compile_program, tokenizer};
use snafu::{ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

/// Compile a small C-like language into AArch64 assembly.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
  /// Program text to compile.
  #[arg(required_unless_present = "file", conflicts_with = "file")]
  source: Option<String>,

  /// Read the program text from a file instead.
  #[arg(short, long)]
  file: Option<PathBuf>,

  /// Write the result here instead of stdout.
  #[arg(short, long)]
  output: Option<PathBuf>,

  /// Stop after the given stage and print its result.
  #[arg(long, value_enum, default_value_t = Emit::Asm)]
  emit: Emit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Emit {
  Tokens,
  Ast,
  Asm,
}

#[derive(Debug, Snafu)]
enum CliError {
  #[snafu(display("could not read {}: {source}", path.display()))]
  Read {
    path: PathBuf,
    source: std::io::Error,
  },

  #[snafu(display("could not write {}: {source}", path.display()))]
  Write {
    path: PathBuf,
    source: std::io::Error,
  },

  #[snafu(transparent)]
  Compile { source: CompileError },
}

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
    .with_writer(std::io::stderr)
    .with_target(false)
    .init();

  let args = Args::parse();
  if let Err(err) = run(&args) {
    eprintln!("{err}");
    process::exit(1);
  }
}

fn run(args: &Args) -> Result<(), CliError> {
  let source = match &args.file {
    Some(path) => fs::read_to_string(path).context(ReadSnafu { path })?,
    // clap guarantees one of the two is present
    None => args.source.clone().unwrap_or_default(),
  };

  let output = match args.emit {
    Emit::Tokens => tokenizer::tokenize(&source)?
      .iter()
      .map(|token| {
        format!(
          "{:?} {:?}\n",
          token.kind,
          tokenizer::token_text(token, &source)
        )
      })
      .collect::<String>(),
    Emit::Ast => format!("{:#?}\n", compile_program(&source)?),
    Emit::Asm => codegen::generate(&compile_program(&source)?, &source)?,
  };

  match &args.output {
    Some(path) => fs::write(path, output).context(WriteSnafu { path })?,
    None => print!("{output}"),
  }
  Ok(())
}
