mod app_config;
mod program_file;

use app_config::AppConfig;
use clap::{Parser, Subcommand};
use partial_program::{partial_program_from, program, utils, Collaborators, Config};
use program_file::ProgramFile;
use serde_json::json;
use std::{error::Error, path::PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Run one call of a traced program and print its result and gradients
  Run {
    /// YAML file with the program, templates, parameters and feed
    #[arg(short, long, value_name = "PATH")]
    program: PathBuf,
    /// YAML config file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Run the inference variant
    #[arg(long)]
    eval: bool,
    #[arg(long)]
    keep_scope: bool,
  },
  /// Write both program variants as graphviz, graphml and json
  Dump {
    #[arg(short, long, value_name = "PATH")]
    program: PathBuf,
    #[arg(short, long, value_name = "DIR")]
    out: PathBuf,
  },
}

fn cli_overrides(eval: bool, keep_scope: bool) -> AppConfig {
  AppConfig {
    training: eval.then_some(false),
    keep_scope: keep_scope.then_some(true),
    ..AppConfig::default()
  }
}

fn run(program_path: PathBuf, config: Option<PathBuf>, eval: bool, keep_scope: bool) -> Result<(), Box<dyn Error>> {
  let file_config = match config {
    Some(path) => AppConfig::from_file(&path)?,
    None => AppConfig::default(),
  };
  let config = file_config.merge(cli_overrides(eval, keep_scope)).into_config();

  let (concrete, feed) = ProgramFile::load(&program_path)?.into_parts();
  let pp = partial_program_from(concrete, Collaborators::reference(), &config)?;
  let returned = pp.forward(feed)?;

  let grads: serde_json::Map<String, serde_json::Value> = pp
    .parameters()
    .iter()
    .map(|p| (p.name(), json!(p.grad())))
    .collect();
  let report = json!({ "returned": returned, "gradients": grads });
  println!("{}", serde_json::to_string_pretty(&report)?);

  if let Some(scope) = pp.last_scope() {
    info!(vars = ?scope.var_names(), "kept scope");
  }
  Ok(())
}

fn dump(program_path: PathBuf, out: PathBuf) -> Result<(), Box<dyn Error>> {
  let (concrete, _) = ProgramFile::load(&program_path)?.into_parts();
  let pp = partial_program_from(concrete, Collaborators::reference(), &Config::default())?;
  std::fs::create_dir_all(&out)?;

  let train = pp.train_program()?;
  let infer = pp.infer_program();
  program::save_graphviz(&out.join("train.dot"), train.global_block())?;
  program::save_graphviz(&out.join("infer.dot"), infer.global_block())?;
  std::fs::write(out.join("train.graphml"), program::graphml_string(train.global_block())?)?;
  utils::serialize_to_file(&out.join("train.json"), train)?;
  utils::serialize_to_file(&out.join("infer.json"), infer)?;
  info!(
    dir = %out.display(),
    train_ops = train.op_size(),
    infer_ops = infer.op_size(),
    "wrote program variants"
  );
  Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
  utils::init_logging()?;
  let args = Cli::parse();

  match args.command {
    Command::Run {
      program,
      config,
      eval,
      keep_scope,
    } => run(program, config, eval, keep_scope)?,
    Command::Dump { program, out } => dump(program, out)?,
  }
  Ok(())
}
