use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};

use cellsl::{diff, parse_model, validate, DiffTarget, Model, VarId};

#[derive(Parser)]
#[command(name = "cellsl", about = "Check, print and differentiate DSL models")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse and validate a model, reporting warnings
    Check { file: PathBuf },
    /// Parse a model and re-emit it as canonical DSL
    Print { file: PathBuf },
    /// Print the derivative of a variable's equation
    Diff {
        file: PathBuf,
        /// Qualified name of the variable whose equation is differentiated
        var: String,
        /// Qualified name of the variable to differentiate with respect to
        wrt: String,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    match Cli::parse().command {
        Command::Check { file } => check(&file),
        Command::Print { file } => emit(&file),
        Command::Diff { file, var, wrt } => emit_diff(&file, &var, &wrt),
    }
}

fn load(file: &Path) -> Result<Model> {
    let source = fs::read_to_string(file)
        .with_context(|| format!("cannot read '{}'", file.display()))?;
    parse_model(&source).map_err(|err| anyhow!("{}", err.pretty(&source)))
}

fn check(file: &Path) -> Result<()> {
    let model = load(file)?;
    let warnings = validate(&model)?;
    for warning in &warnings {
        println!("warning: {warning}");
    }
    println!(
        "{}: {} components, {} states, {} warnings",
        model.name(),
        model.components().count(),
        model.states().len(),
        warnings.len()
    );
    Ok(())
}

fn emit(file: &Path) -> Result<()> {
    print!("{}", load(file)?.code());
    Ok(())
}

fn emit_diff(file: &Path, var: &str, wrt: &str) -> Result<()> {
    let model = load(file)?;
    let v = find_var(&model, var)?;
    let w = find_var(&model, wrt)?;
    let rhs = model
        .var(v)
        .rhs()
        .cloned()
        .ok_or_else(|| anyhow!("'{var}' has no defining equation"))?;
    let d = diff(&rhs, &model, DiffTarget::Name(w), false)?;
    println!("{}", d.code(&model, None));
    Ok(())
}

fn find_var(model: &Model, path: &str) -> Result<VarId> {
    model
        .all_variables()
        .into_iter()
        .find(|&v| model.qname(v) == path)
        .ok_or_else(|| {
            anyhow!("unknown variable '{path}' (use a qualified name, e.g. membrane.V)")
        })
}
