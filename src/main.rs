use std::process::ExitCode;
use std::time::Instant;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use console::style;
use gantry::cleanup::CLEAN;
use gantry::engine::Always;
use gantry::project::{ASSEMBLE, RUN};
use gantry::utils::as_overhead;
use gantry::{
    Config, GantryError, InvocationLock, Project, Report, RuntimeArgs, Selection, TaskStatus,
};

/// Stages and runs a node deployment from a task graph
#[derive(Debug, Parser)]
#[command(name = "gantry", version)]
struct Cli {
    /// Project directory
    #[arg(short = 'C', long = "directory", global = true, default_value = ".")]
    directory: Utf8PathBuf,

    /// Configuration file, `gantry.toml` in the project directory by default
    #[arg(long, global = true)]
    config: Option<Utf8PathBuf>,

    /// Maximum number of tasks running at once
    #[arg(short = 'j', long = "jobs", global = true)]
    jobs: Option<usize>,

    /// Keep running independent tasks after a failure
    #[arg(long, global = true)]
    continue_on_failure: bool,

    /// Ignore up-to-date checks
    #[arg(long, global = true)]
    rerun_tasks: bool,

    /// Leave a task out of the plan
    #[arg(short = 'x', long = "exclude", global = true)]
    exclude: Vec<String>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stage a runnable deployment
    Assemble,
    /// Assemble, then launch the node from the staging root
    Run,
    /// Remove everything the build produced
    Clean,
    /// Print the protocol version from the version catalog
    ProtoVersion,
    /// List registered tasks
    Tasks,
    /// Print the plan for the given targets as a Mermaid graph
    Graph {
        #[arg(required = true)]
        targets: Vec<String>,
    },
    /// Run arbitrary tasks
    Exec {
        #[arg(required = true)]
        tasks: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = gantry::utils::init_logging(cli.verbose) {
        eprintln!("Couldn't initialize logging: {err}");
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err}", style("error:").red().bold());
            ExitCode::from(err.exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<(), GantryError> {
    let root = cli.directory;

    let mut config = match &cli.config {
        Some(path) => Config::load(&root.join(path))?,
        None => Config::discover(&root)?,
    };
    config.apply(&RuntimeArgs {
        max_concurrency: cli.jobs,
        continue_on_failure: cli.continue_on_failure.then_some(true),
    });

    let project = Project::new(root, config);

    let targets: Vec<String> = match cli.command {
        Command::ProtoVersion => {
            println!("{}", project.proto_version()?);
            return Ok(());
        }
        Command::Tasks => {
            for task in project.registry()?.iter() {
                println!("{:<24} {}", task.id(), task.description().unwrap_or_default());
            }
            return Ok(());
        }
        Command::Graph { targets } => {
            let engine = project.engine()?;
            let plan = engine.schedule(&Selection::new(targets).exclude(cli.exclude))?;
            print!("{plan}");
            return Ok(());
        }
        Command::Assemble => vec![ASSEMBLE.into()],
        Command::Run => vec![RUN.into()],
        Command::Clean => vec![CLEAN.into()],
        Command::Exec { tasks } => tasks,
    };

    let _lock = InvocationLock::acquire(&project.build_dir())?;

    let mut engine = project.engine()?;
    if cli.rerun_tasks {
        engine = engine.with_policy(Always);
    }

    let start = Instant::now();
    let plan = engine.schedule(&Selection::new(targets).exclude(cli.exclude))?;
    let report = engine.execute(&plan)?;

    summarize(&report);
    report.into_result()?;

    eprintln!(
        "{} {}",
        style("BUILD SUCCESSFUL").green().bold(),
        as_overhead(start.elapsed())
    );
    Ok(())
}

fn summarize(report: &Report) {
    for id in &report.order {
        let Some(status) = report.status(id) else {
            continue;
        };
        let label = match status {
            TaskStatus::Succeeded => style(status.to_string()).green(),
            TaskStatus::Failed => style(status.to_string()).red(),
            TaskStatus::Skipped(_) if status.is_up_to_date() => style(status.to_string()).blue(),
            _ => style(status.to_string()).yellow(),
        };
        eprintln!("> {id:<24} {label}");
    }
}
