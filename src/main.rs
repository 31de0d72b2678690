#![forbid(unsafe_code)]

mod commands;
mod config;
mod db;
mod error;
mod index;
mod install;
mod lock;
mod manifest;
mod output;
mod prelude;
mod resolve;
mod tree;
mod util;
mod vocab;

#[cfg(test)]
mod test_util;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::commands::RefreshPolicy;
use crate::config::{Config, DeclaredConfig};
use crate::db::PackageDB;
use crate::index::GitCli;
use crate::install::{
    CancelToken, Environment, ExecutorOptions, PlanOptions,
};
use crate::lock::Lock;
use crate::manifest::Manifest;
use crate::prelude::*;

#[derive(Parser)]
#[command(name = "sprig", version, about = "Resolve, lock, and install Python project dependencies")]
struct Cli {
    #[command(flatten)]
    output: output::OutputArgs,
    /// Project directory (defaults to the current directory)
    #[arg(long, global = true, value_name = "DIR")]
    project: Option<PathBuf>,
    /// Python interpreter of the target environment
    #[arg(long, global = true, value_name = "PATH")]
    python: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone, Default)]
struct SelectionArgs {
    /// Dependency groups to include (repeatable)
    #[arg(long = "group", value_name = "NAME")]
    groups: Vec<String>,
    /// Project extras to activate (repeatable)
    #[arg(long = "extra", value_name = "NAME")]
    extras: Vec<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve dependencies and write the lock file
    Lock,
    /// Install the locked dependencies into the environment
    Install {
        #[command(flatten)]
        selection: SelectionArgs,
        /// Remove installed packages the lock doesn't cover
        #[arg(long)]
        sync: bool,
        /// Plan only; don't touch the environment
        #[arg(long)]
        dry_run: bool,
        /// Refuse to proceed if the lock is stale, instead of re-resolving
        #[arg(long)]
        frozen: bool,
        /// Byte-compile installed sources
        #[arg(long)]
        compile: bool,
    },
    /// Add requirements to the manifest's dependency set and re-lock
    Add {
        /// PEP 508 requirement strings
        requirements: Vec<String>,
        #[arg(long, default_value = crate::manifest::MAIN_GROUP)]
        group: String,
    },
    /// Remove requirements and re-lock
    Remove {
        names: Vec<String>,
        #[arg(long, default_value = crate::manifest::MAIN_GROUP)]
        group: String,
    },
    /// Re-resolve named packages (or everything) to their newest versions
    Update { names: Vec<String> },
    /// List locked packages
    Show {
        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// Render the lock as a pinned requirements list
    Export {
        #[command(flatten)]
        selection: SelectionArgs,
    },
}

fn plan_options(selection: &SelectionArgs) -> Result<PlanOptions> {
    Ok(PlanOptions {
        groups: selection.groups.clone(),
        extras: selection
            .extras
            .iter()
            .map(|e| e.as_str().try_into())
            .collect::<Result<_>>()?,
        ..Default::default()
    })
}

struct Workspace {
    config: Config,
    manifest: Manifest,
    lock_path: PathBuf,
    lock: Option<Lock>,
    db: PackageDB,
}

fn open_workspace(project: Option<PathBuf>) -> Result<Workspace> {
    let root = match project {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let manifest_path = root.join("sprig.toml");
    let manifest = Manifest::parse(
        &std::fs::read_to_string(&manifest_path)
            .map_err(|e| SprigError::ManifestInvalid(e.to_string()))?,
    )?;
    let config = Config::resolve(DeclaredConfig::default())?;
    let sources = config.sources_for(&manifest.sources)?;
    let http_options = config.http_options(&sources);
    let db = PackageDB::new(
        sources,
        &config.cache_dir,
        http_options,
        Box::new(GitCli),
        &root,
    )?;
    let lock_path = root.join("sprig.lock");
    let lock = if lock_path.exists() {
        Some(Lock::load(&lock_path)?)
    } else {
        None
    };
    Ok(Workspace {
        config,
        manifest,
        lock_path,
        lock,
        db,
    })
}

fn probe_environment(python: Option<PathBuf>) -> Result<Environment> {
    let interpreter = python.unwrap_or_else(|| PathBuf::from("python3"));
    Environment::probe(&interpreter)
}

fn run(cli: Cli) -> Result<()> {
    let ws = open_workspace(cli.project.clone())?;
    match cli.command {
        Command::Lock => {
            // locking sdist-only packages needs a build backend, which needs
            // an interpreter; missing one only bites if we actually hit an
            // sdist with no usable wheel
            let builder = probe_environment(cli.python)
                .ok()
                .and_then(|env| commands::builder_for(&env).ok());
            let outcome =
                commands::lock(&ws.db, &ws.manifest, ws.lock.as_ref(), builder.as_ref())?;
            let new_lock = outcome.new_lock.unwrap();
            new_lock.write(&ws.lock_path)?;
            for line in outcome.diagnostics {
                info!("{}", line);
            }
            info!("wrote {}", ws.lock_path.display());
        }
        Command::Install {
            selection,
            sync,
            dry_run,
            frozen,
            compile,
        } => {
            let env = probe_environment(cli.python)?;
            let mut plan_options = plan_options(&selection)?;
            plan_options.sync = sync;
            plan_options.compile = compile;
            plan_options.binary_policy = ws.config.binary_policy.clone();
            let executor_options = ExecutorOptions {
                workers: ws.config.max_workers,
                compile,
                binary_policy: ws.config.binary_policy.clone(),
            };
            let refresh = if frozen {
                RefreshPolicy::Forbidden
            } else {
                RefreshPolicy::Allowed
            };
            let cancel = CancelToken::new();
            let outcome = commands::install(
                &ws.db,
                &ws.manifest,
                ws.lock.as_ref(),
                &env,
                &plan_options,
                &executor_options,
                refresh,
                dry_run,
                &cancel,
            )?;
            if let Some(new_lock) = &outcome.new_lock {
                new_lock.write(&ws.lock_path)?;
            }
            for line in &outcome.diagnostics {
                info!("{}", line);
            }
            if let Some(report) = &outcome.report {
                if !report.ok() {
                    for (name, why) in &report.failures {
                        tracing::error!("{}: {}", name.as_given(), why);
                    }
                    bail!("{} operations failed", report.failures.len());
                }
            }
        }
        Command::Add {
            requirements,
            group,
        } => {
            let (_, outcome) = commands::add(
                &ws.db,
                &ws.manifest,
                ws.lock.as_ref(),
                &group,
                &requirements,
                None,
            )?;
            outcome.new_lock.unwrap().write(&ws.lock_path)?;
            info!("locked with {} added to {}", requirements.join(", "), group);
        }
        Command::Remove { names, group } => {
            let names = names
                .iter()
                .map(|n| n.as_str().try_into())
                .collect::<Result<Vec<PackageName>>>()?;
            let (_, outcome) = commands::remove(
                &ws.db,
                &ws.manifest,
                ws.lock.as_ref(),
                &group,
                &names,
                None,
            )?;
            outcome.new_lock.unwrap().write(&ws.lock_path)?;
        }
        Command::Update { names } => {
            let lock = ws
                .lock
                .as_ref()
                .ok_or_else(|| eyre!("nothing to update: no lock file yet"))?;
            let names = names
                .iter()
                .map(|n| n.as_str().try_into())
                .collect::<Result<Vec<PackageName>>>()?;
            let outcome =
                commands::update(&ws.db, &ws.manifest, lock, &names, None)?;
            outcome.new_lock.unwrap().write(&ws.lock_path)?;
        }
        Command::Show { selection } => {
            let lock = ws
                .lock
                .as_ref()
                .ok_or_else(|| eyre!("no lock file; run `sprig lock` first"))?;
            for line in commands::show(lock, &selection.groups)? {
                println!("{}", line);
            }
        }
        Command::Export { selection } => {
            let lock = ws
                .lock
                .as_ref()
                .ok_or_else(|| eyre!("no lock file; run `sprig lock` first"))?;
            let plan_options = plan_options(&selection)?;
            print!("{}", commands::export(lock, &plan_options)?);
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    output::init(&cli.output);
    if let Err(err) = run(cli) {
        output::report_failure(&err);
        std::process::exit(error::exit_code(&err));
    }
}
