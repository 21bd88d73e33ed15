//! roster: the command-line driver for the membership reconciliation engine.
//!
//! # Usage
//!
//! ```text
//! roster plan desired.yaml
//! roster apply desired.yaml
//! roster read eng
//! roster destroy eng
//! ```
//!
//! The remote authority is simulated by a JSON state file
//! (`--authority`); local records live in `--records`.

mod error;
mod store;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use roster_core::{
    settings, DesiredMembership, GroupHandle, InMemoryAuthority, LocalRecord, ReconcileError,
    ReconcileSettings, Reconciled, Reconciler, SystemClock, TracingObserver,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::CliError;
use crate::store::RecordStore;

const LOCK_TIMEOUT_MS: u64 = 10_000;

#[derive(Parser)]
#[command(name = "roster")]
#[command(about = "Converge declared group membership with the remote authority", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Reconciliation settings (YAML)
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    /// Simulated authority state (JSON)
    #[arg(short, long, global = true, default_value = "authority.json")]
    authority: PathBuf,

    /// Local record store (JSON)
    #[arg(short, long, global = true, default_value = "records.json")]
    records: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Show what apply would change, without changing anything
    Plan {
        /// Desired-state file (YAML list of declarations)
        desired: PathBuf,
    },

    /// Create or update every declared group
    Apply {
        /// Desired-state file (YAML list of declarations)
        desired: PathBuf,
    },

    /// Report current membership; an unrecorded group is imported
    Read {
        /// Group to read (default: every recorded group)
        group: Option<String>,
    },

    /// Remove every recorded member from a group and forget it
    Destroy {
        /// Group to destroy
        group: String,
    },
}


fn main() {
    init_tracing();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!(error = %e, "roster failed");
            eprintln!("roster: {}", e);
            process::exit(1);
        }
    }
}


/// Logs go to stderr, filtered by `ROSTER_LOG` (default `info`).
fn init_tracing() {
    let filter = EnvFilter::try_from_env("ROSTER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}


fn load_settings(path: Option<&Path>) -> Result<ReconcileSettings, CliError> {
    match path {
        Some(p) => Ok(settings::load(p)?),
        None => Ok(settings::default_settings()),
    }
}


/// Returns `Ok(false)` when at least one group failed.
fn run(cli: &Cli) -> Result<bool, CliError> {
    let settings = load_settings(cli.settings.as_deref())?;
    let _lock = store::acquire_lock(&cli.records, LOCK_TIMEOUT_MS)?;
    let mut records = RecordStore::load(&cli.records)?;
    let authority = InMemoryAuthority::from_state(store::load_authority(&cli.authority)?);
    let clock = SystemClock::new();
    let observer = TracingObserver;
    let reconciler = Reconciler::new(&authority, settings, &clock, &observer);

    let ok = match &cli.command {
        Commands::Plan { desired } => plan(&reconciler, &records, desired)?,
        Commands::Apply { desired } => apply(&reconciler, &mut records, desired)?,
        Commands::Read { group } => read(&reconciler, &mut records, group.as_deref())?,
        Commands::Destroy { group } => destroy(&reconciler, &mut records, group)?,
    };

    records.save()?;
    if matches!(cli.command, Commands::Apply { .. } | Commands::Destroy { .. }) {
        store::save_authority(&cli.authority, &authority.state())?;
    }
    Ok(ok)
}


fn load_desired(path: &Path) -> Result<Vec<DesiredMembership>, CliError> {
    let decls = store::load_declarations(path)?;
    let mut desired: Vec<DesiredMembership> = Vec::with_capacity(decls.len());
    for decl in &decls {
        let next = DesiredMembership::from_declaration(decl)?;
        if desired.iter().any(|d| d.group() == next.group()) {
            return Err(ReconcileError::Configuration(format!(
                "group {} is declared more than once",
                next.group()
            ))
            .into());
        }
        desired.push(next);
    }
    Ok(desired)
}


fn plan(reconciler: &Reconciler<'_>, records: &RecordStore, path: &Path) -> Result<bool, CliError> {
    let mut ok = true;
    for desired in load_desired(path)? {
        let group = desired.group();
        match reconciler.plan(&desired, records.get(group)) {
            Ok(diff) => {
                println!("{}: {}", group, diff.summary());
                for member in &diff.to_remove {
                    println!("  - {}", member);
                }
                for member in &diff.to_add {
                    println!("  + {}", member);
                }
                for member in &diff.unresolved {
                    println!("  ? {}", member);
                }
            }
            Err(e) => {
                println!("{}: {}", group, e);
                ok = false;
            }
        }
    }
    Ok(ok)
}


/// Reconcile every declared group concurrently, one session per group.
fn apply(
    reconciler: &Reconciler<'_>,
    records: &mut RecordStore,
    path: &Path,
) -> Result<bool, CliError> {
    let desired = load_desired(path)?;
    let snapshot: &RecordStore = records;
    let outcomes: Vec<(GroupHandle, Result<Reconciled, ReconcileError>)> =
        std::thread::scope(|scope| {
            let handles: Vec<_> = desired
                .iter()
                .map(|d| {
                    let previous = snapshot.get(d.group()).cloned();
                    scope.spawn(move || {
                        let outcome = match previous {
                            None => reconciler.create(d),
                            Some(record) => record
                                .to_desired()
                                .and_then(|old| reconciler.update(d.group(), &old, d)),
                        };
                        (d.group().clone(), outcome)
                    })
                })
                .collect();
            handles
                .into_iter()
                .zip(desired.iter())
                .map(|(h, d)| match h.join() {
                    Ok(outcome) => outcome,
                    Err(_) => (
                        d.group().clone(),
                        Err(ReconcileError::Configuration(format!(
                            "group {}: worker panicked",
                            d.group()
                        ))),
                    ),
                })
                .collect()
        });

    let mut ok = true;
    for ((group, outcome), declared) in outcomes.into_iter().zip(&desired) {
        match outcome {
            Ok(done) => {
                let note = if done.stale { " (not yet visible)" } else { "" };
                println!(
                    "{}: +{} -{}{}",
                    group,
                    done.report.added.len(),
                    done.report.removed.len(),
                    note
                );
                // A stale read has not caught up yet; record what was applied.
                match &done.snapshot {
                    Some(_) if done.stale => records.put(LocalRecord::from(declared)),
                    Some(snapshot) => records.put(snapshot.to_record()),
                    None => {}
                }
            }
            Err(e) => {
                if e.is_rerunnable() {
                    warn!(%group, error = %e, "incomplete; re-run apply to finish");
                }
                // The resolvable members were applied; keep tracking them.
                if let ReconcileError::Unresolved { membership, .. } = &e {
                    records.put(membership.to_record());
                }
                println!("{}: {}", group, e);
                ok = false;
            }
        }
    }
    Ok(ok)
}


fn read(
    reconciler: &Reconciler<'_>,
    records: &mut RecordStore,
    group: Option<&str>,
) -> Result<bool, CliError> {
    let groups = match group {
        Some(g) => vec![GroupHandle::new(g)],
        None => records.groups(),
    };
    let mut ok = true;
    for group in groups {
        let record = records.get(&group).cloned();
        match reconciler.read(&group, record.as_ref()) {
            Ok(snapshot) if snapshot.vacant && record.is_some() => {
                info!(%group, "group has no members left; forgetting it");
                records.remove(&group);
                println!("{}: gone", group);
            }
            Ok(snapshot) => {
                let members: Vec<String> = snapshot.members.iter().map(|m| m.to_string()).collect();
                println!("{}: [{}]", group, members.join(", "));
                records.put(snapshot.to_record());
            }
            Err(e) => {
                println!("{}: {}", group, e);
                ok = false;
            }
        }
    }
    Ok(ok)
}


fn destroy(
    reconciler: &Reconciler<'_>,
    records: &mut RecordStore,
    group: &str,
) -> Result<bool, CliError> {
    let group = GroupHandle::new(group);
    let Some(record) = records.get(&group).cloned() else {
        println!("{}: no record, nothing to destroy", group);
        return Ok(true);
    };
    let desired = record.to_desired()?;
    match reconciler.delete(&group, &desired) {
        Ok(done) => {
            records.remove(&group);
            println!("{}: -{}", group, done.report.removed.len());
            Ok(true)
        }
        Err(e) => {
            println!("{}: {}", group, e);
            Ok(false)
        }
    }
}
