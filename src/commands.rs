use crate::prelude::*;

use crate::db::{PackageDB, SdistBuilder};
use crate::install::{
    execute, plan as make_plan, CancelToken, Environment, ExecutionReport,
    ExecutorOptions, OperationKind, Plan, PlanOptions, Snapshot,
};
use crate::lock::Lock;
use crate::manifest::{Manifest, ManifestRequirement, MAIN_GROUP};
use crate::resolve::{resolve, ResolveOptions};

// Each command is a pure function from (manifest, lock?, environment,
// options) to (new lock?, operations, diagnostics). The CLI shell owns all
// I/O around these: reading the manifest, persisting locks, exit codes.

/// What to do when the lock is missing or out of sync with the manifest.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// re-resolve as needed
    Allowed,
    /// fail with LockInconsistent instead
    Forbidden,
}

#[derive(Debug, Default)]
pub struct CommandOutcome {
    pub new_lock: Option<Lock>,
    pub plan: Plan,
    pub diagnostics: Vec<String>,
    pub report: Option<ExecutionReport>,
}

/// `lock`: produce a fresh lock for the manifest. An existing lock
/// contributes version hints, so re-locking drifts as little as possible.
pub fn lock(
    db: &PackageDB,
    manifest: &Manifest,
    previous: Option<&Lock>,
    builder: Option<&SdistBuilder>,
) -> Result<CommandOutcome> {
    let mut options = ResolveOptions::default();
    if let Some(previous) = previous {
        options.hints = previous.hints();
    }
    let solution = resolve(db, manifest, &options, builder)?;
    let new_lock = Lock::from_solution(&solution, manifest)?;
    let changed = previous != Some(&new_lock);
    Ok(CommandOutcome {
        new_lock: Some(new_lock),
        plan: Plan::default(),
        diagnostics: if changed {
            vec![]
        } else {
            vec!["lock is already up to date".into()]
        },
        report: None,
    })
}

/// Get a usable solution out of the lock, re-resolving only when the given
/// policy allows. This is where lock-version gating bites: a current-enough
/// lock gets its markers evaluated as-is, an old one must be re-resolved.
fn locked_solution(
    db: &PackageDB,
    manifest: &Manifest,
    lock: Option<&Lock>,
    refresh: RefreshPolicy,
    builder: Option<&SdistBuilder>,
) -> Result<(crate::resolve::Solution, Option<Lock>)> {
    if let Some(lock) = lock {
        if lock.is_consistent_with(manifest)? && lock.supports_marker_evaluation() {
            return Ok((lock.to_solution()?, None));
        }
        if refresh == RefreshPolicy::Forbidden {
            return Err(SprigError::LockInconsistent.into());
        }
        let outcome = self::lock(db, manifest, Some(lock), builder)?;
        let new_lock = outcome.new_lock.unwrap();
        return Ok((new_lock.to_solution()?, Some(new_lock)));
    }
    if refresh == RefreshPolicy::Forbidden {
        return Err(SprigError::LockInconsistent.into());
    }
    let outcome = self::lock(db, manifest, None, builder)?;
    let new_lock = outcome.new_lock.unwrap();
    Ok((new_lock.to_solution()?, Some(new_lock)))
}

/// `install` / `sync`: diff the locked solution against the environment and
/// apply the result. With `dry_run`, plans but doesn't touch anything.
#[allow(clippy::too_many_arguments)]
pub fn install(
    db: &PackageDB,
    manifest: &Manifest,
    lock: Option<&Lock>,
    env: &Environment,
    plan_options: &PlanOptions,
    executor_options: &ExecutorOptions,
    refresh: RefreshPolicy,
    dry_run: bool,
    cancel: &CancelToken,
) -> Result<CommandOutcome> {
    let builder = builder_for(env)?;
    let (solution, new_lock) =
        locked_solution(db, manifest, lock, refresh, Some(&builder))?;

    let snapshot = env.snapshot()?;
    let mut plan_options = plan_options.clone();
    plan_options.keep_installed.push(manifest.name.clone());
    let mut plan = make_plan(&solution, &snapshot, &env.markers, &plan_options)?;
    if !plan_options.no_root {
        append_root_install(&mut plan, db, manifest, &snapshot);
    }
    let (installs, updates, removes, skips) = plan.counts();
    let mut diagnostics = vec![format!(
        "{} installs, {} updates, {} removals, {} up to date",
        installs, updates, removes, skips
    )];

    if dry_run || plan.is_noop() {
        return Ok(CommandOutcome {
            new_lock,
            plan,
            diagnostics,
            report: None,
        });
    }

    let report = execute(db, env, snapshot, &plan, &builder, executor_options, cancel)?;
    for (name, what) in &report.performed {
        diagnostics.push(format!("{}: {}", name.as_given(), what));
    }
    Ok(CommandOutcome {
        new_lock,
        plan,
        diagnostics,
        report: Some(report),
    })
}

/// `add`: extend a group with new requirements and re-lock. The returned
/// manifest is the caller's to persist; the core never writes it.
pub fn add(
    db: &PackageDB,
    manifest: &Manifest,
    lock: Option<&Lock>,
    group: &str,
    requirements: &[String],
    builder: Option<&SdistBuilder>,
) -> Result<(Manifest, CommandOutcome)> {
    let mut updated = manifest.clone();
    for text in requirements {
        let requirement = Requirement::parse(text, ParseExtra::NotAllowed)?;
        let entry = ManifestRequirement {
            requirement,
            source: None,
            local: None,
            develop: false,
        };
        if group == MAIN_GROUP {
            updated.dependencies.push(entry);
        } else {
            updated.groups.entry(group.into()).or_default().dependencies.push(entry);
        }
    }
    let outcome = self::lock(db, &updated, lock, builder)?;
    Ok((updated, outcome))
}

/// `remove`: drop requirements from a group and re-lock.
pub fn remove(
    db: &PackageDB,
    manifest: &Manifest,
    lock: Option<&Lock>,
    group: &str,
    names: &[PackageName],
    builder: Option<&SdistBuilder>,
) -> Result<(Manifest, CommandOutcome)> {
    let mut updated = manifest.clone();
    let removed: &mut Vec<ManifestRequirement> = if group == MAIN_GROUP {
        &mut updated.dependencies
    } else {
        &mut updated
            .groups
            .get_mut(group)
            .ok_or_else(|| eyre!("no dependency group named {:?}", group))?
            .dependencies
    };
    let before = removed.len();
    removed.retain(|req| !names.contains(&req.requirement.name));
    if removed.len() == before {
        bail!(
            "none of the given packages are declared in group {:?}",
            group
        );
    }
    let outcome = self::lock(db, &updated, lock, builder)?;
    Ok((updated, outcome))
}

/// `update`: re-resolve, dropping the version hints for the named packages
/// (or all of them), so they float up to their newest compatible versions.
pub fn update(
    db: &PackageDB,
    manifest: &Manifest,
    lock: &Lock,
    names: &[PackageName],
    builder: Option<&SdistBuilder>,
) -> Result<CommandOutcome> {
    let mut options = ResolveOptions::default();
    if !names.is_empty() {
        let mut hints = lock.hints();
        for name in names {
            hints.drop(name);
        }
        options.hints = hints;
    }
    let solution = resolve(db, manifest, &options, builder)?;
    let new_lock = Lock::from_solution(&solution, manifest)?;
    Ok(CommandOutcome {
        new_lock: Some(new_lock),
        plan: Plan::default(),
        diagnostics: vec![],
        report: None,
    })
}

/// `show`: one line per locked package applying to the given groups.
pub fn show(lock: &Lock, groups: &[String]) -> Result<Vec<String>> {
    let requested: HashSet<&String> = groups.iter().collect();
    let mut lines = Vec::new();
    for package in &lock.package {
        if !groups.is_empty() && !package.groups.iter().any(|g| requested.contains(g)) {
            continue;
        }
        let mut line = format!("{} {}", package.name.as_given(), package.version);
        if let Some(marker) = &package.marker {
            line.push_str(&format!(" ; {}", marker));
        }
        lines.push(line);
    }
    Ok(lines)
}

/// `export`: render the locked solution as a requirements list with pinned
/// versions, markers, and hashes, filtered the same way a plan would be.
pub fn export(
    lock: &Lock,
    plan_options: &PlanOptions,
) -> Result<String> {
    let solution = lock.to_solution()?;
    let requested: HashSet<String> = plan_options.requested_groups().into_iter().collect();
    let mut out = String::new();
    for package in &solution.packages {
        if !package.groups.iter().any(|g| requested.contains(g)) {
            continue;
        }
        // extras placeholders don't belong in an export; project the marker
        // against the requested extras and keep only the residue
        let residual = match &package.marker {
            None => None,
            Some(marker) => {
                let mut keep: Option<Option<Marker>> = None;
                let mut activations: Vec<Option<&Extra>> = vec![None];
                activations.extend(plan_options.extras.iter().map(Some));
                for activation in activations {
                    match marker.without_extra(activation)? {
                        Simplified::False => continue,
                        Simplified::True => {
                            keep = Some(None);
                            break;
                        }
                        Simplified::Expr(residue) => {
                            keep = Some(match keep.flatten() {
                                None => Some(residue),
                                Some(seen) => Marker::or(Some(&seen), Some(&residue)),
                            });
                        }
                    }
                }
                match keep {
                    // dead under every requested activation
                    None => continue,
                    Some(residue) => residue,
                }
            }
        };

        out.push_str(&format!(
            "{}=={}",
            package.id.name.canonical(),
            package.id.version
        ));
        if let Some(marker) = residual {
            out.push_str(&format!(" ; {}", marker));
        }
        for (_, hash) in &package.files {
            out.push_str(&format!(" \\\n    --hash={}", hash));
        }
        out.push('\n');
    }
    Ok(out)
}

/// The project itself gets a develop install at the tail of every plan
/// (after all of its dependencies), unless no-root asked otherwise.
fn append_root_install(
    plan: &mut Plan,
    db: &PackageDB,
    manifest: &Manifest,
    snapshot: &Snapshot,
) {
    use crate::install::Operation;
    let kind = match snapshot.get(&manifest.name) {
        None => OperationKind::Install,
        Some(installed) if installed.version != manifest.version => {
            OperationKind::Update {
                from: installed.version.clone(),
            }
        }
        Some(_) => OperationKind::Skip,
    };
    let root = crate::resolve::ResolvedPackage {
        id: crate::index::PackageId {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            source: crate::index::Source::Path {
                path: db.project_root().to_string_lossy().into_owned(),
            },
        },
        dependencies: Vec::new(),
        provided_extras: Vec::new(),
        active_extras: Vec::new(),
        requires_python: manifest.requires_python.clone(),
        files: Vec::new(),
        develop: true,
        marker: None,
        groups: vec![MAIN_GROUP.to_string()],
    };
    let depends_on = (0..plan.operations.len()).collect();
    plan.operations.push(Operation {
        kind,
        name: manifest.name.clone(),
        package: Some(root),
        depends_on,
    });
}

pub fn builder_for(env: &Environment) -> Result<SdistBuilder> {
    Ok(SdistBuilder::new(
        env.interpreter.clone(),
        env.python_full_version()?,
        env.markers.clone(),
        env.tags.clone(),
    ))
}

