use crate::prelude::*;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use super::environment::{Environment, InstalledDistribution, Snapshot};
use super::plan::{BinaryPolicy, Operation, OperationKind, Plan};
use super::uninstall;
use super::wheel::install_wheel;
use crate::db::{pick_best_wheel, IndexedArtifact, PackageDB, SdistBuilder, Wheel};
use crate::index::Source;
use crate::resolve::ResolvedPackage;

/// Cooperative cancellation: suspendable work checks this between
/// operations (and long phases within one), never mid-write.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        Default::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SprigError::Cancelled.into())
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub workers: usize,
    pub compile: bool,
    pub binary_policy: BinaryPolicy,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        ExecutorOptions {
            workers: default_worker_count(),
            compile: false,
            binary_policy: BinaryPolicy::default(),
        }
    }
}

pub fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores + 4).min(32)
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    /// (package, what happened), in completion order
    pub performed: Vec<(PackageName, String)>,
    /// (package, what went wrong)
    pub failures: Vec<(PackageName, String)>,
    /// the environment's installed set after execution
    pub snapshot: Snapshot,
}

impl ExecutionReport {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }
}

// Scheduling state shared by the worker pool. An operation is claimable
// when every operation it depends on has completed; a single failure
// poisons the pool, which stops new claims but lets in-flight operations
// run to completion (rolling themselves back if they were mid-update).
struct Sched {
    started: Vec<bool>,
    completed: Vec<bool>,
    poisoned: bool,
    in_flight: usize,
    performed: Vec<(PackageName, String)>,
    failures: Vec<(PackageName, String)>,
}

impl Sched {
    fn claim(&mut self, plan: &Plan) -> Option<usize> {
        if self.poisoned {
            return None;
        }
        for (i, op) in plan.operations.iter().enumerate() {
            if self.started[i] {
                continue;
            }
            if op.depends_on.iter().all(|&dep| self.completed[dep]) {
                self.started[i] = true;
                self.in_flight += 1;
                return Some(i);
            }
        }
        None
    }

    fn all_done(&self) -> bool {
        if self.in_flight > 0 {
            return false;
        }
        // nothing in flight: either the pool is poisoned (unstarted work is
        // abandoned) or everything has been claimed and finished
        self.poisoned || self.started.iter().all(|s| *s)
    }
}

/// Run the plan against the environment with a bounded worker pool.
pub fn execute(
    db: &PackageDB,
    env: &Environment,
    snapshot: Snapshot,
    plan: &Plan,
    builder: &SdistBuilder,
    options: &ExecutorOptions,
    cancel: &CancelToken,
) -> Result<ExecutionReport> {
    let n = plan.operations.len();
    let sched = Mutex::new(Sched {
        started: vec![false; n],
        completed: vec![false; n],
        poisoned: false,
        in_flight: 0,
        performed: Vec::new(),
        failures: Vec::new(),
    });
    let wakeup = Condvar::new();
    let snapshot = Mutex::new(snapshot);
    let workers = options.workers.max(1).min(n.max(1));

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let claimed = {
                        let mut state = sched.lock().unwrap();
                        if cancel.is_cancelled() {
                            state.poisoned = true;
                        }
                        loop {
                            if let Some(i) = state.claim(plan) {
                                break Some(i);
                            }
                            if state.all_done() {
                                wakeup.notify_all();
                                break None;
                            }
                            state = wakeup.wait(state).unwrap();
                            if cancel.is_cancelled() {
                                state.poisoned = true;
                            }
                        }
                    };
                    let Some(i) = claimed else {
                        return;
                    };
                    let op = &plan.operations[i];
                    let outcome = run_operation(
                        db, env, &snapshot, op, builder, options, cancel,
                    );
                    let mut state = sched.lock().unwrap();
                    state.in_flight -= 1;
                    match outcome {
                        Ok(action) => {
                            state.completed[i] = true;
                            if !action.is_empty() {
                                state.performed.push((op.name.clone(), action));
                            }
                        }
                        Err(err) => {
                            warn!("{} failed: {:#}", op.name.as_given(), err);
                            state.poisoned = true;
                            state.failures.push((op.name.clone(), format!("{:#}", err)));
                        }
                    }
                    wakeup.notify_all();
                }
            });
        }
    });

    let state = sched.into_inner().unwrap();
    let snapshot = snapshot.into_inner().unwrap();
    Ok(ExecutionReport {
        performed: state.performed,
        failures: state.failures,
        snapshot,
    })
}

/// Run one operation to completion. Returns a human-readable action tag for
/// the report; errors poison the pool.
fn run_operation(
    db: &PackageDB,
    env: &Environment,
    snapshot: &Mutex<Snapshot>,
    op: &Operation,
    builder: &SdistBuilder,
    options: &ExecutorOptions,
    cancel: &CancelToken,
) -> Result<String> {
    cancel.check()?;
    match &op.kind {
        OperationKind::Skip => Ok(String::new()),
        OperationKind::Remove { version } => {
            let dist = {
                let snapshot = snapshot.lock().unwrap();
                snapshot.get(&op.name).cloned()
            };
            let Some(dist) = dist else {
                // already gone; removing twice is a no-op, not a failure
                return Ok(String::new());
            };
            uninstall::uninstall(&dist, env)?;
            snapshot.lock().unwrap().forget(&op.name);
            Ok(format!("removed {}", version))
        }
        OperationKind::Install => {
            let package = op.package.as_ref().unwrap();
            let (dist, written) = materialize(db, env, package, builder, options, cancel)?;
            if options.compile {
                env.compile_pyc(&written)?;
            }
            snapshot.lock().unwrap().record(dist);
            Ok(format!("installed {}", package.id.version))
        }
        OperationKind::Update { from } => {
            let package = op.package.as_ref().unwrap();
            // a failed fetch/build must leave the old version untouched, so
            // updates for wheel-backed packages fetch before touching
            // anything; develop installs are cheap enough not to bother
            let prepared = if package.develop {
                None
            } else {
                let wheel = obtain_wheel(db, env, package, builder, options, cancel)?;
                cancel.check()?;
                Some(wheel)
            };

            let old = {
                let snapshot = snapshot.lock().unwrap();
                snapshot.get(&op.name).cloned()
            };
            let Some(old) = old else {
                bail!("{} disappeared mid-plan", op.name.as_given());
            };
            let backup = uninstall::backup(&old, env)?;
            uninstall::uninstall(&old, env)?;

            let installed = match &prepared {
                Some(wheel) => install_wheel(env, wheel),
                None => materialize(db, env, package, builder, options, cancel),
            };
            match installed {
                Ok((dist, written)) => {
                    if options.compile {
                        env.compile_pyc(&written)?;
                    }
                    let mut snapshot = snapshot.lock().unwrap();
                    snapshot.record(dist);
                    Ok(format!("updated {} -> {}", from, package.id.version))
                }
                Err(err) => {
                    // put the old version back; the snapshot never changed
                    warn!(
                        "installing {} {} failed; restoring {}",
                        op.name.as_given(),
                        package.id.version,
                        from
                    );
                    backup
                        .restore()
                        .wrap_err("rollback after failed update also failed")?;
                    Err(err)
                }
            }
        }
    }
}

/// Produce the installed distribution for a package: develop installs link
/// the source tree; everything else installs a wheel.
fn materialize(
    db: &PackageDB,
    env: &Environment,
    package: &ResolvedPackage,
    builder: &SdistBuilder,
    options: &ExecutorOptions,
    cancel: &CancelToken,
) -> Result<(InstalledDistribution, Vec<std::path::PathBuf>)> {
    if package.develop {
        let tree = match &package.id.source {
            Source::Path { path } => std::path::PathBuf::from(path),
            Source::Vcs {
                url,
                resolved_commit,
                ..
            } => db.vcs_checkout(url, resolved_commit)?,
            _ => bail!(
                "develop install of {} requires a path or VCS source",
                package.id.name.as_given()
            ),
        };
        return super::wheel::install_develop(
            env,
            &package.id.name,
            &package.id.version,
            &tree,
        );
    }
    let wheel = obtain_wheel(db, env, package, builder, options, cancel)?;
    cancel.check()?;
    install_wheel(env, &wheel)
}

/// Get a wheel for this package: the best compatible index wheel if the
/// binary policy allows one, otherwise a locally built one from the sdist
/// or source tree. Hashes are verified against the lock on the way.
fn obtain_wheel(
    db: &PackageDB,
    env: &Environment,
    package: &ResolvedPackage,
    builder: &SdistBuilder,
    options: &ExecutorOptions,
    cancel: &CancelToken,
) -> Result<Wheel> {
    cancel.check()?;
    match &package.id.source {
        Source::Path { path } => {
            let tree = std::path::PathBuf::from(path);
            builder.built_wheel_from_tree(db, &package.id.name, &tree, &env.tags)
        }
        Source::Vcs {
            url,
            resolved_commit,
            ..
        } => {
            let tree = db.vcs_checkout(url, resolved_commit)?;
            builder.built_wheel_from_tree(db, &package.id.name, &tree, &env.tags)
        }
        Source::Url { url } => {
            // a direct reference has exactly one artifact: the URL itself
            let filename = url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .ok_or_else(|| eyre!("direct URL {} has no filename", url))?
                .to_owned();
            let artifact_name: ArtifactName = filename.as_str().try_into()?;
            match artifact_name {
                ArtifactName::Wheel(wheel_name) => {
                    let body =
                        db.http().get_hashed(url, None, crate::db::CacheMode::Default)?;
                    Wheel::new(wheel_name, body)
                }
                ArtifactName::Sdist(sdist_name) => {
                    let mut body =
                        db.http().get_hashed(url, None, crate::db::CacheMode::Default)?;
                    let sdist = crate::db::Sdist::new(sdist_name, {
                        let mut staged = tempfile::tempfile()?;
                        std::io::copy(&mut body, &mut staged)?;
                        staged.rewind()?;
                        Box::new(staged)
                    })?;
                    let tree = tempfile::tempdir()?;
                    sdist.unpack(&mut crate::tree::WriteTreeFS::new(tree.path()))?;
                    let root = single_tree_root(tree.path())?;
                    builder.built_wheel_from_tree(db, &package.id.name, &root, &env.tags)
                }
            }
        }
        Source::Index { name: source_name, .. } => {
            let artifacts = db.artifacts_for_version(
                &package.id.name,
                &package.id.version,
                Some(source_name.as_str()),
            )?;
            let locked: Vec<IndexedArtifact> = artifacts
                .iter()
                .filter(|ia| lock_admits(package, &ia.info.hash))
                .cloned()
                .collect();
            if locked.is_empty() {
                return Err(SprigError::ArtifactHashMismatch {
                    url: package.id.name.as_given().to_owned(),
                    expected: format!("one of {} locked hashes", package.files.len()),
                    got: "no matching artifact".into(),
                }
                .into());
            }

            if options.binary_policy.wheels_allowed(&package.id.name) {
                if let Some(ia) = pick_best_wheel(&locked, &env.tags) {
                    // get_wheel streams through a hash check against the
                    // lock-recorded digest
                    return db.get_wheel(&ia.info);
                }
            }
            if !options.binary_policy.sdists_allowed() {
                return Err(SprigError::NoCompatibleArtifact {
                    kind: "wheel (builds disabled by binary policy)".into(),
                    name: package.id.name.as_given().to_owned(),
                    version: package.id.version.clone(),
                }
                .into());
            }
            let sdist = locked
                .iter()
                .find(|ia| ia.info.name.as_sdist().is_some())
                .ok_or_else(|| SprigError::NoCompatibleArtifact {
                    kind: "artifact".into(),
                    name: package.id.name.as_given().to_owned(),
                    version: package.id.version.clone(),
                })?;
            builder.built_wheel(db, &sdist.info, &env.tags)
        }
    }
}

/// Unpacked sdists contain a single top-level directory; find it.
fn single_tree_root(unpacked: &std::path::Path) -> Result<std::path::PathBuf> {
    let mut entries = std::fs::read_dir(unpacked)?
        .collect::<std::result::Result<Vec<_>, std::io::Error>>()?;
    if entries.len() != 1 {
        bail!("expected archive to contain exactly one top-level directory");
    }
    Ok(entries.pop().unwrap().path())
}

/// An artifact is admissible only if the lock recorded its exact hash.
fn lock_admits(package: &ResolvedPackage, hash: &Option<ArtifactHash>) -> bool {
    match hash {
        Some(hash) => package.files.iter().any(|(_, locked)| locked == hash),
        // path/VCS entries legitimately have no hashes; index entries
        // without one are never trusted at install time
        None => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
        token.cancel();
        assert!(token.is_cancelled());
        let err = token.check().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SprigError>(),
            Some(SprigError::Cancelled)
        ));
    }

    #[test]
    fn test_default_worker_count_capped() {
        let workers = default_worker_count();
        assert!(workers >= 5);
        assert!(workers <= 32);
    }

    #[test]
    fn test_lock_admits_requires_exact_hash() {
        use crate::index::{PackageId, Source};
        let hash = ArtifactHash::sha256_of(b"wheel bytes");
        let package = ResolvedPackage {
            id: PackageId {
                name: "demo".parse().unwrap(),
                version: "1.0".parse().unwrap(),
                source: Source::Index {
                    name: "pypi".into(),
                    url: "https://pypi.org/simple/".parse().unwrap(),
                },
            },
            dependencies: vec![],
            provided_extras: vec![],
            active_extras: vec![],
            requires_python: Specifiers::any(),
            files: vec![("demo-1.0-py3-none-any.whl".into(), hash.clone())],
            develop: false,
            marker: None,
            groups: vec!["main".into()],
        };
        assert!(lock_admits(&package, &Some(hash)));
        assert!(!lock_admits(&package, &Some(ArtifactHash::sha256_of(b"evil"))));
        assert!(!lock_admits(&package, &None));
    }
}
