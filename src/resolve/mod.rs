mod resolver;
mod solution;

pub use resolver::{AllowPre, ResolverState, SolverPkg, ResolveOptions, VersionHints};
pub use solution::{propagate_markers_and_groups, ResolvedPackage, Solution};

use crate::db::{PackageDB, SdistBuilder};
use crate::manifest::{Manifest, ManifestRequirement};
use crate::prelude::*;

use pubgrub::report::{DefaultStringReporter, Reporter};

/// Flatten the manifest's requirements across every group, plus the
/// project's own extras (optional-dependencies). The lock always covers all
/// groups and all extras; filtering down to the requested ones happens at
/// plan time, not resolve time.
pub fn root_requirements(manifest: &Manifest) -> Result<Vec<(String, ManifestRequirement)>> {
    let mut out = Vec::new();
    for group in manifest.group_names() {
        for req in manifest.group_requirements(&group)? {
            out.push((group.clone(), req.clone()));
        }
    }
    for reqs in manifest.optional_dependencies.values() {
        for req in reqs {
            out.push((crate::manifest::MAIN_GROUP.to_string(), req.clone()));
        }
    }
    Ok(out)
}

/// A project extra's requirement edge is live only when that extra is
/// requested; the lock records this as an `extra == "..."` placeholder that
/// install-time filtering re-evaluates.
fn extra_guard(extra_name: &str, marker: Option<&Marker>) -> Result<Option<Marker>> {
    let extra: Extra = extra_name.parse()?;
    let atom = Marker::Atom {
        op: marker::Op::Compare(CompareOp::Equal),
        lhs: marker::Value::Variable("extra".into()),
        rhs: marker::Value::Literal(extra.canonical().into()),
    };
    Ok(Marker::and(marker, Some(&atom)))
}

/// Resolve the manifest into a complete platform-agnostic solution.
/// Deterministic: same manifest, same sources, same cache contents, same
/// options -> the same solution, independent of I/O timing.
pub fn resolve(
    db: &PackageDB,
    manifest: &Manifest,
    options: &ResolveOptions,
    builder: Option<&SdistBuilder>,
) -> Result<Solution> {
    context!("Resolving dependencies for {}", manifest.name.as_given());
    let roots = root_requirements(manifest)?;
    let python_range = manifest.supported_pythons()?;
    if python_range.is_empty() {
        return Err(SprigError::ManifestInvalid(
            "requires-python admits no versions at all".into(),
        )
        .into());
    }
    let state = ResolverState::new(db, &roots, python_range, options, builder)?;

    let result =
        pubgrub::solver::resolve(&state, SolverPkg::Root, resolver::ROOT_VERSION.clone());

    use pubgrub::error::PubGrubError::*;
    let chosen = match result {
        Ok(solution) => solution,
        Err(err) => {
            return Err(match err {
                NoSolution(mut derivation_tree) => {
                    derivation_tree.collapse_no_versions();
                    let report = DefaultStringReporter::report(&derivation_tree);
                    eyre::Report::new(SprigError::Unsatisfiable).wrap_err(report)
                }
                ErrorRetrievingDependencies {
                    package,
                    version,
                    source,
                } => eyre!("{}", source)
                    .wrap_err(format!("fetching dependencies of {} v{}", package, version)),
                ErrorChoosingPackageVersion(boxed_err) => {
                    // the dyn Error here is really an eyre::Report (possibly
                    // carrying a python-range diagnostic), but the type got
                    // erased on the way through pubgrub; stringifying is the
                    // best we can do
                    eyre::Report::new(SprigError::Unsatisfiable)
                        .wrap_err(format!("{boxed_err}"))
                }
                ErrorInShouldCancel(boxed_err) => eyre!("{}", boxed_err.to_string()),
                Failure(s) => eyre!("{}", s),
                DependencyOnTheEmptySet {
                    package,
                    version,
                    dependent,
                } => eyre!(
                    "{} v{}'s dependency on {} has self-contradictory version ranges",
                    package,
                    version,
                    dependent
                ),
                SelfDependency { package, version } => {
                    eyre!("{} v{} depends on itself", package, version)
                }
            });
        }
    };

    let packages = resolver::solution_packages(&state, chosen)?;
    let mut solution = Solution { packages };

    // Effective markers and group memberships flow from the root edges.
    // Group requirements contribute their own markers; the project's extras
    // contribute edges guarded by an `extra == "..."` placeholder, which is
    // what install-time extra selection later evaluates.
    let mut root_edges = Vec::new();
    for group in manifest.group_names() {
        for req in manifest.group_requirements(&group)? {
            root_edges.push((
                req.requirement.name.clone(),
                req.requirement.marker.clone(),
                group.clone(),
                req.requirement.extras.clone(),
            ));
        }
    }
    for (extra_name, reqs) in &manifest.optional_dependencies {
        for req in reqs {
            root_edges.push((
                req.requirement.name.clone(),
                extra_guard(extra_name, req.requirement.marker.as_ref())?,
                crate::manifest::MAIN_GROUP.to_string(),
                req.requirement.extras.clone(),
            ));
        }
    }
    propagate_markers_and_groups(&mut solution, &root_edges)?;

    info!(
        "resolved {} packages for {}",
        solution.packages.len(),
        manifest.name.as_given()
    );
    Ok(solution)
}
