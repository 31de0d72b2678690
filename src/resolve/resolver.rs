use crate::prelude::*;

use elsa::FrozenMap;
use pubgrub::range::Range;
use pubgrub::solver::{Dependencies, DependencyConstraints};
use std::borrow::Borrow;
use std::cell::RefCell;

use crate::db::{IndexedArtifact, PackageDB, SdistBuilder};
use crate::index::{PackageId, Source};
use crate::manifest::ManifestRequirement;

/// Which packages may resolve to pre-release versions. (Versions whose
/// releases are *only* pre-releases, and requirements whose own bounds are
/// pre-releases, opt themselves in.)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "AllowPreSerdeHelper", into = "AllowPreSerdeHelper")]
pub enum AllowPre {
    Some(HashSet<PackageName>),
    All,
}

impl AllowPre {
    pub fn allows(&self, package: &PackageName) -> bool {
        match self {
            AllowPre::Some(packages) => packages.contains(package),
            AllowPre::All => true,
        }
    }
}

impl Default for AllowPre {
    fn default() -> Self {
        AllowPre::Some(HashSet::new())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum AllowPreSerdeHelper {
    Some(HashSet<PackageName>),
    Other(String),
}

impl TryFrom<AllowPreSerdeHelper> for AllowPre {
    type Error = eyre::Report;

    fn try_from(value: AllowPreSerdeHelper) -> Result<Self> {
        match value {
            AllowPreSerdeHelper::Some(packages) => Ok(AllowPre::Some(packages)),
            AllowPreSerdeHelper::Other(value) if value == ":all:" => Ok(AllowPre::All),
            AllowPreSerdeHelper::Other(_) => {
                bail!("expected a list of packages or the magic string ':all:'")
            }
        }
    }
}

impl From<AllowPre> for AllowPreSerdeHelper {
    fn from(value: AllowPre) -> Self {
        match value {
            AllowPre::Some(packages) => AllowPreSerdeHelper::Some(packages),
            AllowPre::All => AllowPreSerdeHelper::Other(":all:".into()),
        }
    }
}

/// Soft preferences taken from an existing lock: keep these versions where
/// possible, and keep trusting the hashes that lock pinned (which keeps
/// yanked-but-locked artifacts eligible).
#[derive(Debug, Clone, Default)]
pub struct VersionHints {
    map: HashMap<PackageName, (Version, HashSet<ArtifactHash>)>,
}

impl VersionHints {
    pub fn pin(&mut self, name: PackageName, version: Version, hashes: HashSet<ArtifactHash>) {
        self.map.insert(name, (version, hashes));
    }

    /// Forget the pin for one package, letting it float on re-resolve.
    pub fn drop(&mut self, name: &PackageName) {
        self.map.remove(name);
    }

    fn version(&self, name: &PackageName) -> Option<&Version> {
        self.map.get(name).map(|(v, _)| v)
    }

    /// Is this artifact hash one the previous lock recorded for the
    /// package? Yanked files stay eligible exactly when this says yes.
    pub fn trusts_hash(&self, name: &PackageName, hash: Option<&ArtifactHash>) -> bool {
        match (self.map.get(name), hash) {
            (Some((_, hashes)), Some(hash)) => hashes.contains(hash),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub allow_pre: AllowPre,
    /// pick the lowest compatible version instead of the highest (used by
    /// callers probing how stale their lower bounds are)
    pub prefer_oldest: bool,
    pub hints: VersionHints,
}

// The unit pubgrub resolves over. Extras are the classic trick borrowed from
// pip: "foo[bar]" becomes its own package whose dependencies are bar's
// requirements plus foo==<same version>, which keeps the unique-version
// guarantee intact while letting extras pull in their own subtrees.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum SolverPkg {
    Root,
    Package(PackageName, Option<Extra>),
}

pub static ROOT_VERSION: Lazy<Version> = Lazy::new(|| "0".try_into().unwrap());

impl Display for SolverPkg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolverPkg::Root => write!(f, "<root>"),
            SolverPkg::Package(name, None) => write!(f, "{}", name.as_given()),
            SolverPkg::Package(name, Some(extra)) => {
                write!(f, "{}[{}]", name.as_given(), extra.as_given())
            }
        }
    }
}

pub struct ResolverState<'a> {
    pub db: &'a PackageDB,
    /// the project's requirements, flattened across every group
    pub root_requirements: &'a [(String, ManifestRequirement)],
    /// full-version range the project supports
    pub python_range: VersionSpec,
    pub universe: MarkerUniverse,
    pub options: &'a ResolveOptions,
    pub builder: Option<&'a SdistBuilder>,

    /// path/url/vcs requirements pre-resolved to their single candidate
    pub local_pins: HashMap<PackageName, (PackageId, CoreMetadata)>,
    /// names bound to a named source by some requirement
    pub source_bound: HashMap<PackageName, String>,

    // memo tables: resolution must see one consistent world per run
    pub(crate) metadata: FrozenMap<(PackageName, Version), Box<CoreMetadata>>,
    versions: FrozenMap<PackageName, Vec<Version>>,
    /// packages whose requirement bounds opt them into pre-releases
    pre_ok: RefCell<HashSet<PackageName>>,
}

fn get_or_fill<'a, K, V, F>(map: &'a FrozenMap<K, V>, key: &K, fill: F) -> Result<&'a V::Target>
where
    K: Eq + std::hash::Hash + Clone,
    F: FnOnce() -> Result<V>,
    V: stable_deref_trait::StableDeref,
{
    if let Some(v) = map.get(key) {
        Ok(v)
    } else {
        Ok(map.insert(key.to_owned(), fill()?))
    }
}

/// Does this requires-python cover the *whole* python range the project
/// supports? Partial overlap isn't good enough: the lock must be valid for
/// every environment the project declares.
fn covers_python_range(requires_python: &Specifiers, python_range: &VersionSpec) -> bool {
    match requires_python.to_spec() {
        Ok(spec) => python_range.intersect(&spec.complement()).is_empty(),
        Err(_) => {
            // unparseable requires-python strings exist in old metadata;
            // pretending they're unconstrained matches what installers do
            true
        }
    }
}

impl<'a> ResolverState<'a> {
    pub fn new(
        db: &'a PackageDB,
        root_requirements: &'a [(String, ManifestRequirement)],
        python_range: VersionSpec,
        options: &'a ResolveOptions,
        builder: Option<&'a SdistBuilder>,
    ) -> Result<ResolverState<'a>> {
        let mut local_pins = HashMap::new();
        let mut source_bound = HashMap::new();
        for (_, req) in root_requirements {
            if req.local.is_some() || req.requirement.url.is_some() {
                let (id, metadata) = db.local_candidate(req)?;
                local_pins.insert(req.requirement.name.clone(), (id, metadata));
            }
            if let Some(source) = &req.source {
                source_bound.insert(req.requirement.name.clone(), source.clone());
            }
        }
        Ok(ResolverState {
            db,
            root_requirements,
            universe: MarkerUniverse::new(python_range.clone()),
            python_range,
            options,
            builder,
            local_pins,
            source_bound,
            metadata: Default::default(),
            versions: Default::default(),
            pre_ok: Default::default(),
        })
    }

    fn requested_source(&self, name: &PackageName) -> Option<&str> {
        self.source_bound.get(name).map(|s| s.as_str())
    }

    pub fn metadata(&self, name: &PackageName, version: &Version) -> Result<&CoreMetadata> {
        let key = (name.clone(), version.clone());
        get_or_fill(&self.metadata, &key, || {
            if let Some((id, metadata)) = self.local_pins.get(name) {
                if &id.version == version {
                    return Ok(Box::new(metadata.clone()));
                }
            }
            let artifacts = self
                .db
                .artifacts_for_version(name, version, self.requested_source(name))?;
            let (_, metadata) = self.db.get_metadata(artifacts, self.builder)?;
            Ok(Box::new(metadata))
        })
    }

    /// Candidate versions in preference order. Yanked-only and
    /// python-range-incompatible versions are dropped here; pre-releases get
    /// filtered later, where the constraint is in hand.
    fn versions(&self, name: &PackageName) -> Result<&[Version]> {
        get_or_fill(&self.versions, name, || {
            if let Some((id, _)) = self.local_pins.get(name) {
                return Ok(vec![id.version.clone()]);
            }
            let artifacts = self
                .db
                .available_artifacts(name, self.requested_source(name))?;
            let mut versions = Vec::new();
            for (version, artifact_infos) in artifacts.iter() {
                if let Some(ai) = self.usable_artifact(name, artifact_infos) {
                    trace!("{} {} is viable (via {})", name.as_given(), version, ai.info.name);
                    versions.push(version.clone());
                }
            }
            self.sort_by_preference(name, &mut versions);
            Ok(versions)
        })
    }

    fn usable_artifact<'b>(
        &self,
        name: &PackageName,
        artifacts: &'b [IndexedArtifact],
    ) -> Option<&'b IndexedArtifact> {
        artifacts.iter().find(|ia| {
            if ia.info.yanked.yanked
                && !self.options.hints.trusts_hash(name, ia.info.hash.as_ref())
            {
                return false;
            }
            match &ia.info.requires_python {
                Some(rp) => match Specifiers::try_from(rp.as_str()) {
                    Ok(specs) => covers_python_range(&specs, &self.python_range),
                    Err(_) => true,
                },
                None => true,
            }
        })
    }

    fn sort_by_preference(&self, name: &PackageName, versions: &mut [Version]) {
        if self.options.prefer_oldest {
            versions.sort_unstable();
            return;
        }
        match self.options.hints.version(name) {
            // With a hinted version, prefer: the hint itself, then versions
            // above it from smallest to largest, then versions below it from
            // largest to smallest. Minimal drift from the previous lock.
            Some(hint) => versions.sort_unstable_by_key(|v| {
                if v == hint {
                    (0u8, None, None)
                } else if v > hint {
                    (1u8, Some(v.clone()), None)
                } else {
                    (2u8, None, Some(std::cmp::Reverse(v.clone())))
                }
            }),
            None => versions.sort_unstable_by(|a, b| b.cmp(a)),
        }
    }

    fn prereleases_allowed(&self, name: &PackageName, versions: &[Version]) -> bool {
        versions.iter().all(|v| v.is_prerelease())
            || self.options.allow_pre.allows(name)
            || self.pre_ok.borrow().contains(name)
            || self
                .options
                .hints
                .version(name)
                .map(|v| v.is_prerelease())
                .unwrap_or(false)
    }

    fn requirement_to_constraints(
        &self,
        req: &Requirement,
        dc: &mut DependencyConstraints<SolverPkg, Version>,
        active_extra: Option<&Extra>,
    ) -> Result<()> {
        if let Some(marker) = &req.marker {
            match marker.without_extra(active_extra)? {
                Simplified::False => return Ok(()),
                Simplified::True => (),
                Simplified::Expr(residue) => {
                    // live only in *some* supported environment; if there is
                    // none, the edge is dead everywhere we care about
                    if !self.universe.may_hold(&residue) {
                        trace!("dropping {}: marker can never hold", req);
                        return Ok(());
                    }
                }
            }
        }

        let range = if let Some((id, _)) = self.local_pins.get(&req.name) {
            Range::exact(id.version.clone())
        } else {
            let spec = req.version_spec()?;
            if spec.admits_prereleases() {
                self.pre_ok.borrow_mut().insert(req.name.clone());
            }
            spec.to_pubgrub()
        };

        let mut maybe_extras: Vec<Option<Extra>> =
            req.extras.iter().map(|e| Some(e.clone())).collect();
        if maybe_extras.is_empty() {
            maybe_extras.push(None);
        }

        for maybe_extra in maybe_extras {
            let pkg = SolverPkg::Package(req.name.clone(), maybe_extra);
            trace!("edge to {} constrained to {:?}", pkg, range);
            merge_constraint(dc, pkg, range.clone());
        }
        Ok(())
    }
}

/// Two requirements on the same package intersect rather than clobber.
fn merge_constraint(
    dc: &mut DependencyConstraints<SolverPkg, Version>,
    pkg: SolverPkg,
    range: Range<Version>,
) {
    match dc.get_mut(&pkg) {
        Some(existing) => {
            *existing = existing.intersection(&range);
        }
        None => {
            dc.insert(pkg, range);
        }
    }
}

impl<'a> pubgrub::solver::DependencyProvider<SolverPkg, Version> for ResolverState<'a> {
    fn choose_package_version<T, U>(
        &self,
        mut potential_packages: impl Iterator<Item = (T, U)>,
    ) -> std::result::Result<(T, Option<Version>), Box<dyn std::error::Error>>
    where
        T: Borrow<SolverPkg>,
        U: Borrow<Range<Version>>,
    {
        // the solver hands us every undecided unit; any choice is valid, and
        // taking the first keeps the run reproducible
        let (unit, range) = potential_packages.next().unwrap();

        match unit.borrow() {
            SolverPkg::Root => {
                // the root unit exists only to carry the project's own
                // requirements; its version is a fixed placeholder
                Ok((unit, Some(ROOT_VERSION.clone())))
            }
            SolverPkg::Package(name, _) => {
                let versions = self.versions(name)?;
                let allow_pre = self.prereleases_allowed(name, versions);
                let mut python_rejects = 0usize;
                let mut python_reject_range = None;
                for version in versions {
                    if !range.borrow().contains(version) {
                        continue;
                    }
                    if version.is_prerelease() && !allow_pre {
                        trace!(
                            "{} {}: pre-release without an opt-in, passing over",
                            name.as_given(),
                            version
                        );
                        continue;
                    }

                    let metadata = self.metadata(name, version)?;
                    if !covers_python_range(&metadata.requires_python, &self.python_range)
                    {
                        trace!(
                            "{} {}: requires-python {} leaves out part of {}",
                            name.as_given(),
                            version,
                            metadata.requires_python,
                            self.python_range
                        );
                        python_rejects += 1;
                        python_reject_range =
                            Some((version.clone(), metadata.requires_python.clone()));
                        continue;
                    }
                    trace!("picked {} {}", unit.borrow(), version);
                    return Ok((unit, Some(version.clone())));
                }

                // If python compatibility was the *only* thing standing in
                // the way, say so by name instead of a generic conflict.
                if python_rejects > 0 {
                    let (version, requires) = python_reject_range.unwrap();
                    Err(eyre::Report::new(SprigError::PythonRangeDisjoint {
                        name: name.as_given().to_owned(),
                        version,
                        requires: requires.to_string(),
                        supported: self.python_range.to_string(),
                    }))?;
                }

                trace!("{}: nothing admissible in {:?}", unit.borrow(), range.borrow());
                Ok((unit, None))
            }
        }
    }

    fn get_dependencies(
        &self,
        pkg: &SolverPkg,
        version: &Version,
    ) -> std::result::Result<Dependencies<SolverPkg, Version>, Box<dyn std::error::Error>>
    {
        trace!("expanding the edges of {} {}", pkg, version);

        match pkg {
            SolverPkg::Root => {
                let mut dc: DependencyConstraints<SolverPkg, Version> = Default::default();
                for (_, req) in self.root_requirements {
                    self.requirement_to_constraints(&req.requirement, &mut dc, None)?;
                }
                Ok(Dependencies::Known(dc))
            }
            SolverPkg::Package(name, extra) => {
                let metadata = self.metadata(name, version)?;
                let mut dc: DependencyConstraints<SolverPkg, Version> = Default::default();

                for req in &metadata.requires_dist {
                    self.requirement_to_constraints(req, &mut dc, extra.as_ref())?;
                }

                if let Some(extra) = extra {
                    if !metadata.extras.contains(extra) {
                        Err(eyre!(
                            "package {} has no extra [{}]",
                            name.as_given(),
                            extra.as_given()
                        ))?;
                    }
                    // the synthetic extra package rides at exactly the base
                    // package's version
                    merge_constraint(
                        &mut dc,
                        SolverPkg::Package(name.clone(), None),
                        Range::exact(version.clone()),
                    );
                }

                Ok(Dependencies::Known(dc))
            }
        }
    }
}

/// After pubgrub picks versions, fill out the full package records.
pub fn solution_packages(
    state: &ResolverState,
    chosen: impl IntoIterator<Item = (SolverPkg, Version)>,
) -> Result<Vec<super::solution::ResolvedPackage>> {
    use super::solution::ResolvedPackage;

    let mut base: Vec<(PackageName, Version)> = Vec::new();
    let mut active_extras: HashMap<PackageName, Vec<Extra>> = HashMap::new();
    for (pkg, version) in chosen {
        match pkg {
            SolverPkg::Root => (),
            SolverPkg::Package(name, None) => base.push((name, version)),
            SolverPkg::Package(name, Some(extra)) => {
                active_extras.entry(name).or_default().push(extra);
            }
        }
    }

    let mut packages = Vec::with_capacity(base.len());
    for (name, version) in base {
        let metadata = state.metadata(&name, &version)?;
        let (id, files, develop) = match state.local_pins.get(&name) {
            Some((id, _)) => {
                let develop = state
                    .root_requirements
                    .iter()
                    .any(|(_, r)| r.requirement.name == name && r.develop);
                (id.clone(), Vec::new(), develop)
            }
            None => {
                let artifacts = state.db.artifacts_for_version(
                    &name,
                    &version,
                    state.source_bound.get(&name).map(|s| s.as_str()),
                )?;
                let source = artifacts
                    .first()
                    .map(|ia| ia.source.clone())
                    .ok_or_else(|| eyre!("no artifacts recorded for {} {}", name, version))?;
                let files = artifacts
                    .iter()
                    .filter_map(|ia| {
                        ia.info
                            .hash
                            .clone()
                            .map(|hash| (ia.info.name.to_string(), hash))
                    })
                    .collect();
                (
                    PackageId {
                        name: name.clone(),
                        version: version.clone(),
                        source,
                    },
                    files,
                    false,
                )
            }
        };
        packages.push(ResolvedPackage {
            id,
            dependencies: metadata.requires_dist.clone(),
            provided_extras: metadata.extras.iter().cloned().collect(),
            active_extras: active_extras.remove(&name).unwrap_or_default(),
            requires_python: metadata.requires_python.clone(),
            files,
            develop,
            marker: None,
            groups: Vec::new(),
        });
    }
    Ok(packages)
}
