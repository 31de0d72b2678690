use crate::prelude::*;

use super::environment::Snapshot;
use crate::resolve::{ResolvedPackage, Solution};

/// Which distribution formats the executor may use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BinaryPolicy {
    #[default]
    Either,
    /// build everything from source (optionally only for named packages)
    NoBinary(Option<HashSet<PackageName>>),
    /// never build from source
    OnlyBinary,
}

impl BinaryPolicy {
    pub fn wheels_allowed(&self, name: &PackageName) -> bool {
        match self {
            BinaryPolicy::Either | BinaryPolicy::OnlyBinary => true,
            BinaryPolicy::NoBinary(None) => false,
            BinaryPolicy::NoBinary(Some(names)) => !names.contains(name),
        }
    }

    pub fn sdists_allowed(&self) -> bool {
        !matches!(self, BinaryPolicy::OnlyBinary)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// dependency groups to materialize; empty means just "main"
    pub groups: Vec<String>,
    /// project extras to activate
    pub extras: HashSet<Extra>,
    /// remove installed packages the plan doesn't cover
    pub sync: bool,
    /// treat equal-version installs as suspect and reinstall when their
    /// RECORD is missing
    pub verify_installed: bool,
    /// don't install the project itself
    pub no_root: bool,
    /// names sync must never remove (the project itself, typically)
    pub keep_installed: Vec<PackageName>,
    /// skip path (directory) dependencies
    pub no_directory: bool,
    pub binary_policy: BinaryPolicy,
    pub compile: bool,
}

impl PlanOptions {
    pub fn requested_groups(&self) -> Vec<String> {
        if self.groups.is_empty() {
            vec![crate::manifest::MAIN_GROUP.to_string()]
        } else {
            self.groups.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationKind {
    Install,
    Update { from: Version },
    Remove { version: Version },
    Skip,
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OperationKind,
    pub name: PackageName,
    /// the target package; None only for sync-removals of untracked names
    pub package: Option<ResolvedPackage>,
    /// indices of operations that must complete before this one starts
    pub depends_on: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub operations: Vec<Operation>,
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        self.operations
            .iter()
            .all(|op| matches!(op.kind, OperationKind::Skip))
    }

    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let mut installs = 0;
        let mut updates = 0;
        let mut removes = 0;
        let mut skips = 0;
        for op in &self.operations {
            match op.kind {
                OperationKind::Install => installs += 1,
                OperationKind::Update { .. } => updates += 1,
                OperationKind::Remove { .. } => removes += 1,
                OperationKind::Skip => skips += 1,
            }
        }
        (installs, updates, removes, skips)
    }
}

/// Diff the locked solution against what's installed and produce an ordered
/// operation list: removes first (reverse dependency order), then
/// installs/updates/skips in dependency-first order, cyclic packages
/// deferred into a final batch.
pub fn plan(
    solution: &Solution,
    snapshot: &Snapshot,
    env_markers: &HashMap<String, String>,
    options: &PlanOptions,
) -> Result<Plan> {
    let requested_groups: HashSet<String> = options.requested_groups().into_iter().collect();

    // 1. which locked packages apply to this environment?
    let mut applicable: Vec<&ResolvedPackage> = Vec::new();
    for package in &solution.packages {
        if !package.groups.iter().any(|g| requested_groups.contains(g)) {
            continue;
        }
        if let Some(marker) = &package.marker {
            if !marker.eval_with_extras(env_markers, &options.extras)? {
                trace!("{}: marker filters it out here", package.id.name.as_given());
                continue;
            }
        }
        if options.no_directory
            && matches!(package.id.source, crate::index::Source::Path { .. })
        {
            continue;
        }
        applicable.push(package);
    }

    // 2. topological order over the applicable subgraph, as an arena of
    // integer ids
    let index_of: HashMap<&PackageName, usize> = applicable
        .iter()
        .enumerate()
        .map(|(i, p)| (&p.id.name, i))
        .collect();
    let n = applicable.len();
    let mut deps_of: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, package) in applicable.iter().enumerate() {
        for dep in &package.dependencies {
            if let Some(&j) = index_of.get(&dep.name) {
                if i != j && !deps_of[i].contains(&j) {
                    deps_of[i].push(j);
                }
            }
        }
        deps_of[i].sort_unstable();
    }

    let order = topo_order(&applicable, &deps_of);

    // 3. classify and emit. Removes go first: they only free up names.
    let mut operations = Vec::new();

    let planned: HashSet<&PackageName> = applicable.iter().map(|p| &p.id.name).collect();
    if options.sync {
        // reverse name order approximates reverse dependency order well
        // enough for packages we know nothing else about
        for (name, dist) in snapshot.installed.iter().rev() {
            if !planned.contains(name) && !options.keep_installed.contains(name) {
                operations.push(Operation {
                    kind: OperationKind::Remove {
                        version: dist.version.clone(),
                    },
                    name: name.clone(),
                    package: None,
                    depends_on: Vec::new(),
                });
            }
        }
    }

    let offset = operations.len();
    // arena id -> operation index, and position within the order (so cyclic
    // batch members don't end up waiting on each other)
    let mut op_index: Vec<usize> = vec![0; n];
    let mut position_of: Vec<usize> = vec![0; n];
    for (position, &id) in order.iter().enumerate() {
        op_index[id] = offset + position;
        position_of[id] = position;
    }

    for &id in &order {
        let package = applicable[id];
        let kind = match snapshot.get(&package.id.name) {
            None => OperationKind::Install,
            Some(installed) => {
                if installed.version == package.id.version {
                    if options.verify_installed
                        && !installed.dist_info.join("RECORD").exists()
                    {
                        OperationKind::Update {
                            from: installed.version.clone(),
                        }
                    } else {
                        OperationKind::Skip
                    }
                } else {
                    OperationKind::Update {
                        from: installed.version.clone(),
                    }
                }
            }
        };
        let depends_on = deps_of[id]
            .iter()
            // within a cyclic batch any order is acceptable, so an edge to a
            // later (cyclic) member is dropped rather than deadlocked on
            .filter(|&&dep| position_of[dep] < position_of[id])
            .map(|&dep| op_index[dep])
            .collect();
        operations.push(Operation {
            kind,
            name: package.id.name.clone(),
            package: Some(package.clone()),
            depends_on,
        });
    }

    Ok(Plan { operations })
}

/// Kahn's algorithm with a deterministic worklist; whatever remains is
/// cyclic and gets appended as one final batch in name order, after
/// everything acyclic.
fn topo_order(packages: &[&ResolvedPackage], deps_of: &[Vec<usize>]) -> Vec<usize> {
    let n = packages.len();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut pending: Vec<usize> = deps_of.iter().map(|deps| deps.len()).collect();
    for (i, deps) in deps_of.iter().enumerate() {
        for &j in deps {
            dependents[j].push(i);
        }
    }

    // BTreeMap worklist keyed by name keeps the order independent of hash
    // iteration order
    let mut ready: BTreeMap<&PackageName, usize> = packages
        .iter()
        .enumerate()
        .filter(|(i, _)| pending[*i] == 0)
        .map(|(i, p)| (&p.id.name, i))
        .collect();

    let mut order = Vec::with_capacity(n);
    let mut done = vec![false; n];
    while let Some((&name, &id)) = ready.iter().next() {
        ready.remove(&name);
        done[id] = true;
        order.push(id);
        for &dependent in &dependents[id] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(&packages[dependent].id.name, dependent);
            }
        }
    }

    if order.len() < n {
        // dependency cycle: everything left goes in one batch, name-ordered
        let mut cyclic: Vec<usize> = (0..n).filter(|&i| !done[i]).collect();
        cyclic.sort_by_key(|&i| &packages[i].id.name);
        order.extend(cyclic);
    }
    order
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::index::{PackageId, Source};
    use crate::install::environment::InstalledDistribution;

    fn package(name: &str, version: &str, deps: &[&str]) -> ResolvedPackage {
        ResolvedPackage {
            id: PackageId {
                name: name.parse().unwrap(),
                version: version.parse().unwrap(),
                source: Source::Index {
                    name: "pypi".into(),
                    url: "https://pypi.org/simple/".parse().unwrap(),
                },
            },
            dependencies: deps.iter().map(|d| d.parse().unwrap()).collect(),
            provided_extras: vec![],
            active_extras: vec![],
            requires_python: Specifiers::any(),
            files: vec![],
            develop: false,
            marker: None,
            groups: vec!["main".into()],
        }
    }

    fn installed(name: &str, version: &str) -> InstalledDistribution {
        InstalledDistribution {
            name: name.parse().unwrap(),
            version: version.parse().unwrap(),
            dist_info: format!("/site/{}-{}.dist-info", name, version).into(),
        }
    }

    fn linux_markers() -> HashMap<String, String> {
        [
            ("sys_platform", "linux"),
            ("python_version", "3.11"),
            ("python_full_version", "3.11.2"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn win_markers() -> HashMap<String, String> {
        let mut m = linux_markers();
        m.insert("sys_platform".into(), "win32".into());
        m
    }

    #[test]
    fn test_dependency_first_ordering() {
        let solution = Solution {
            packages: vec![
                package("requests", "2.32.0", &["urllib3", "idna"]),
                package("urllib3", "2.0.0", &[]),
                package("idna", "3.4", &[]),
            ],
        };
        let plan = plan(
            &solution,
            &Snapshot::default(),
            &linux_markers(),
            &PlanOptions::default(),
        )
        .unwrap();

        let names: Vec<&str> = plan
            .operations
            .iter()
            .map(|op| op.name.canonical())
            .collect();
        assert_eq!(names, vec!["idna", "urllib3", "requests"]);
        // requests depends on both earlier operations
        let requests = &plan.operations[2];
        assert_eq!(requests.depends_on.len(), 2);
        assert!(matches!(requests.kind, OperationKind::Install));
    }

    #[test]
    fn test_classification_against_snapshot() {
        let solution = Solution {
            packages: vec![
                package("requests", "2.32.0", &[]),
                package("idna", "3.4", &[]),
                package("attrs", "22.2.0", &[]),
            ],
        };
        let mut snapshot = Snapshot::default();
        snapshot.record(installed("requests", "2.31.0"));
        snapshot.record(installed("idna", "3.4"));
        snapshot.record(installed("left-over", "1.0"));

        let plan_no_sync = plan(
            &solution,
            &snapshot,
            &linux_markers(),
            &PlanOptions::default(),
        )
        .unwrap();
        let find = |name: &str| {
            plan_no_sync
                .operations
                .iter()
                .find(|op| op.name.canonical() == name)
        };
        assert!(matches!(
            find("requests").unwrap().kind,
            OperationKind::Update { ref from } if from.to_string() == "2.31.0"
        ));
        assert!(matches!(find("idna").unwrap().kind, OperationKind::Skip));
        assert!(matches!(find("attrs").unwrap().kind, OperationKind::Install));
        // untracked package retained without sync
        assert!(find("left-over").is_none());

        let plan_sync = plan(
            &solution,
            &snapshot,
            &linux_markers(),
            &PlanOptions {
                sync: true,
                ..Default::default()
            },
        )
        .unwrap();
        let first = &plan_sync.operations[0];
        assert_eq!(first.name.canonical(), "left-over");
        assert!(matches!(first.kind, OperationKind::Remove { .. }));
    }

    #[test]
    fn test_monotonicity_synced_environment_is_all_skips() {
        let solution = Solution {
            packages: vec![
                package("requests", "2.32.0", &["idna"]),
                package("idna", "3.4", &[]),
            ],
        };
        let mut snapshot = Snapshot::default();
        snapshot.record(installed("requests", "2.32.0"));
        snapshot.record(installed("idna", "3.4"));

        let plan = plan(
            &solution,
            &snapshot,
            &linux_markers(),
            &PlanOptions {
                sync: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(plan.is_noop());
        let (installs, updates, removes, skips) = plan.counts();
        assert_eq!((installs, updates, removes, skips), (0, 0, 0, 2));
    }

    #[test]
    fn test_marker_filtering_per_platform() {
        let mut win_only = package("colorama", "0.4.6", &[]);
        win_only.marker = Some(
            crate::vocab::parse_marker(r#"sys_platform == "win32""#).unwrap(),
        );
        let solution = Solution {
            packages: vec![win_only, package("click", "8.1.3", &[])],
        };

        let on_linux = plan(
            &solution,
            &Snapshot::default(),
            &linux_markers(),
            &PlanOptions::default(),
        )
        .unwrap();
        assert!(on_linux.operations.iter().all(|op| op.name.canonical() != "colorama"));

        let on_windows = plan(
            &solution,
            &Snapshot::default(),
            &win_markers(),
            &PlanOptions::default(),
        )
        .unwrap();
        assert!(on_windows
            .operations
            .iter()
            .any(|op| op.name.canonical() == "colorama"));
    }

    #[test]
    fn test_group_and_extra_filtering() {
        let mut dev_only = package("pytest", "7.2.0", &[]);
        dev_only.groups = vec!["dev".into()];
        let mut extra_only = package("pyopenssl", "23.0.0", &[]);
        extra_only.marker =
            Some(crate::vocab::parse_marker(r#"extra == "tls""#).unwrap());
        let solution = Solution {
            packages: vec![dev_only, extra_only, package("requests", "2.32.0", &[])],
        };

        let default_plan = plan(
            &solution,
            &Snapshot::default(),
            &linux_markers(),
            &PlanOptions::default(),
        )
        .unwrap();
        let names: Vec<&str> = default_plan
            .operations
            .iter()
            .map(|op| op.name.canonical())
            .collect();
        assert_eq!(names, vec!["requests"]);

        let full_plan = plan(
            &solution,
            &Snapshot::default(),
            &linux_markers(),
            &PlanOptions {
                groups: vec!["main".into(), "dev".into()],
                extras: ["tls".parse().unwrap()].into_iter().collect(),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(full_plan.operations.len(), 3);
    }

    #[test]
    fn test_cycle_becomes_trailing_batch() {
        let solution = Solution {
            packages: vec![
                package("a", "1.0", &["b"]),
                package("b", "1.0", &["a"]),
                package("base", "1.0", &[]),
            ],
        };
        let plan = plan(
            &solution,
            &Snapshot::default(),
            &linux_markers(),
            &PlanOptions::default(),
        )
        .unwrap();
        let names: Vec<&str> = plan
            .operations
            .iter()
            .map(|op| op.name.canonical())
            .collect();
        assert_eq!(names, vec!["base", "a", "b"]);
    }
}
