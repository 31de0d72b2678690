use crate::prelude::*;

use crate::index::PackageId;

/// One package in a resolved solution, carrying everything the lock codec
/// needs to write it out and the planner needs to install it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPackage {
    pub id: PackageId,
    /// dependency edges as declared in the package's metadata
    pub dependencies: Vec<Requirement>,
    /// extras this package offers
    pub provided_extras: Vec<Extra>,
    /// extras activated somewhere in this solution
    pub active_extras: Vec<Extra>,
    pub requires_python: Specifiers,
    /// distribution files admissible for this package: (filename, hash)
    pub files: Vec<(String, ArtifactHash)>,
    pub develop: bool,
    /// the marker under which this package is live, None = always
    pub marker: Option<Marker>,
    /// dependency groups that (transitively) pull this package in
    pub groups: Vec<String>,
}

/// A complete, closed, platform-agnostic resolution. Packages are kept in
/// canonical order (name, then source, then version) so everything
/// downstream is deterministic for free.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Solution {
    pub packages: Vec<ResolvedPackage>,
}

impl Solution {
    pub fn canonicalize(&mut self) {
        self.packages.sort_by(|a, b| {
            (&a.id.name, &a.id.source, &a.id.version)
                .cmp(&(&b.id.name, &b.id.source, &b.id.version))
        });
        for package in &mut self.packages {
            package.groups.sort();
            package.groups.dedup();
            package.active_extras.sort();
            package.active_extras.dedup();
            package.provided_extras.sort();
            package.provided_extras.dedup();
            package.files.sort();
        }
    }

    pub fn get(&self, name: &PackageName) -> Option<&ResolvedPackage> {
        self.packages.iter().find(|p| &p.id.name == name)
    }
}

/// A dependency edge for marker/group propagation: who needs whom, under
/// what residual marker.
struct Edge {
    target: usize,
    marker: Option<Marker>,
}

/// Merge a new disjunct into an effective marker. None means
/// unconditionally live, which absorbs everything.
fn or_merge(current: &mut Option<MarkerSet>, incoming: &Option<Marker>) -> bool {
    match (current.as_mut(), incoming) {
        (Some(set), Some(marker)) => set.insert(marker),
        (Some(set), None) => {
            if set.always {
                false
            } else {
                *current = Some(MarkerSet::always());
                true
            }
        }
        (None, _) => false, // package not seen yet; caller initializes
    }
}

/// A union of markers with set semantics, so propagation reaches a fixpoint
/// instead of growing "a or a or a" forever. An empty set means
/// unconditionally live.
#[derive(Clone)]
struct MarkerSet {
    disjuncts: BTreeMap<String, Marker>,
    always: bool,
}

impl MarkerSet {
    fn always() -> MarkerSet {
        MarkerSet {
            disjuncts: BTreeMap::new(),
            always: true,
        }
    }

    fn of(marker: &Option<Marker>) -> MarkerSet {
        match marker {
            None => MarkerSet::always(),
            Some(m) => MarkerSet {
                disjuncts: [(m.to_string(), m.clone())].into_iter().collect(),
                always: false,
            },
        }
    }

    /// returns true if the set changed
    fn insert(&mut self, marker: &Marker) -> bool {
        if self.always {
            return false;
        }
        self.disjuncts
            .insert(marker.to_string(), marker.clone())
            .is_none()
    }

    fn to_marker(&self) -> Option<Marker> {
        if self.always {
            return None;
        }
        // deterministic: disjuncts are ordered by their rendered form
        let mut result: Option<Marker> = None;
        for marker in self.disjuncts.values() {
            result = match result {
                None => Some(marker.clone()),
                Some(acc) => Marker::or(Some(&acc), Some(marker)),
            };
        }
        result
    }
}

/// Compute each package's effective marker and group memberships by
/// propagating from the root requirements along dependency edges. Cycles are
/// fine: the union-merge is monotone, so iteration reaches a fixpoint.
///
/// `roots` are the project's own requirement edges: (target, marker, group,
/// extras requested on the edge).
pub fn propagate_markers_and_groups(
    solution: &mut Solution,
    roots: &[(PackageName, Option<Marker>, String, Vec<Extra>)],
) -> Result<()> {
    let index_of: HashMap<PackageName, usize> = solution
        .packages
        .iter()
        .enumerate()
        .map(|(i, p)| (p.id.name.clone(), i))
        .collect();

    // Expand every package's edges once, with extras projected out. A
    // package's live edges are its plain edges plus, for each of its extras
    // active anywhere in the solution, that extra's edges.
    let mut edges: Vec<Vec<Edge>> = Vec::with_capacity(solution.packages.len());
    for package in &solution.packages {
        let mut out = Vec::new();
        let mut activations: Vec<Option<&Extra>> = vec![None];
        activations.extend(package.active_extras.iter().map(Some));
        for dep in &package.dependencies {
            let Some(&target) = index_of.get(&dep.name) else {
                // pruned: its marker can't hold in any supported environment
                continue;
            };
            for activation in &activations {
                let residual = match &dep.marker {
                    None => {
                        if activation.is_some() {
                            // an unconditional edge doesn't need repeating
                            // per extra activation
                            continue;
                        }
                        None
                    }
                    Some(marker) => match marker.without_extra(*activation)? {
                        Simplified::False => continue,
                        Simplified::True => None,
                        Simplified::Expr(residue) => Some(residue),
                    },
                };
                out.push(Edge {
                    target,
                    marker: residual,
                });
            }
        }
        edges.push(out);
    }

    let n = solution.packages.len();
    let mut markers: Vec<Option<MarkerSet>> = vec![None; n];
    let mut groups: Vec<HashSet<String>> = vec![HashSet::new(); n];

    for (target, marker, group, _extras) in roots {
        let Some(&i) = index_of.get(target) else {
            continue;
        };
        match markers[i].as_mut() {
            None => markers[i] = Some(MarkerSet::of(marker)),
            Some(set) => {
                match marker {
                    None => markers[i] = Some(MarkerSet::always()),
                    Some(m) => {
                        set.insert(m);
                    }
                };
            }
        }
        groups[i].insert(group.clone());
    }

    // fixpoint: markers and groups only grow
    let mut changed = true;
    while changed {
        changed = false;
        for i in 0..n {
            let Some(from_set) = markers[i].clone() else {
                continue;
            };
            let from_marker = from_set.to_marker();
            let from_groups = groups[i].clone();
            for edge in &edges[i] {
                // the edge is live where its parent is live AND its own
                // marker holds
                let combined = Marker::and(from_marker.as_ref(), edge.marker.as_ref());
                match markers[edge.target].as_mut() {
                    None => {
                        markers[edge.target] = Some(MarkerSet::of(&combined));
                        changed = true;
                    }
                    Some(_) => {
                        if or_merge(&mut markers[edge.target], &combined) {
                            changed = true;
                        }
                    }
                }
                for group in &from_groups {
                    if groups[edge.target].insert(group.clone()) {
                        changed = true;
                    }
                }
            }
        }
    }

    for (i, package) in solution.packages.iter_mut().enumerate() {
        package.marker = markers[i].as_ref().and_then(|set| set.to_marker());
        package.groups = groups[i].iter().cloned().collect();
    }
    solution.canonicalize();
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::index::Source;

    fn package(name: &str, deps: &[&str]) -> ResolvedPackage {
        ResolvedPackage {
            id: PackageId {
                name: name.parse().unwrap(),
                version: "1.0".parse().unwrap(),
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
            groups: vec![],
        }
    }

    fn marker_of(s: &str) -> Option<Marker> {
        let req: Requirement = format!("x; {}", s).parse().unwrap();
        req.marker
    }

    #[test]
    fn test_platform_marker_flows_downstream() {
        let mut solution = Solution {
            packages: vec![
                package("colorama", &[]),
                package("click", &[r#"colorama; sys_platform == "win32""#]),
            ],
        };
        let roots = vec![("click".parse().unwrap(), None, "main".to_string(), vec![])];
        propagate_markers_and_groups(&mut solution, &roots).unwrap();

        let click = solution.get(&"click".parse().unwrap()).unwrap();
        assert!(click.marker.is_none());
        assert_eq!(click.groups, vec!["main"]);

        let colorama = solution.get(&"colorama".parse().unwrap()).unwrap();
        assert_eq!(
            colorama.marker.as_ref().unwrap().to_string(),
            r#"sys_platform == "win32""#
        );
        assert_eq!(colorama.groups, vec!["main"]);
    }

    #[test]
    fn test_unconditional_path_absorbs_conditional_one() {
        // b is needed on win32 via a, but unconditionally via the root:
        // the effective marker must be "always"
        let mut solution = Solution {
            packages: vec![
                package("a", &[r#"b; sys_platform == "win32""#]),
                package("b", &[]),
            ],
        };
        let roots = vec![
            ("a".parse().unwrap(), None, "main".to_string(), vec![]),
            ("b".parse().unwrap(), None, "main".to_string(), vec![]),
        ];
        propagate_markers_and_groups(&mut solution, &roots).unwrap();
        assert!(solution.get(&"b".parse().unwrap()).unwrap().marker.is_none());
    }

    #[test]
    fn test_groups_reach_transitive_deps() {
        let mut solution = Solution {
            packages: vec![
                package("pytest", &["pluggy"]),
                package("pluggy", &[]),
                package("requests", &[]),
            ],
        };
        let roots = vec![
            ("requests".parse().unwrap(), None, "main".to_string(), vec![]),
            ("pytest".parse().unwrap(), None, "dev".to_string(), vec![]),
        ];
        propagate_markers_and_groups(&mut solution, &roots).unwrap();
        assert_eq!(
            solution.get(&"pluggy".parse().unwrap()).unwrap().groups,
            vec!["dev"]
        );
        assert_eq!(
            solution.get(&"requests".parse().unwrap()).unwrap().groups,
            vec!["main"]
        );
    }

    #[test]
    fn test_cycle_reaches_fixpoint() {
        let mut solution = Solution {
            packages: vec![package("a", &["b"]), package("b", &["a"])],
        };
        let roots = vec![(
            "a".parse().unwrap(),
            marker_of(r#"sys_platform == "linux""#),
            "main".to_string(),
            vec![],
        )];
        propagate_markers_and_groups(&mut solution, &roots).unwrap();
        for name in ["a", "b"] {
            let p = solution.get(&name.parse().unwrap()).unwrap();
            assert_eq!(
                p.marker.as_ref().unwrap().to_string(),
                r#"sys_platform == "linux""#,
                "{}",
                name
            );
        }
    }

    #[test]
    fn test_extra_edges_counted_only_when_active() {
        let mut with_extra = package("requests", &[r#"pysocks; extra == "socks""#]);
        with_extra.provided_extras = vec!["socks".parse().unwrap()];
        with_extra.active_extras = vec!["socks".parse().unwrap()];
        let mut solution = Solution {
            packages: vec![with_extra, package("pysocks", &[])],
        };
        let roots = vec![(
            "requests".parse().unwrap(),
            None,
            "main".to_string(),
            vec!["socks".parse().unwrap()],
        )];
        propagate_markers_and_groups(&mut solution, &roots).unwrap();
        // the extra edge is live (extra active), with the extra atom
        // projected away
        assert!(solution.get(&"pysocks".parse().unwrap()).unwrap().marker.is_none());

        // same solution but with the extra inactive: the edge is dead, so
        // pysocks picks up no marker and no groups
        let mut without = package("requests", &[r#"pysocks; extra == "socks""#]);
        without.provided_extras = vec!["socks".parse().unwrap()];
        let mut solution = Solution {
            packages: vec![without, package("pysocks", &[])],
        };
        let roots = vec![("requests".parse().unwrap(), None, "main".to_string(), vec![])];
        propagate_markers_and_groups(&mut solution, &roots).unwrap();
        assert!(solution
            .get(&"pysocks".parse().unwrap())
            .unwrap()
            .groups
            .is_empty());
    }
}
