use crate::prelude::*;

use crate::index::{SourceDecl, SourcePriority};

pub const MAIN_GROUP: &str = "main";

/// A dependency that doesn't come from an index: a filesystem path (source
/// tree or distribution file) or a VCS checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalKind {
    Path { path: String },
    Vcs { url: Url, reference: String },
}

/// A project dependency as declared in the manifest: a PEP 508 requirement,
/// optionally pinned to a named source or a local path / VCS location,
/// optionally installed in develop (editable) mode. Serialized either as a
/// bare string or as a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawManifestRequirement", into = "RawManifestRequirement")]
pub struct ManifestRequirement {
    pub requirement: Requirement,
    pub source: Option<String>,
    pub local: Option<LocalKind>,
    pub develop: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawManifestRequirement {
    Bare(String),
    Table {
        requirement: String,
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        git: Option<Url>,
        #[serde(default)]
        rev: Option<String>,
        #[serde(default)]
        develop: bool,
    },
}

impl TryFrom<RawManifestRequirement> for ManifestRequirement {
    type Error = eyre::Report;

    fn try_from(raw: RawManifestRequirement) -> Result<Self> {
        // 'extra' markers don't mean anything on project-level requirements
        let (req_str, source, path, git, rev, develop) = match raw {
            RawManifestRequirement::Bare(s) => (s, None, None, None, None, false),
            RawManifestRequirement::Table {
                requirement,
                source,
                path,
                git,
                rev,
                develop,
            } => (requirement, source, path, git, rev, develop),
        };
        let local = match (path, git) {
            (Some(path), None) => Some(LocalKind::Path { path }),
            (None, Some(url)) => Some(LocalKind::Vcs {
                url,
                reference: rev.unwrap_or_else(|| "HEAD".into()),
            }),
            (None, None) => None,
            (Some(_), Some(_)) => {
                return Err(SprigError::ManifestInvalid(format!(
                    "dependency {:?} declares both path and git",
                    req_str
                ))
                .into())
            }
        };
        if source.is_some() && local.is_some() {
            return Err(SprigError::ManifestInvalid(format!(
                "dependency {:?} declares both a source and a local location",
                req_str
            ))
            .into());
        }
        Ok(ManifestRequirement {
            requirement: Requirement::parse(&req_str, ParseExtra::NotAllowed)?,
            source,
            local,
            develop,
        })
    }
}

impl From<ManifestRequirement> for RawManifestRequirement {
    fn from(value: ManifestRequirement) -> Self {
        let (path, git, rev) = match value.local {
            Some(LocalKind::Path { path }) => (Some(path), None, None),
            Some(LocalKind::Vcs { url, reference }) => (None, Some(url), Some(reference)),
            None => (None, None, None),
        };
        if value.source.is_none() && path.is_none() && git.is_none() && !value.develop {
            RawManifestRequirement::Bare(value.requirement.to_string())
        } else {
            RawManifestRequirement::Table {
                requirement: value.requirement.to_string(),
                source: value.source,
                path,
                git,
                rev,
                develop: value.develop,
            }
        }
    }
}

/// A named bag of project dependencies, independently installable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DependencyGroup {
    /// optional groups are skipped unless asked for by name
    pub optional: bool,
    /// other groups whose dependencies this group pulls in
    pub include: Vec<String>,
    pub dependencies: Vec<ManifestRequirement>,
}

/// `[build-system]`, PEP 518 style.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BuildSystem {
    pub requires: Vec<String>,
    pub build_backend: String,
}

impl Default for BuildSystem {
    fn default() -> Self {
        BuildSystem {
            requires: vec!["setuptools".into(), "wheel".into()],
            build_backend: "setuptools.build_meta:__legacy__".into(),
        }
    }
}

/// The project manifest, as handed to us by the frontend. Read-only: the
/// core never writes it back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Manifest {
    pub name: PackageName,
    pub version: Version,
    pub requires_python: Specifiers,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub readme: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<ManifestRequirement>,
    #[serde(default)]
    pub optional_dependencies: BTreeMap<String, Vec<ManifestRequirement>>,
    #[serde(default)]
    pub groups: BTreeMap<String, DependencyGroup>,
    #[serde(default)]
    pub sources: Vec<SourceDecl>,
    #[serde(default)]
    pub build_system: BuildSystem,
}

impl Manifest {
    pub fn parse(text: &str) -> Result<Manifest> {
        let manifest: Manifest = toml_edit::de::from_str(text)
            .map_err(|e| SprigError::ManifestInvalid(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        let defaults: Vec<&SourceDecl> = self
            .sources
            .iter()
            .filter(|s| s.priority == SourcePriority::Default)
            .collect();
        if defaults.len() > 1 {
            return Err(SprigError::ManifestInvalid(format!(
                "multiple default sources declared: {} and {}",
                defaults[0].name, defaults[1].name
            ))
            .into());
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(&source.name) {
                return Err(SprigError::ManifestInvalid(format!(
                    "source {:?} declared twice",
                    source.name
                ))
                .into());
            }
        }
        for group in self.groups.keys() {
            if group == MAIN_GROUP {
                return Err(SprigError::ManifestInvalid(
                    "the 'main' group is implicit and can't be redeclared".into(),
                )
                .into());
            }
        }
        for (name, group) in &self.groups {
            for included in &group.include {
                if included != MAIN_GROUP && !self.groups.contains_key(included) {
                    return Err(SprigError::ManifestInvalid(format!(
                        "group {:?} includes unknown group {:?}",
                        name, included
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    pub fn supported_pythons(&self) -> Result<VersionSpec> {
        self.requires_python.to_spec()
    }

    /// Every group name, the implicit main group included.
    pub fn group_names(&self) -> Vec<String> {
        let mut names = vec![MAIN_GROUP.to_string()];
        names.extend(self.groups.keys().cloned());
        names
    }

    /// The requirements of one group, with `include`d groups flattened in.
    pub fn group_requirements(&self, group: &str) -> Result<Vec<&ManifestRequirement>> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        self.collect_group(group, &mut out, &mut visited)?;
        Ok(out)
    }

    fn collect_group<'a>(
        &'a self,
        group: &str,
        out: &mut Vec<&'a ManifestRequirement>,
        visited: &mut HashSet<String>,
    ) -> Result<()> {
        if !visited.insert(group.to_string()) {
            return Ok(());
        }
        if group == MAIN_GROUP {
            out.extend(self.dependencies.iter());
            return Ok(());
        }
        let decl = self
            .groups
            .get(group)
            .ok_or_else(|| eyre!("no dependency group named {:?}", group))?;
        for included in &decl.include {
            self.collect_group(included, out, visited)?;
        }
        out.extend(decl.dependencies.iter());
        Ok(())
    }

    /// The canonical serialization of everything that constrains resolution.
    /// The lock's content hash is the sha256 of this; changing a
    /// non-defining field (description, readme) must not move it.
    pub fn defining_fields(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Defining<'a> {
            requires_python: String,
            dependencies: Vec<String>,
            optional_dependencies: BTreeMap<&'a String, Vec<String>>,
            groups: BTreeMap<&'a String, DefiningGroup>,
            sources: Vec<DefiningSource>,
        }
        #[derive(Serialize)]
        struct DefiningGroup {
            optional: bool,
            include: Vec<String>,
            dependencies: Vec<String>,
        }
        #[derive(Serialize)]
        struct DefiningSource {
            name: String,
            url: String,
            priority: String,
        }

        fn render_req(req: &ManifestRequirement) -> String {
            let mut rendered = req.requirement.to_string();
            if let Some(source) = &req.source {
                rendered.push_str(&format!(" !source={}", source));
            }
            match &req.local {
                Some(LocalKind::Path { path }) => {
                    rendered.push_str(&format!(" !path={}", path));
                }
                Some(LocalKind::Vcs { url, reference }) => {
                    rendered.push_str(&format!(" !git={}@{}", url, reference));
                }
                None => (),
            }
            if req.develop {
                rendered.push_str(" !develop");
            }
            rendered
        }

        let defining = Defining {
            requires_python: self.requires_python.to_string(),
            dependencies: self.dependencies.iter().map(render_req).collect(),
            optional_dependencies: self
                .optional_dependencies
                .iter()
                .map(|(extra, reqs)| (extra, reqs.iter().map(render_req).collect()))
                .collect(),
            groups: self
                .groups
                .iter()
                .map(|(name, group)| {
                    (
                        name,
                        DefiningGroup {
                            optional: group.optional,
                            include: group.include.clone(),
                            dependencies: group.dependencies.iter().map(render_req).collect(),
                        },
                    )
                })
                .collect(),
            sources: self
                .sources
                .iter()
                .map(|s| DefiningSource {
                    name: s.name.clone(),
                    url: s.url.to_string(),
                    priority: s.priority.to_string(),
                })
                .collect(),
        };
        Ok(serde_json::to_string(&defining)?)
    }

    pub fn content_hash(&self) -> Result<ArtifactHash> {
        Ok(ArtifactHash::sha256_of(self.defining_fields()?.as_bytes()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    fn manifest() -> Manifest {
        Manifest::parse(indoc! {r#"
            name = "myapp"
            version = "0.1.0"
            requires-python = ">= 3.9"
            description = "demo project"
            dependencies = [
                "requests >= 2.28",
                { requirement = "mylib", source = "internal", develop = true },
            ]

            [optional-dependencies]
            tls = ["pyopenssl >= 23.0"]

            [groups.dev]
            optional = true
            dependencies = ["pytest >= 7"]

            [groups.ci]
            include = ["dev"]
            dependencies = ["coverage"]

            [[sources]]
            name = "internal"
            url = "https://pypi.internal.example.com/simple/"
            priority = "supplemental"
        "#})
        .unwrap()
    }

    #[test]
    fn test_parse_round() {
        let m = manifest();
        assert_eq!(m.name.canonical(), "myapp");
        assert_eq!(m.dependencies.len(), 2);
        assert!(m.dependencies[1].develop);
        assert_eq!(m.dependencies[1].source.as_deref(), Some("internal"));
        assert_eq!(m.groups["dev"].dependencies.len(), 1);
        assert_eq!(m.sources[0].priority, SourcePriority::Supplemental);
    }

    #[test]
    fn test_group_flattening() {
        let m = manifest();
        let ci: Vec<String> = m
            .group_requirements("ci")
            .unwrap()
            .iter()
            .map(|r| r.requirement.name.canonical().to_string())
            .collect();
        assert_eq!(ci, vec!["pytest", "coverage"]);
        let main: Vec<String> = m
            .group_requirements(MAIN_GROUP)
            .unwrap()
            .iter()
            .map(|r| r.requirement.name.canonical().to_string())
            .collect();
        assert_eq!(main, vec!["requests", "mylib"]);
    }

    #[test]
    fn test_content_hash_ignores_non_defining_fields() {
        let base = manifest();
        let mut relabelled = base.clone();
        relabelled.description = Some("totally different".into());
        relabelled.readme = Some("README.md".into());
        assert_eq!(
            base.content_hash().unwrap(),
            relabelled.content_hash().unwrap()
        );
    }

    #[test]
    fn test_content_hash_tracks_defining_fields() {
        let base = manifest();

        let mut new_dep = base.clone();
        new_dep.dependencies.push(ManifestRequirement {
            requirement: "attrs".parse().unwrap(),
            source: None,
            local: None,
            develop: false,
        });
        assert_ne!(base.content_hash().unwrap(), new_dep.content_hash().unwrap());

        let mut new_python = base.clone();
        new_python.requires_python = ">= 3.10".try_into().unwrap();
        assert_ne!(
            base.content_hash().unwrap(),
            new_python.content_hash().unwrap()
        );

        let mut new_group = base.clone();
        new_group.groups.get_mut("dev").unwrap().optional = false;
        assert_ne!(
            base.content_hash().unwrap(),
            new_group.content_hash().unwrap()
        );
    }

    #[test]
    fn test_validation_rejects_duplicate_defaults() {
        let got = Manifest::parse(indoc! {r#"
            name = "myapp"
            version = "0.1.0"
            requires-python = ">= 3.9"

            [[sources]]
            name = "a"
            url = "https://a.example.com/simple/"
            priority = "default"

            [[sources]]
            name = "b"
            url = "https://b.example.com/simple/"
            priority = "default"
        "#});
        assert!(got.is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_include() {
        let got = Manifest::parse(indoc! {r#"
            name = "myapp"
            version = "0.1.0"
            requires-python = ">= 3.9"

            [groups.ci]
            include = ["nonexistent"]
        "#});
        assert!(got.is_err());
    }
}
