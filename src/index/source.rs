use crate::prelude::*;

/// How much say a source gets during candidate enumeration.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum SourcePriority {
    /// searched exclusively; at most one per project
    Default,
    /// searched first
    Primary,
    /// searched only when no primary has any candidate for the name
    Supplemental,
    /// searched only when a requirement names this source
    Explicit,
}

impl Display for SourcePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                SourcePriority::Default => "default",
                SourcePriority::Primary => "primary",
                SourcePriority::Supplemental => "supplemental",
                SourcePriority::Explicit => "explicit",
            }
        )
    }
}

/// Which wire protocol an index speaks.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum IndexApi {
    /// PEP 503 HTML, one page per project under the base URL
    Simple,
    /// PEP 691 JSON, same layout
    Json,
    /// a single flat HTML page of links, parsed like a PEP 503 page
    Page,
}

impl Default for IndexApi {
    fn default() -> Self {
        IndexApi::Simple
    }
}

/// A source as declared in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SourceDecl {
    pub name: String,
    pub url: Url,
    pub priority: SourcePriority,
    #[serde(default)]
    pub api: IndexApi,
}

/// Where a locked package came from. This is identity-bearing: the same
/// name+version from two different sources are two different packages.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum Source {
    Index { name: String, url: Url },
    Url { url: Url },
    Path { path: String },
    Vcs {
        url: Url,
        reference: String,
        resolved_commit: String,
    },
}

impl Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Index { name, .. } => write!(f, "index:{}", name),
            Source::Url { url } => write!(f, "url:{}", url),
            Source::Path { path } => write!(f, "path:{}", path),
            Source::Vcs {
                url,
                reference,
                resolved_commit,
            } => write!(f, "vcs:{}@{} ({})", url, reference, resolved_commit),
        }
    }
}

/// The identity of one resolved package: (name, version, source).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageId {
    pub name: PackageName,
    pub version: Version,
    pub source: Source,
}

impl Display for PackageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} from {}", self.name.as_given(), self.version, self.source)
    }
}
