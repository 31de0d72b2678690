use crate::prelude::*;

// the sync variant: the executor's worker pool shares the db across threads
use elsa::sync::FrozenMap;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

use super::artifacts::{Sdist, Wheel};
use super::build::SdistBuilder;
use super::http::{CacheMode, Http, NotCached};
use super::lazy::LazyRemoteFile;
use super::store::{BlobStore, TreeStore};
use crate::index::{
    fetch_project_page, local, ArtifactInfo, PackageId, Source, SourceDecl,
    SourcePriority, VcsClient,
};

/// An artifact plus the source that listed it.
#[derive(Debug, Clone)]
pub struct IndexedArtifact {
    pub info: ArtifactInfo,
    pub source: Source,
}

static NO_ARTIFACTS: [IndexedArtifact; 0] = [];

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

/// The package database: one stop for "what exists", "what does it need",
/// and "give me the file". Composes the configured sources, the HTTP layer,
/// and the on-disk caches; memoizes per-run so the resolver sees a frozen
/// view of the world no matter how I/O interleaves.
pub struct PackageDB {
    http: Arc<Http>,
    sources: Vec<SourceDecl>,
    metadata_cache: BlobStore,
    pub(crate) wheel_cache: TreeStore,
    pub(crate) build_store: TreeStore,
    vcs: Box<dyn VcsClient>,
    project_root: PathBuf,

    // memo: (name, explicitly-requested source) -> version -> artifacts
    listings: FrozenMap<(PackageName, Option<String>), Box<IndexMap<Version, Vec<IndexedArtifact>>>>,
}

impl PackageDB {
    pub fn new(
        sources: Vec<SourceDecl>,
        cache_root: &Path,
        http_options: super::http::HttpOptions,
        vcs: Box<dyn VcsClient>,
        project_root: &Path,
    ) -> Result<PackageDB> {
        let http = Arc::new(Http::new(
            BlobStore::new(&cache_root.join("http"))?,
            BlobStore::new(&cache_root.join("by-hash"))?,
            http_options,
        ));
        Ok(PackageDB {
            http,
            sources,
            metadata_cache: BlobStore::new(&cache_root.join("metadata"))?,
            wheel_cache: TreeStore::new(&cache_root.join("local-wheels"))?,
            build_store: TreeStore::new(&cache_root.join("builds"))?,
            vcs,
            project_root: project_root.into(),
            listings: Default::default(),
        })
    }

    pub fn http(&self) -> &Arc<Http> {
        &self.http
    }

    pub fn declared_sources(&self) -> &[SourceDecl] {
        &self.sources
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Which sources to consult for an unpinned requirement, most preferred
    /// first. A default source is exclusive; explicit sources only answer
    /// when named.
    fn search_plan(&self, requested: Option<&str>) -> Result<(Vec<&SourceDecl>, Vec<&SourceDecl>)> {
        if let Some(name) = requested {
            let decl = self
                .sources
                .iter()
                .find(|s| s.name == name)
                .ok_or_else(|| eyre!("requirement names unknown source {:?}", name))?;
            return Ok((vec![decl], vec![]));
        }
        if let Some(default) = self
            .sources
            .iter()
            .find(|s| s.priority == SourcePriority::Default)
        {
            return Ok((vec![default], vec![]));
        }
        let primaries = self
            .sources
            .iter()
            .filter(|s| s.priority == SourcePriority::Primary)
            .collect();
        let supplementals = self
            .sources
            .iter()
            .filter(|s| s.priority == SourcePriority::Supplemental)
            .collect();
        Ok((primaries, supplementals))
    }

    fn fetch_listings(
        &self,
        name: &PackageName,
        requested: Option<&str>,
    ) -> Result<IndexMap<Version, Vec<IndexedArtifact>>> {
        let (first_tier, second_tier) = self.search_plan(requested)?;
        let mut packed: IndexMap<Version, Vec<IndexedArtifact>> = Default::default();

        let mut consult = |decls: &[&SourceDecl],
                           packed: &mut IndexMap<Version, Vec<IndexedArtifact>>|
         -> Result<()> {
            for decl in decls {
                let maybe_info = fetch_project_page(&self.http, &decl.url, decl.api, name)?;
                if let Some(info) = maybe_info {
                    let source = Source::Index {
                        name: decl.name.clone(),
                        url: decl.url.clone(),
                    };
                    for (version, artifacts) in info.by_version() {
                        let entry = packed.entry(version).or_default();
                        entry.extend(artifacts.into_iter().map(|info| IndexedArtifact {
                            info,
                            source: source.clone(),
                        }));
                    }
                }
            }
            Ok(())
        };

        consult(&first_tier, &mut packed)?;
        if packed.is_empty() {
            // supplemental sources only get a say when the primaries came up
            // completely empty for this name
            consult(&second_tier, &mut packed)?;
        }

        // keep per-version artifact order independent of which source
        // answered first
        for artifacts in packed.values_mut() {
            artifacts.sort_by(|a, b| {
                (&a.info.name, &a.source).cmp(&(&b.info.name, &b.source))
            });
        }
        packed.sort_unstable_by(|v1, _, v2, _| v2.cmp(v1));
        Ok(packed)
    }

    /// All known artifacts for a name, newest version first. Memoized for
    /// the life of this PackageDB.
    pub fn available_artifacts(
        &self,
        name: &PackageName,
        requested_source: Option<&str>,
    ) -> Result<&IndexMap<Version, Vec<IndexedArtifact>>> {
        context!("Looking up available files for {}", name.as_given());
        let key = (name.clone(), requested_source.map(String::from));
        get_or_fill(&self.listings, &key, || {
            Ok(Box::new(self.fetch_listings(name, requested_source)?))
        })
    }

    pub fn artifacts_for_version(
        &self,
        name: &PackageName,
        version: &Version,
        requested_source: Option<&str>,
    ) -> Result<&[IndexedArtifact]> {
        match self
            .available_artifacts(name, requested_source)?
            .get(version)
        {
            Some(artifacts) => Ok(artifacts),
            None => Ok(&NO_ARTIFACTS),
        }
    }

    fn metadata_from_cache(&self, ai: &ArtifactInfo) -> Option<Vec<u8>> {
        let mut f = self.metadata_cache.read(ai.hash.as_ref()?)?;
        slurp(&mut f).ok()
    }

    fn put_metadata_in_cache(&self, ai: &ArtifactInfo, blob: &[u8]) -> Result<()> {
        if let Some(hash) = &ai.hash {
            self.metadata_cache.read_or_fill(hash, |w| {
                w.write_all(blob)?;
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Core metadata for one resolved version, trying the cheap paths first:
    /// metadata cache, cached artifact, PEP 658 sidecar, range-request read
    /// of the remote wheel, full wheel download, and only then building an
    /// sdist.
    pub fn get_metadata(
        &self,
        artifacts: &[IndexedArtifact],
        builder: Option<&SdistBuilder>,
    ) -> Result<(ArtifactInfo, CoreMetadata)> {
        let wheels = || {
            artifacts
                .iter()
                .filter(|ia| ia.info.name.as_wheel().is_some())
        };

        // cached parsed metadata?
        for ia in wheels() {
            if let Some(blob) = self.metadata_from_cache(&ia.info) {
                return Ok((ia.info.clone(), Wheel::parse_metadata(&blob)?));
            }
        }

        // cached artifact?
        for ia in wheels() {
            match self.open_wheel(&ia.info, CacheMode::OnlyIfCached) {
                Ok(wheel) => {
                    let (blob, metadata) = wheel.metadata()?;
                    self.put_metadata_in_cache(&ia.info, &blob)?;
                    return Ok((ia.info.clone(), metadata));
                }
                Err(err) => match err.downcast_ref::<NotCached>() {
                    Some(_) => continue,
                    None => return Err(err),
                },
            }
        }

        // PEP 658 metadata sidecar?
        for ia in wheels() {
            if !ia.info.core_metadata.available {
                continue;
            }
            let sidecar_url: Url = format!("{}.metadata", ia.info.url).parse()?;
            match self.http.get_hashed(
                &sidecar_url,
                ia.info.core_metadata.hash.as_ref(),
                CacheMode::Default,
            ) {
                Ok(mut body) => {
                    let blob = slurp(&mut body)?;
                    let metadata = Wheel::parse_metadata(&blob)?;
                    self.put_metadata_in_cache(&ia.info, &blob)?;
                    return Ok((ia.info.clone(), metadata));
                }
                Err(err) => {
                    warn!("failed to fetch metadata sidecar for {}: {}", ia.info.url, err);
                }
            }
        }

        // range-request the tail of the remote wheel?
        for ia in wheels() {
            match self.open_lazy_wheel(&ia.info) {
                Ok(wheel) => {
                    let (blob, metadata) = wheel.metadata()?;
                    self.put_metadata_in_cache(&ia.info, &blob)?;
                    return Ok((ia.info.clone(), metadata));
                }
                Err(err) => match err.downcast_ref::<SprigError>() {
                    Some(SprigError::RangesNotSupported) => continue,
                    _ => return Err(err),
                },
            }
        }

        // last resort for wheels: download the whole thing
        for ia in wheels() {
            let wheel = self.open_wheel(&ia.info, CacheMode::Default)?;
            let (blob, metadata) = wheel.metadata()?;
            self.put_metadata_in_cache(&ia.info, &blob)?;
            return Ok((ia.info.clone(), metadata));
        }

        // no wheels at all: build an sdist's metadata
        if let Some(builder) = builder {
            for ia in artifacts {
                if ia.info.name.as_sdist().is_some() {
                    let (blob, metadata) = builder.built_metadata(self, &ia.info)?;
                    self.put_metadata_in_cache(&ia.info, &blob)?;
                    return Ok((ia.info.clone(), metadata));
                }
            }
        }

        bail!(
            "couldn't find usable metadata for {:?}",
            artifacts.iter().map(|ia| &ia.info.name).collect::<Vec<_>>()
        );
    }

    fn open_wheel(&self, ai: &ArtifactInfo, cache_mode: CacheMode) -> Result<Wheel> {
        let name = ai
            .name
            .as_wheel()
            .ok_or_else(|| eyre!("{} is not a wheel", ai.name))?
            .clone();
        let body = self.http.get_hashed(&ai.url, ai.hash.as_ref(), cache_mode)?;
        Wheel::new(name, body)
    }

    fn open_lazy_wheel(&self, ai: &ArtifactInfo) -> Result<Wheel> {
        let name = ai
            .name
            .as_wheel()
            .ok_or_else(|| eyre!("{} is not a wheel", ai.name))?
            .clone();
        let body = LazyRemoteFile::new(self.http.clone(), &ai.url)?;
        Wheel::new(name, Box::new(body))
    }

    pub fn get_wheel(&self, ai: &ArtifactInfo) -> Result<Wheel> {
        self.open_wheel(ai, CacheMode::Default)
    }

    pub fn get_sdist(&self, ai: &ArtifactInfo) -> Result<Sdist> {
        let name = ai
            .name
            .as_sdist()
            .ok_or_else(|| eyre!("{} is not an sdist", ai.name))?
            .clone();
        let body = self.http.get_hashed(&ai.url, ai.hash.as_ref(), CacheMode::Default)?;
        Sdist::new(name, body)
    }

    /// Resolve a path/URL/VCS requirement to its single candidate. The
    /// version comes from the project's own metadata (or the VCS revision's
    /// checkout), not from any index.
    pub fn local_candidate(
        &self,
        requirement: &crate::manifest::ManifestRequirement,
    ) -> Result<(PackageId, CoreMetadata)> {
        use crate::manifest::LocalKind;
        let req = &requirement.requirement;

        if let Some(url) = &req.url {
            return self.url_candidate(req, url);
        }

        let local = requirement
            .local
            .as_ref()
            .ok_or_else(|| eyre!("{} is not a local requirement", req.name.as_given()))?;

        match local {
            LocalKind::Path { path } => {
                let full = self.project_root.join(path);
                let metadata = if full.is_dir() {
                    local::tree_metadata(&full)?
                } else {
                    local::file_metadata(&full)?.1
                };
                if metadata.name != req.name {
                    bail!(
                        "path dependency {} actually contains {}",
                        path,
                        metadata.name.as_given()
                    );
                }
                Ok((
                    PackageId {
                        name: metadata.name.clone(),
                        version: metadata.version.clone(),
                        source: Source::Path { path: path.clone() },
                    },
                    metadata,
                ))
            }
            LocalKind::Vcs { url, reference } => {
                let commit = self.vcs.resolve_reference(url, reference)?;
                let checkout = self.vcs_checkout(url, &commit)?;
                let metadata = local::tree_metadata(&checkout)?;
                if metadata.name != req.name {
                    bail!(
                        "vcs dependency {} actually contains {}",
                        url,
                        metadata.name.as_given()
                    );
                }
                Ok((
                    PackageId {
                        name: metadata.name.clone(),
                        version: metadata.version.clone(),
                        source: Source::Vcs {
                            url: url.clone(),
                            reference: reference.clone(),
                            resolved_commit: commit,
                        },
                    },
                    metadata,
                ))
            }
        }
    }

    pub fn vcs_checkout(&self, url: &Url, commit: &str) -> Result<PathBuf> {
        let key = format!("vcs\0{}\0{}", url, commit);
        self.build_store.read_or_fill(&key.as_bytes(), |dest| {
            self.vcs.checkout(url, commit, dest)
        })
    }

    fn url_candidate(
        &self,
        req: &Requirement,
        url: &Url,
    ) -> Result<(PackageId, CoreMetadata)> {
        let filename = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .ok_or_else(|| eyre!("direct URL {} has no filename", url))?;
        let artifact_name: ArtifactName = filename.try_into()?;
        let metadata = match &artifact_name {
            ArtifactName::Wheel(name) => {
                let wheel = match LazyRemoteFile::new(self.http.clone(), url) {
                    Ok(lazy) => Wheel::new(name.clone(), Box::new(lazy))?,
                    Err(_) => {
                        let body = self.http.get_hashed(url, None, CacheMode::Default)?;
                        Wheel::new(name.clone(), body)?
                    }
                };
                wheel.metadata()?.1
            }
            ArtifactName::Sdist(_) => {
                // pull the artifact down and read PKG-INFO out of it
                let mut body = self.http.get_hashed(url, None, CacheMode::Default)?;
                let staged = tempfile::NamedTempFile::new()?;
                std::io::copy(&mut body, &mut staged.as_file())?;
                let path = staged.path().with_file_name(filename);
                std::fs::copy(staged.path(), &path)?;
                let metadata = local::file_metadata(&path)?.1;
                std::fs::remove_file(&path).ok();
                metadata
            }
        };
        if metadata.name != req.name {
            bail!(
                "direct reference {} actually contains {}",
                url,
                metadata.name.as_given()
            );
        }
        Ok((
            PackageId {
                name: metadata.name.clone(),
                version: metadata.version.clone(),
                source: Source::Url { url: url.clone() },
            },
            metadata,
        ))
    }
}
