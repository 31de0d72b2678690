use crate::prelude::*;

use std::path::PathBuf;
use std::time::Duration;

use crate::db::{Credentials, HttpOptions};
use crate::index::{IndexApi, SourceDecl, SourcePriority};
use crate::install::BinaryPolicy;

pub static DEFAULT_INDEX_URL: Lazy<Url> =
    Lazy::new(|| "https://pypi.org/simple/".parse().unwrap());

/// Settings as they appear in a config file. Everything here also has an
/// environment-variable override (which wins), per resolve_env below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DeclaredConfig {
    pub cache_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub max_workers: Option<usize>,
    pub max_retries: Option<usize>,
    pub request_timeout_secs: Option<u64>,
    pub no_cache: bool,
    /// ":all:" or a list of package names
    pub no_binary: Option<Vec<String>>,
    pub only_binary: bool,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub cache_dir: PathBuf,
    pub data_dir: PathBuf,
    pub max_workers: usize,
    pub max_retries: usize,
    pub timeout: Duration,
    pub no_cache: bool,
    pub binary_policy: BinaryPolicy,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl Config {
    pub fn resolve(declared: DeclaredConfig) -> Result<Config> {
        let cache_dir = env_var("SPRIG_CACHE_DIR")
            .map(PathBuf::from)
            .or(declared.cache_dir)
            .unwrap_or_else(|| crate::prelude::PROJECT_DIRS.cache_dir().into());
        let data_dir = env_var("SPRIG_DATA_DIR")
            .map(PathBuf::from)
            .or(declared.data_dir)
            .unwrap_or_else(|| crate::prelude::PROJECT_DIRS.data_dir().into());
        let max_workers = match env_var("SPRIG_MAX_WORKERS") {
            Some(value) => value.parse().wrap_err("parsing SPRIG_MAX_WORKERS")?,
            None => declared
                .max_workers
                .unwrap_or_else(crate::install::default_worker_count),
        };
        let max_retries = match env_var("SPRIG_MAX_RETRIES") {
            Some(value) => value.parse().wrap_err("parsing SPRIG_MAX_RETRIES")?,
            None => declared.max_retries.unwrap_or(5),
        };
        let timeout = Duration::from_secs(declared.request_timeout_secs.unwrap_or(15));
        let no_cache = env_var("SPRIG_NO_CACHE").is_some() || declared.no_cache;

        let binary_policy = if env_var("SPRIG_ONLY_BINARY").is_some()
            || declared.only_binary
        {
            BinaryPolicy::OnlyBinary
        } else {
            let no_binary = env_var("SPRIG_NO_BINARY")
                .map(|value| value.split(',').map(str::to_owned).collect::<Vec<_>>())
                .or(declared.no_binary);
            match no_binary {
                None => BinaryPolicy::Either,
                Some(values) if values.iter().any(|v| v == ":all:") => {
                    BinaryPolicy::NoBinary(None)
                }
                Some(values) => {
                    let names = values
                        .iter()
                        .map(|v| v.as_str().try_into())
                        .collect::<Result<HashSet<PackageName>>>()?;
                    BinaryPolicy::NoBinary(Some(names))
                }
            }
        };

        Ok(Config {
            cache_dir,
            data_dir,
            max_workers,
            max_retries,
            timeout,
            no_cache,
            binary_policy,
        })
    }

    /// The source list for a project: what the manifest declares, with
    /// per-source env overrides applied, or the default public index when
    /// nothing is declared.
    pub fn sources_for(&self, declared: &[SourceDecl]) -> Result<Vec<SourceDecl>> {
        let mut sources = if declared.is_empty() {
            vec![SourceDecl {
                name: "pypi".into(),
                url: DEFAULT_INDEX_URL.clone(),
                priority: SourcePriority::Primary,
                api: IndexApi::Simple,
            }]
        } else {
            declared.to_vec()
        };
        for source in &mut sources {
            if let Some(url) = env_var(&source_env_key(&source.name, "URL")) {
                source.url = url
                    .parse()
                    .wrap_err_with(|| format!("parsing URL override for source {}", source.name))?;
            }
        }
        Ok(sources)
    }

    /// Transport settings, with per-source credentials pulled from the
    /// environment (SPRIG_SOURCE_<NAME>_USERNAME / _PASSWORD / _TOKEN).
    pub fn http_options(&self, sources: &[SourceDecl]) -> HttpOptions {
        let mut credentials = Credentials::default();
        for source in sources {
            if let Some(token) = env_var(&source_env_key(&source.name, "TOKEN")) {
                credentials.add_token(&source.url, &token);
            } else if let (Some(username), Some(password)) = (
                env_var(&source_env_key(&source.name, "USERNAME")),
                env_var(&source_env_key(&source.name, "PASSWORD")),
            ) {
                credentials.add_basic(&source.url, &username, &password);
            }
        }
        HttpOptions {
            timeout: self.timeout,
            max_retries: self.max_retries,
            cache_disabled: self.no_cache,
            credentials,
        }
    }

    /// Where the tool's own plugin environment lives: a manifest and lock in
    /// the same schema as project artifacts.
    pub fn system_manifest_path(&self) -> PathBuf {
        self.data_dir.join("system/sprig.toml")
    }

    pub fn system_lock_path(&self) -> PathBuf {
        self.data_dir.join("system/sprig.lock")
    }
}

fn source_env_key(source_name: &str, field: &str) -> String {
    let mut mangled = source_name.to_ascii_uppercase();
    mangled = mangled.replace(|c: char| !c.is_ascii_alphanumeric(), "_");
    format!("SPRIG_SOURCE_{}_{}", mangled, field)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_source_env_key_mangling() {
        assert_eq!(source_env_key("pypi", "URL"), "SPRIG_SOURCE_PYPI_URL");
        assert_eq!(
            source_env_key("my-index", "TOKEN"),
            "SPRIG_SOURCE_MY_INDEX_TOKEN"
        );
    }

    #[test]
    fn test_default_source_when_none_declared() {
        let config = Config::resolve(DeclaredConfig::default()).unwrap();
        let sources = config.sources_for(&[]).unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].name, "pypi");
        assert_eq!(sources[0].priority, SourcePriority::Primary);
    }

    #[test]
    fn test_declared_config_overrides() {
        let declared = DeclaredConfig {
            max_workers: Some(2),
            max_retries: Some(1),
            only_binary: true,
            ..Default::default()
        };
        let config = Config::resolve(declared).unwrap();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.binary_policy, BinaryPolicy::OnlyBinary);
    }
}
