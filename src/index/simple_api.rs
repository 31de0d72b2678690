use crate::prelude::*;

use indexmap::IndexMap;

use super::html::{extract_links, IndexLink};
use super::source::IndexApi;
use crate::db::{CacheMode, Http};

// The project-listing data model, shaped after PEP 691 (the JSON API); the
// PEP 503 HTML pages and single-page link lists get parsed into the same
// structs.

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawCoreMetadata")]
pub struct CoreMetadataRef {
    pub available: bool,
    pub hash: Option<ArtifactHash>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawCoreMetadata {
    Available(bool),
    Hashes(HashMap<String, String>),
}

impl From<RawCoreMetadata> for CoreMetadataRef {
    fn from(raw: RawCoreMetadata) -> Self {
        match raw {
            RawCoreMetadata::Available(available) => CoreMetadataRef {
                available,
                hash: None,
            },
            RawCoreMetadata::Hashes(hashes) => CoreMetadataRef {
                available: true,
                hash: hashes
                    .get("sha256")
                    .and_then(|hex| ArtifactHash::from_hex("sha256", hex).ok()),
            },
        }
    }
}

impl From<Option<RawCoreMetadata>> for CoreMetadataRef {
    fn from(raw: Option<RawCoreMetadata>) -> Self {
        raw.map(CoreMetadataRef::from).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawYanked")]
pub struct Yanked {
    pub yanked: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawYanked {
    Flag(bool),
    Reason(String),
}

impl From<RawYanked> for Yanked {
    fn from(raw: RawYanked) -> Self {
        match raw {
            RawYanked::Flag(yanked) => Yanked {
                yanked,
                reason: None,
            },
            RawYanked::Reason(reason) => Yanked {
                yanked: true,
                reason: Some(reason),
            },
        }
    }
}

/// One downloadable file out of an index listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub name: ArtifactName,
    pub url: Url,
    // The JSON API can serve several hashes per file; sha256 is the only one
    // we keep, because it's the only one the lock format records.
    pub hash: Option<ArtifactHash>,
    pub requires_python: Option<String>,
    pub core_metadata: CoreMetadataRef,
    pub yanked: Yanked,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectInfo {
    pub artifacts: Vec<ArtifactInfo>,
}

impl ProjectInfo {
    /// Group by version, newest first, artifacts name-sorted within each
    /// version so listing order never leaks into resolution output.
    pub fn by_version(self) -> IndexMap<Version, Vec<ArtifactInfo>> {
        let mut packed: IndexMap<Version, Vec<ArtifactInfo>> = Default::default();
        for ai in self.artifacts {
            packed
                .entry(ai.name.version().clone())
                .or_default()
                .push(ai);
        }
        for artifacts in packed.values_mut() {
            artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        }
        packed.sort_unstable_by(|v1, _, v2, _| v2.cmp(v1));
        packed
    }
}

fn artifact_from_link(link: IndexLink) -> Option<ArtifactInfo> {
    let filename = link.url.path_segments()?.last()?.to_owned();
    let name: ArtifactName = match filename.as_str().try_into() {
        Ok(name) => name,
        Err(_) => {
            // eggs, exes, and other fossils end up in old index listings;
            // they're not for us
            trace!("skipping unrecognized file {}", filename);
            return None;
        }
    };
    let hash = link
        .url
        .fragment()
        .and_then(|fragment| fragment.split_once('='))
        .and_then(|(algorithm, hex)| ArtifactHash::from_hex(algorithm, hex).ok());
    let mut url = link.url.clone();
    url.set_fragment(None);
    Some(ArtifactInfo {
        name,
        url,
        hash,
        requires_python: link.requires_python,
        core_metadata: match link.core_metadata.as_deref() {
            None => Default::default(),
            Some("true") => CoreMetadataRef {
                available: true,
                hash: None,
            },
            Some(value) => CoreMetadataRef {
                available: true,
                hash: value.parse().ok(),
            },
        },
        yanked: Yanked {
            yanked: link.yanked.is_some(),
            reason: link.yanked.filter(|r| !r.is_empty()),
        },
    })
}

pub fn parse_html_project_page(
    base: &Url,
    charset: Option<&str>,
    body: &mut dyn Read,
) -> Result<ProjectInfo> {
    let links = extract_links(base, charset, body)?;
    Ok(ProjectInfo {
        artifacts: links.into_iter().filter_map(artifact_from_link).collect(),
    })
}

// PEP 691 wire format

#[derive(Deserialize)]
struct JsonProject {
    meta: JsonMeta,
    files: Vec<JsonFile>,
}

#[derive(Deserialize)]
struct JsonMeta {
    #[serde(rename = "api-version")]
    api_version: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct JsonFile {
    filename: String,
    url: String,
    #[serde(default)]
    hashes: HashMap<String, String>,
    #[serde(default)]
    requires_python: Option<String>,
    #[serde(default)]
    core_metadata: Option<RawCoreMetadata>,
    #[serde(default)]
    yanked: Option<RawYanked>,
}

pub fn parse_json_project_page(base: &Url, body: &mut dyn Read) -> Result<ProjectInfo> {
    let parsed: JsonProject = serde_json::from_reader(body)?;
    if !parsed.meta.api_version.starts_with("1.") {
        bail!("unknown index api version {}", parsed.meta.api_version);
    }
    let mut artifacts = Vec::new();
    for file in parsed.files {
        let name: ArtifactName = match file.filename.as_str().try_into() {
            Ok(name) => name,
            Err(_) => {
                trace!("skipping unrecognized file {}", file.filename);
                continue;
            }
        };
        artifacts.push(ArtifactInfo {
            name,
            url: base.join(&file.url)?,
            hash: file
                .hashes
                .get("sha256")
                .and_then(|hex| ArtifactHash::from_hex("sha256", hex).ok()),
            requires_python: file.requires_python,
            core_metadata: file.core_metadata.into(),
            yanked: file.yanked.map(Yanked::from).unwrap_or_default(),
        });
    }
    Ok(ProjectInfo { artifacts })
}

/// Fetch one project's listing from an index. Returns None on 404 -- "this
/// index doesn't carry that name" is an ordinary answer, not an error.
/// Conditional-request revalidation comes for free from the Http layer.
pub fn fetch_project_page(
    http: &Http,
    base_url: &Url,
    api: IndexApi,
    name: &PackageName,
) -> Result<Option<ProjectInfo>> {
    let url = match api {
        // PEP 503: one page per project, trailing slash and all
        IndexApi::Simple | IndexApi::Json => {
            base_url.join(&format!("{}/", name.canonical()))?
        }
        // a flat page of links for every project at once
        IndexApi::Page => base_url.clone(),
    };
    context!("Fetching project listing {url}");

    let accept = match api {
        IndexApi::Json => "application/vnd.pypi.simple.v1+json",
        IndexApi::Simple | IndexApi::Page => {
            "application/vnd.pypi.simple.v1+html, text/html"
        }
    };
    let request = http::Request::builder()
        .uri(url.as_str())
        .header("Accept", accept)
        .body(())?;
    let response = http.request(request, CacheMode::Default)?;

    if response.status().as_u16() == 404 {
        return Ok(None);
    }
    if !response.status().is_success() {
        bail!("index returned {} for {}", response.status(), url);
    }

    let content_type = response
        .headers()
        .get("Content-Type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("text/html")
        .to_owned();
    let (media_type, charset) = split_content_type(&content_type);

    // the URL after redirects, so relative links resolve correctly
    let final_url = response
        .extensions()
        .get::<Url>()
        .cloned()
        .unwrap_or_else(|| url.clone());
    let mut body = response.into_body();

    let info = match media_type.as_str() {
        "application/vnd.pypi.simple.v1+json" => {
            parse_json_project_page(&final_url, &mut body)?
        }
        "text/html" | "application/vnd.pypi.simple.v1+html" => {
            parse_html_project_page(&final_url, charset.as_deref(), &mut body)?
        }
        other => bail!("index served unexpected content type {:?}", other),
    };

    let info = match api {
        // flat pages list every project; keep only the one we were asked for
        IndexApi::Page => ProjectInfo {
            artifacts: info
                .artifacts
                .into_iter()
                .filter(|ai| ai.name.distribution() == name)
                .collect(),
        },
        _ => info,
    };

    if info.artifacts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(info))
    }
}

fn split_content_type(value: &str) -> (String, Option<String>) {
    let mut parts = value.split(';');
    let media_type = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    let charset = parts
        .filter_map(|param| param.trim().strip_prefix("charset="))
        .next()
        .map(|s| s.trim_matches('"').to_owned());
    (media_type, charset)
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_html_page_to_artifacts() {
        let base: Url = "https://index.example.com/simple/demo/".parse().unwrap();
        let body = indoc! {r#"
            <html><body>
            <a href="../../files/demo-1.0.tar.gz#sha256=00112233">demo-1.0.tar.gz</a>
            <a href="../../files/demo-1.0-py3-none-any.whl" data-requires-python="&gt;=3.8">wheel</a>
            <a href="../../files/demo-0.5.egg">ancient</a>
            </body></html>
        "#};
        let info =
            parse_html_project_page(&base, Some("utf-8"), &mut body.as_bytes()).unwrap();
        // the egg is dropped
        assert_eq!(info.artifacts.len(), 2);
        assert_eq!(
            info.artifacts[0].hash.as_ref().unwrap().to_string(),
            "sha256=00112233"
        );
        // the fragment is stripped from the stored URL
        assert!(info.artifacts[0].url.fragment().is_none());
        assert_eq!(info.artifacts[1].requires_python.as_deref(), Some(">=3.8"));
    }

    #[test]
    fn test_json_page_to_artifacts() {
        let base: Url = "https://index.example.com/simple/demo/".parse().unwrap();
        let body = indoc! {r#"
            {
              "meta": {"api-version": "1.1"},
              "name": "demo",
              "files": [
                {
                  "filename": "demo-1.0-py3-none-any.whl",
                  "url": "https://files.example.com/demo-1.0-py3-none-any.whl",
                  "hashes": {"sha256": "aabb", "md5": "ignored"},
                  "requires-python": ">=3.8",
                  "core-metadata": {"sha256": "ccdd"},
                  "yanked": "oops"
                },
                {
                  "filename": "demo-1.0.tar.gz",
                  "url": "demo-1.0.tar.gz",
                  "hashes": {}
                }
              ]
            }
        "#};
        let info = parse_json_project_page(&base, &mut body.as_bytes()).unwrap();
        assert_eq!(info.artifacts.len(), 2);
        let wheel = &info.artifacts[0];
        assert_eq!(wheel.hash.as_ref().unwrap().to_string(), "sha256=aabb");
        assert!(wheel.core_metadata.available);
        assert_eq!(
            wheel.core_metadata.hash.as_ref().unwrap().to_string(),
            "sha256=ccdd"
        );
        assert!(wheel.yanked.yanked);
        assert_eq!(wheel.yanked.reason.as_deref(), Some("oops"));
        // relative file URL resolved against the page
        assert_eq!(
            info.artifacts[1].url.as_str(),
            "https://index.example.com/simple/demo/demo-1.0.tar.gz"
        );
    }

    #[test]
    fn test_json_page_rejects_future_api() {
        let base: Url = "https://index.example.com/simple/demo/".parse().unwrap();
        let body = r#"{"meta": {"api-version": "2.0"}, "files": []}"#;
        assert!(parse_json_project_page(&base, &mut body.as_bytes()).is_err());
    }

    #[test]
    fn test_by_version_ordering() {
        let base: Url = "https://i.example.com/simple/demo/".parse().unwrap();
        let body = indoc! {r#"
            <a href="demo-1.0.tar.gz">a</a>
            <a href="demo-2.0.tar.gz">b</a>
            <a href="demo-2.0-py3-none-any.whl">c</a>
            <a href="demo-1.5.tar.gz">d</a>
        "#};
        let info =
            parse_html_project_page(&base, None, &mut body.as_bytes()).unwrap();
        let packed = info.by_version();
        let versions: Vec<String> = packed.keys().map(|v| v.to_string()).collect();
        assert_eq!(versions, vec!["2.0", "1.5", "1.0"]);
        assert_eq!(packed[&"2.0".parse::<Version>().unwrap()].len(), 2);
    }

    #[test]
    fn test_split_content_type() {
        assert_eq!(
            split_content_type("text/html; charset=UTF-8"),
            ("text/html".to_string(), Some("UTF-8".to_string()))
        );
        assert_eq!(split_content_type("text/html"), ("text/html".to_string(), None));
    }
}
