use crate::prelude::*;

use http_cache_semantics::{AfterResponse, BeforeRequest, CachePolicy};
use std::io::SeekFrom;
use std::time::{Duration, SystemTime};

use super::slice::SeekSlice;
use super::store::{BlobEntry, BlobStore};

const MAX_REDIRECTS: u16 = 5;
const REDIRECT_STATUSES: &[u16] = &[301, 302, 303, 307, 308];

// the backoff schedule pip uses: 0.25 * 2 ** (retries - 1) seconds
const SLEEP_TIMES_MS: &[u64] = &[250, 500, 1000, 2000, 4000];
// Copied from pip/_internal/network/session.py
const RETRY_STATUS: &[u16] = &[500, 503, 520, 527];
use ureq::ErrorKind::*;
const RETRY_ERRORKIND: &[ureq::ErrorKind] =
    &[Dns, ConnectionFailed, TooManyRedirects, Io, ProxyConnect];

/// Attached to responses as an http extension, mostly so tests can see what
/// the cache did.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    Fresh,
    StaleButValidated,
    StaleAndChanged,
    Miss,
    Uncacheable,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheMode {
    /// Regular HTTP caching semantics
    Default,
    /// Return the cached entry or fail with NotCached; never touch the network
    OnlyIfCached,
    /// Don't read or write the cache
    NoStore,
}

#[derive(Debug)]
pub struct NotCached;

impl Display for NotCached {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "request not in cache, and cache_mode=OnlyIfCached")
    }
}

impl std::error::Error for NotCached {}

/// Authorization material for specific index URLs, from config/env. Applied
/// to any request whose URL sits under the registered prefix.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    entries: Vec<(Url, String)>,
}

impl Credentials {
    pub fn add_basic(&mut self, prefix: &Url, username: &str, password: &str) {
        let encoded = data_encoding::BASE64
            .encode(format!("{}:{}", username, password).as_bytes());
        self.entries
            .push((prefix.clone(), format!("Basic {}", encoded)));
    }

    pub fn add_token(&mut self, prefix: &Url, token: &str) {
        self.entries
            .push((prefix.clone(), format!("Bearer {}", token)));
    }

    fn lookup(&self, url: &Url) -> Option<&str> {
        self.entries
            .iter()
            .find(|(prefix, _)| {
                url.as_str().starts_with(prefix.as_str())
                    && url.host_str() == prefix.host_str()
            })
            .map(|(_, header)| header.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub timeout: Duration,
    pub max_retries: usize,
    /// true = ignore the HTTP cache entirely ("no-cache" mode)
    pub cache_disabled: bool,
    pub credentials: Credentials,
}

impl Default for HttpOptions {
    fn default() -> Self {
        HttpOptions {
            timeout: Duration::from_secs(15),
            max_retries: SLEEP_TIMES_MS.len(),
            cache_disabled: false,
            credentials: Credentials::default(),
        }
    }
}

pub enum ReadPlusMaybeSeek {
    CanSeek(Box<dyn ReadPlusSeek>),
    CannotSeek(Box<dyn Read>),
}

impl Read for ReadPlusMaybeSeek {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ReadPlusMaybeSeek::CanSeek(inner) => inner.read(buf),
            ReadPlusMaybeSeek::CannotSeek(inner) => inner.read(buf),
        }
    }
}

impl ReadPlusMaybeSeek {
    pub fn force_seek(self) -> Result<Box<dyn ReadPlusSeek>> {
        Ok(match self {
            ReadPlusMaybeSeek::CanSeek(inner) => inner,
            ReadPlusMaybeSeek::CannotSeek(mut inner) => {
                let mut tmp = tempfile::tempfile()?;
                std::io::copy(&mut inner, &mut tmp)?;
                tmp.rewind()?;
                Box::new(tmp)
            }
        })
    }
}

fn make_response(
    parts: http::response::Parts,
    body: ReadPlusMaybeSeek,
    cache_status: CacheStatus,
) -> http::Response<ReadPlusMaybeSeek> {
    let mut response = http::Response::from_parts(parts, body);
    response.extensions_mut().insert(cache_status);
    response
}

fn user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// The shared HTTP client: a ureq agent, plus the two cache tiers (one
/// keyed by request, one keyed by artifact hash), plus retry/redirect/auth
/// handling.
pub struct Http {
    agent: ureq::Agent,
    options: HttpOptions,
    request_cache: BlobStore,
    hash_cache: BlobStore,
}

fn serialize_policy(policy: &CachePolicy, writer: &mut dyn Write) -> Result<()> {
    let mut framed = Vec::new();
    ciborium::ser::into_writer(policy, &mut framed)?;
    // length prefix, so the body offset is recoverable without re-parsing
    writer.write_all(&(framed.len() as u64).to_le_bytes())?;
    writer.write_all(&framed)?;
    Ok(())
}

fn fill_cache<R: Read>(
    policy: &CachePolicy,
    mut body: R,
    entry: BlobEntry,
) -> Result<impl Read + Seek> {
    let mut writer = entry.begin()?;
    serialize_policy(policy, &mut writer)?;
    let body_start = writer.stream_position()?;
    std::io::copy(&mut body, &mut writer)?;
    let body_end = writer.stream_position()?;
    drop(body);
    let committed = writer.commit()?.detach();
    Ok(SeekSlice::new(committed, body_start, body_end)?)
}

fn read_cache<R: Read + Seek>(mut f: R) -> Result<(CachePolicy, impl Read + Seek)> {
    let mut len_bytes = [0u8; 8];
    f.read_exact(&mut len_bytes)?;
    let policy_len = u64::from_le_bytes(len_bytes);
    let mut policy_bytes = vec![0u8; policy_len as usize];
    f.read_exact(&mut policy_bytes)?;
    let policy: CachePolicy = ciborium::de::from_reader(policy_bytes.as_slice())?;
    let start = f.stream_position()?;
    let end = f.seek(SeekFrom::End(0))?;
    let mut body = SeekSlice::new(f, start, end)?;
    body.rewind()?;
    Ok((policy, body))
}

fn cache_key<T>(req: &http::Request<T>) -> Vec<u8> {
    // http::Uri strips fragments, so they can't leak into the key
    let mut key: Vec<u8> = Default::default();
    let method = req.method().to_string().into_bytes();
    key.extend(method.len().to_le_bytes());
    key.extend(method);
    let uri = req.uri().to_string().into_bytes();
    key.extend(uri.len().to_le_bytes());
    key.extend(uri);
    key
}

impl Http {
    pub fn new(
        request_cache: BlobStore,
        hash_cache: BlobStore,
        options: HttpOptions,
    ) -> Http {
        let agent = ureq::AgentBuilder::new()
            .user_agent(&user_agent())
            // redirects are handled above the cache, so the agent must not
            .redirects(0)
            .timeout_read(options.timeout)
            .timeout_write(options.timeout)
            .build();
        Http {
            agent,
            options,
            request_cache,
            hash_cache,
        }
    }

    fn call_with_retry(
        &self,
        req: ureq::Request,
    ) -> std::result::Result<ureq::Response, ureq::Error> {
        let budget = std::cmp::min(self.options.max_retries, SLEEP_TIMES_MS.len());
        let mut sleeps = SLEEP_TIMES_MS[..budget].iter();
        loop {
            let result = req.clone().call();
            match &result {
                Ok(_) => return result,
                Err(ureq::Error::Status(status, _)) => {
                    if !RETRY_STATUS.contains(status) {
                        return result;
                    }
                }
                Err(err @ ureq::Error::Transport(_)) => {
                    if !RETRY_ERRORKIND.contains(&err.kind()) {
                        return result;
                    }
                }
            }
            match sleeps.next() {
                Some(ms) => {
                    warn!("transient network failure; retrying in {}ms", ms);
                    std::thread::sleep(Duration::from_millis(*ms));
                }
                None => return result,
            }
        }
    }

    /// Translate between the http crate's types (which the cache layer
    /// speaks) and ureq's (which actually does the I/O).
    fn do_request(&self, req: &http::Request<()>) -> Result<http::Response<impl Read>> {
        let url = Url::parse(&req.uri().to_string())?;
        let mut ureq_req = self.agent.request_url(req.method().as_str(), &url);
        for (name, value) in req.headers() {
            ureq_req = ureq_req.set(name.as_str(), std::str::from_utf8(value.as_bytes())?);
        }
        if req.headers().get("Authorization").is_none() {
            if let Some(header) = self.options.credentials.lookup(&url) {
                ureq_req = ureq_req.set("Authorization", header);
            }
        }
        use ureq::OrAnyStatus;
        let ureq_response = self.call_with_retry(ureq_req).or_any_status()?;
        let mut response = http::Response::builder().status(ureq_response.status());
        for name in ureq_response.headers_names() {
            for value in ureq_response.all(&name) {
                response = response.header(name.as_str(), value);
            }
        }
        Ok(response.body(ureq_response.into_reader())?)
    }

    fn one_request(
        &self,
        request: &http::Request<()>,
        cache_mode: CacheMode,
    ) -> Result<http::Response<ReadPlusMaybeSeek>> {
        let key = cache_key(request);
        let maybe_entry = if cache_mode == CacheMode::NoStore {
            None
        } else {
            Some(self.request_cache.entry(key.as_slice())?)
        };

        if let Some(entry) = &maybe_entry {
            if let Some(f) = entry.reader() {
                // detach releases the reader's hold before the entry gets
                // rewritten below; the entry itself still holds the lock
                let (old_policy, old_body) = read_cache(f.detach())?;
                return match old_policy.before_request(request, SystemTime::now()) {
                    BeforeRequest::Fresh(parts) => Ok(make_response(
                        parts,
                        ReadPlusMaybeSeek::CanSeek(Box::new(old_body)),
                        CacheStatus::Fresh,
                    )),
                    BeforeRequest::Stale {
                        request: new_parts,
                        matches: _,
                    } => {
                        if cache_mode == CacheMode::OnlyIfCached {
                            return Err(NotCached.into());
                        }
                        let request = http::Request::from_parts(new_parts, ());
                        let response = self.do_request(&request)?;
                        match old_policy.after_response(
                            &request,
                            &response,
                            SystemTime::now(),
                        ) {
                            AfterResponse::NotModified(new_policy, new_parts) => {
                                let new_body = fill_cache(
                                    &new_policy,
                                    old_body,
                                    maybe_entry.unwrap(),
                                )?;
                                Ok(make_response(
                                    new_parts,
                                    ReadPlusMaybeSeek::CanSeek(Box::new(new_body)),
                                    CacheStatus::StaleButValidated,
                                ))
                            }
                            AfterResponse::Modified(new_policy, new_parts) => {
                                let new_body = fill_cache(
                                    &new_policy,
                                    response.into_body(),
                                    maybe_entry.unwrap(),
                                )?;
                                Ok(make_response(
                                    new_parts,
                                    ReadPlusMaybeSeek::CanSeek(Box::new(new_body)),
                                    CacheStatus::StaleAndChanged,
                                ))
                            }
                        }
                    }
                };
            }
        }
        // no cache entry; do the request and maybe make one
        if cache_mode == CacheMode::OnlyIfCached {
            return Err(NotCached.into());
        }
        let response = self.do_request(request)?;
        let new_policy = CachePolicy::new(request, &response);
        let (parts, body) = response.into_parts();
        if !new_policy.is_storable() || maybe_entry.is_none() {
            Ok(make_response(
                parts,
                ReadPlusMaybeSeek::CannotSeek(Box::new(body)),
                CacheStatus::Uncacheable,
            ))
        } else {
            let new_body = fill_cache(&new_policy, body, maybe_entry.unwrap())?;
            Ok(make_response(
                parts,
                ReadPlusMaybeSeek::CanSeek(Box::new(new_body)),
                CacheStatus::Miss,
            ))
        }
    }

    pub fn request(
        &self,
        mut request: http::Request<()>,
        cache_mode: CacheMode,
    ) -> Result<http::Response<ReadPlusMaybeSeek>> {
        let cache_mode = if self.options.cache_disabled {
            CacheMode::NoStore
        } else {
            cache_mode
        };
        let max_redirects = if request.method() == http::Method::GET {
            MAX_REDIRECTS
        } else {
            0
        };
        for attempt in 0..=max_redirects {
            let url = Url::parse(&request.uri().to_string())?;
            let mut response = self.one_request(&request, cache_mode)?;
            if REDIRECT_STATUSES.contains(&response.status().as_u16()) {
                if attempt < max_redirects {
                    if let Some(target) = response.headers().get("Location") {
                        let target_str = std::str::from_utf8(target.as_bytes())?;
                        let full_target = url.join(target_str)?;
                        *request.uri_mut() = full_target.to_string().try_into()?;
                        continue;
                    }
                } else {
                    bail!("hit redirection limit at {}", url);
                }
            }
            // attach the final URL so callers can resolve relative links
            response.extensions_mut().insert(url);
            return Ok(response);
        }
        unreachable!()
    }

    /// Fetch an artifact. When we know its hash, the content-addressed store
    /// takes priority over HTTP caching semantics entirely: a hash hit needs
    /// no network at all, and a miss streams through a hash checker on the
    /// way to disk, so a corrupted download never lands in the cache.
    pub fn get_hashed(
        &self,
        url: &Url,
        maybe_hash: Option<&ArtifactHash>,
        cache_mode: CacheMode,
    ) -> Result<Box<dyn ReadPlusSeek>> {
        context!("Fetching {url}");
        let cache_mode = if self.options.cache_disabled {
            CacheMode::NoStore
        } else {
            cache_mode
        };
        let request = http::Request::builder().uri(url.as_str()).body(())?;
        match maybe_hash {
            Some(hash) if cache_mode != CacheMode::NoStore => {
                let entry = self.hash_cache.entry(hash)?;
                if let Some(reader) = entry.reader() {
                    return Ok(Box::new(reader.detach()));
                }
                if cache_mode == CacheMode::OnlyIfCached {
                    return Err(NotCached.into());
                }
                let mut body = self.request(request, CacheMode::NoStore)?.into_body();
                let mut checker = hash.checker(entry.begin()?)?;
                std::io::copy(&mut body, &mut checker)?;
                let writer = checker.finish().map_err(|err| {
                    err.wrap_err(format!("downloading {}", url))
                })?;
                Ok(Box::new(writer.commit()?.detach()))
            }
            _ => Ok(self.request(request, cache_mode)?.into_body().force_seek()?),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_credentials_prefix_match() {
        let mut creds = Credentials::default();
        creds.add_basic(
            &"https://pypi.internal.example.com/simple/".parse().unwrap(),
            "bot",
            "hunter2",
        );
        creds.add_token(&"https://other.example.com/".parse().unwrap(), "tok");

        let hit = creds
            .lookup(&"https://pypi.internal.example.com/simple/attrs/".parse().unwrap())
            .unwrap();
        assert!(hit.starts_with("Basic "));

        let token = creds
            .lookup(&"https://other.example.com/files/x.whl".parse().unwrap())
            .unwrap();
        assert_eq!(token, "Bearer tok");

        assert!(creds
            .lookup(&"https://unrelated.example.com/".parse().unwrap())
            .is_none());
        // same path prefix on a different host must not leak credentials
        assert!(creds
            .lookup(&"https://evil.example.net/simple/".parse().unwrap())
            .is_none());
    }

    #[test]
    fn test_cache_key_distinguishes_method_and_uri() {
        let get = http::Request::builder()
            .method("GET")
            .uri("https://example.com/a")
            .body(())
            .unwrap();
        let head = http::Request::builder()
            .method("HEAD")
            .uri("https://example.com/a")
            .body(())
            .unwrap();
        let other = http::Request::builder()
            .method("GET")
            .uri("https://example.com/b")
            .body(())
            .unwrap();
        assert_ne!(cache_key(&get), cache_key(&head));
        assert_ne!(cache_key(&get), cache_key(&other));
        assert_eq!(cache_key(&get), cache_key(&get));
    }

    #[test]
    fn test_policy_framing_round_trip() -> Result<()> {
        let req = http::Request::builder()
            .uri("https://example.com/listing")
            .body(())
            .unwrap();
        let resp = http::Response::builder()
            .status(200)
            .header("Cache-Control", "max-age=300")
            .body(())
            .unwrap();
        let policy = CachePolicy::new(&req, &resp);

        let tmp = tempfile::tempdir()?;
        let store = BlobStore::new(tmp.path())?;
        let entry = store.entry(&b"frame".as_slice())?;
        let mut cached_body =
            fill_cache(&policy, std::io::Cursor::new(b"the body".to_vec()), entry)?;
        assert_eq!(slurp(&mut cached_body)?, b"the body");

        let f = store.read(&b"frame".as_slice()).unwrap();
        let (read_back, mut body) = read_cache(f)?;
        assert!(read_back.is_storable());
        assert_eq!(slurp(&mut body)?, b"the body");
        Ok(())
    }
}
