use crate::prelude::*;

use super::http::{CacheMode, Http};
use std::cmp;
use std::io::{self, SeekFrom};

// Large enough to usually grab the whole zip central directory plus the
// .dist-info entries at the tail of a wheel in one request.
const LAZY_FETCH_SIZE: u64 = 10_000;

/// A Read+Seek over a remote file, materialized piecewise with HTTP range
/// requests. This is what lets us pull METADATA out of a wheel without
/// downloading the rest of it.
pub struct LazyRemoteFile {
    http: Arc<Http>,
    url: Url,
    loaded: BTreeMap<u64, Vec<u8>>,
    length: u64,
    seek_pos: u64,
}

enum RangeResponse {
    NotSatisfiable {
        total_len: u64,
    },
    Partial {
        offset: u64,
        total_len: u64,
        data: Box<dyn Read>,
    },
    Complete(Box<dyn Read>),
}

fn fetch_range(
    http: &Http,
    method: &str,
    url: &Url,
    range_header: &str,
) -> Result<RangeResponse> {
    context!("Attempting range read on {url}");
    // RFC 7233 allows several Content-Range shapes; these two are the only
    // ones useful to us.
    static CONTENT_RANGE_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^bytes ([0-9]+)-[0-9]+/([0-9]+)$").unwrap());
    static CONTENT_RANGE_LEN_ONLY_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^bytes [^/]*/([0-9]+)$").unwrap());

    let request = http::Request::builder()
        .method(method)
        .uri(url.as_str())
        .header("Range", range_header)
        .body(())?;
    let response = http.request(request, CacheMode::NoStore)?;

    let content_range = |response: &http::Response<_>| -> Result<String> {
        match response.headers().get("Content-Range") {
            Some(value) => Ok(std::str::from_utf8(value.as_bytes())?.to_owned()),
            None => bail!("range response is missing Content-Range"),
        }
    };

    Ok(match response.status().as_u16() {
        // 206 Partial Content
        206 => {
            let header = content_range(&response)?;
            let captures = CONTENT_RANGE_RE
                .captures(&header)
                .ok_or_else(|| eyre!("failed to parse Content-Range {:?}", header))?;
            // unwraps safe: both groups match valid integers
            RangeResponse::Partial {
                offset: captures.get(1).unwrap().as_str().parse()?,
                total_len: captures.get(2).unwrap().as_str().parse()?,
                data: Box::new(response.into_body()),
            }
        }
        // 416 Range Not Satisfiable: e.g. we asked past the end, which is
        // exactly what the probe in new() does. The error still tells us the
        // total length.
        416 => {
            let header = content_range(&response)?;
            let captures = CONTENT_RANGE_LEN_ONLY_RE
                .captures(&header)
                .ok_or_else(|| eyre!("failed to parse 416 Content-Range {:?}", header))?;
            RangeResponse::NotSatisfiable {
                total_len: captures.get(1).unwrap().as_str().parse()?,
            }
        }
        // 200 Ok: the server ignored our Range header
        200 => RangeResponse::Complete(Box::new(response.into_body())),
        status => bail!("expected 200 or 206 HTTP response, not {}", status),
    })
}

impl LazyRemoteFile {
    pub fn new(http: Arc<Http>, url: &Url) -> Result<LazyRemoteFile> {
        context!("Probing {url} for range support");
        let length = match fetch_range(&http, "HEAD", url, "bytes=0-1")? {
            RangeResponse::NotSatisfiable { total_len } => total_len,
            RangeResponse::Partial { total_len, .. } => total_len,
            RangeResponse::Complete(_) => Err(SprigError::RangesNotSupported)?,
        };
        Ok(LazyRemoteFile {
            http,
            url: url.clone(),
            loaded: BTreeMap::new(),
            length,
            seek_pos: 0,
        })
    }

    fn load_range(&mut self, offset: u64, length: u64) -> Result<()> {
        match fetch_range(
            &self.http,
            "GET",
            &self.url,
            &format!("bytes={}-{}", offset, offset.saturating_add(length) - 1),
        )? {
            RangeResponse::Partial {
                offset, mut data, ..
            } => {
                self.loaded.insert(offset, slurp(&mut data)?);
                Ok(())
            }
            RangeResponse::NotSatisfiable { .. } => {
                bail!("server rejected a range it previously advertised")
            }
            RangeResponse::Complete(_) => {
                bail!("server abruptly stopped understanding range requests")
            }
        }
    }
}

fn copy_loaded(offset: u64, loaded: &BTreeMap<u64, Vec<u8>>, buf: &mut [u8]) -> Option<usize> {
    // the chunk starting at or before the requested offset, if it reaches
    let (chunk_offset, chunk) = loaded.range(..=offset).next_back()?;
    let skip = usize::try_from(offset - chunk_offset).ok()?;
    if skip >= chunk.len() {
        return None;
    }
    let usable = &chunk[skip..];
    let len = cmp::min(buf.len(), usable.len());
    buf[..len].copy_from_slice(&usable[..len]);
    Some(len)
}

fn io_err<T, E>(input: std::result::Result<T, E>) -> io::Result<T>
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    input.map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

impl Read for LazyRemoteFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let bytes_wanted =
            cmp::min(buf.len() as u64, self.length.saturating_sub(self.seek_pos));
        if bytes_wanted == 0 {
            return Ok(0);
        }
        if let Some(len) = copy_loaded(self.seek_pos, &self.loaded, buf) {
            self.seek_pos += len as u64;
            return Ok(len);
        }
        // find the unloaded gap around the current position, then fetch a
        // chunk inside it, preferring to end flush against the following
        // chunk (reads at the end of a file walk backwards through the zip
        // directory, so aligning this way avoids re-fetching)
        let gap_start = match self.loaded.range(..=self.seek_pos).next_back() {
            Some((offset, data)) => offset + data.len() as u64,
            None => 0,
        };
        let gap_end = match self.loaded.range(self.seek_pos + 1..).next() {
            Some((offset, _)) => *offset,
            None => self.length,
        };
        let fetch_start = if gap_end - self.seek_pos < LAZY_FETCH_SIZE {
            gap_end.saturating_sub(LAZY_FETCH_SIZE)
        } else {
            self.seek_pos
        };
        let fetch_end = (fetch_start + LAZY_FETCH_SIZE).clamp(gap_start, gap_end);
        let fetch_start = fetch_start.clamp(gap_start, gap_end);
        io_err(self.load_range(fetch_start, fetch_end - fetch_start))?;
        // now it's definitely loaded
        if let Some(len) = copy_loaded(self.seek_pos, &self.loaded, buf) {
            self.seek_pos += len as u64;
            return Ok(len);
        }
        unreachable!("range fetch failed to cover the requested offset");
    }
}

impl Seek for LazyRemoteFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        // structure cribbed from io::Cursor; seeking past EOF is allowed and
        // reads there just return 0
        let (base, offset) = match pos {
            SeekFrom::Start(offset) => {
                self.seek_pos = offset;
                return Ok(offset);
            }
            SeekFrom::End(offset) => (self.length, offset),
            SeekFrom::Current(offset) => (self.seek_pos, offset),
        };
        let new_pos = if offset >= 0 {
            base.checked_add(offset as u64)
        } else {
            base.checked_sub(offset.wrapping_neg() as u64)
        };
        match new_pos {
            Some(n) => {
                self.seek_pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}
