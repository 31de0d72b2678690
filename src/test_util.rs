use crate::prelude::*;

use std::io::{BufRead, BufReader};
use std::net::{TcpListener, TcpStream};

// A tiny static HTTP server for exercising the provider/resolver stack
// against canned index pages and artifacts, without real network. One
// request per connection, HTTP/1.1 with Connection: close. No range
// support, which conveniently also exercises the full-download fallback.

pub struct StaticServer {
    port: u16,
}

#[derive(Clone)]
pub struct Page {
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl StaticServer {
    pub fn serve(pages: HashMap<String, Page>) -> StaticServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let pages = pages.clone();
                std::thread::spawn(move || {
                    let _ = handle(stream, &pages);
                });
            }
        });
        StaticServer { port }
    }

    pub fn url(&self, path: &str) -> Url {
        format!("http://127.0.0.1:{}{}", self.port, path)
            .parse()
            .unwrap()
    }
}

fn handle(stream: TcpStream, pages: &HashMap<String, Page>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_owned();
    let path = parts.next().unwrap_or("/").to_owned();
    // drain headers
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line == "\r\n" || line == "\n" || line.is_empty() {
            break;
        }
    }

    let mut stream = stream;
    match pages.get(&path) {
        Some(page) => {
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                page.content_type,
                page.body.len()
            )?;
            if method != "HEAD" {
                stream.write_all(&page.body)?;
            }
        }
        None => {
            let body = b"not found";
            write!(
                stream,
                "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )?;
            if method != "HEAD" {
                stream.write_all(body)?;
            }
        }
    }
    Ok(())
}

/// Build a minimal but real wheel in memory.
pub fn wheel_bytes(
    name: &str,
    version: &str,
    requires_dist: &[&str],
    requires_python: Option<&str>,
) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut z = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        let opts = zip::write::FileOptions::default();
        let module = name.replace('-', "_");
        z.start_file(format!("{module}/__init__.py"), opts).unwrap();
        z.write_all(b"").unwrap();
        z.start_file(format!("{name}-{version}.dist-info/WHEEL"), opts)
            .unwrap();
        z.write_all(b"Wheel-Version: 1.0\nGenerator: test\nRoot-Is-Purelib: true\nTag: py3-none-any\n")
            .unwrap();
        z.start_file(format!("{name}-{version}.dist-info/METADATA"), opts)
            .unwrap();
        let mut metadata = format!("Metadata-Version: 2.1\nName: {name}\nVersion: {version}\n");
        for req in requires_dist {
            metadata.push_str(&format!("Requires-Dist: {req}\n"));
        }
        if let Some(rp) = requires_python {
            metadata.push_str(&format!("Requires-Python: {rp}\n"));
        }
        z.write_all(metadata.as_bytes()).unwrap();
        z.finish().unwrap();
    }
    buf
}

/// One release worth of index state: a wheel plus its listing metadata.
pub struct FakeRelease {
    pub name: &'static str,
    pub version: &'static str,
    pub requires_dist: Vec<&'static str>,
    pub requires_python: Option<&'static str>,
    /// whether requires-python also appears as a data attribute on the index
    /// page (as opposed to living only in METADATA)
    pub advertise_python: bool,
    pub yanked: bool,
}

impl FakeRelease {
    pub fn new(name: &'static str, version: &'static str) -> FakeRelease {
        FakeRelease {
            name,
            version,
            requires_dist: vec![],
            requires_python: None,
            advertise_python: true,
            yanked: false,
        }
    }

    pub fn requires(mut self, reqs: &[&'static str]) -> FakeRelease {
        self.requires_dist = reqs.to_vec();
        self
    }

    pub fn python(mut self, range: &'static str) -> FakeRelease {
        self.requires_python = Some(range);
        self
    }

    pub fn python_in_metadata_only(mut self) -> FakeRelease {
        self.advertise_python = false;
        self
    }
}

/// Lay a set of releases out as a PEP 503 index and spin up a server for it.
pub fn fake_index(releases: &[FakeRelease]) -> StaticServer {
    let mut pages: HashMap<String, Page> = HashMap::new();
    let mut listings: HashMap<&str, String> = HashMap::new();

    for release in releases {
        let wheel = wheel_bytes(
            release.name,
            release.version,
            &release.requires_dist,
            release.requires_python,
        );
        let hash = ArtifactHash::sha256_of(&wheel);
        let filename = format!(
            "{}-{}-py3-none-any.whl",
            release.name, release.version
        );
        let mut attrs = String::new();
        if let (Some(rp), true) = (release.requires_python, release.advertise_python) {
            attrs.push_str(&format!(
                " data-requires-python=\"{}\"",
                rp.replace('<', "&lt;").replace('>', "&gt;")
            ));
        }
        if release.yanked {
            attrs.push_str(" data-yanked=\"\"");
        }
        listings.entry(release.name).or_default().push_str(&format!(
            "<a href=\"/files/{filename}#{hash}\"{attrs}>{filename}</a>\n"
        ));
        pages.insert(
            format!("/files/{filename}"),
            Page {
                content_type: "application/octet-stream",
                body: wheel,
            },
        );
    }

    for (name, links) in listings {
        pages.insert(
            format!("/simple/{name}/"),
            Page {
                content_type: "text/html",
                body: format!("<html><body>\n{links}</body></html>\n").into_bytes(),
            },
        );
    }

    StaticServer::serve(pages)
}
