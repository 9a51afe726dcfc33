//! HTTP/1.x proxy request heads.

use std::fmt::Write as _;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use url::{Host, Url};

use crate::error::{Error, Result};

pub const MAX_HEAD_BYTES: usize = 32 * 1024;
pub const MAX_HEADERS: usize = 64;

const DEFAULT_PORT: u16 = 80;

/// A parsed request head. Any body bytes are left unread in the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRequest {
    method: String,
    target: String,
    version: u8,
    headers: Vec<(String, String)>,
    host: String,
    port: u16,
    origin_form: String,
}

impl HttpRequest {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The request target exactly as sent on the request line.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Minor HTTP version (`0` for HTTP/1.0, `1` for HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Destination host taken from the request target; empty when the target
    /// carries no authority (origin-form requests such as `GET /`).
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path and query of the target, as forwarded to the destination.
    pub fn origin_form(&self) -> &str {
        &self.origin_form
    }

    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    /// First value of header `name`, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Whether the client sent `Proxy-Connection: keep-alive`.
    pub fn wants_keep_alive(&self) -> bool {
        self.header("Proxy-Connection")
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("keep-alive"))
    }

    /// Re-encodes the head with the given target and header list.
    pub(crate) fn encode_head<'a>(
        &self,
        target: &str,
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Vec<u8> {
        let mut head = format!("{} {} HTTP/1.{}\r\n", self.method, target, self.version);
        for (name, value) in headers {
            let _ = write!(head, "{name}: {value}\r\n");
        }
        head.push_str("\r\n");
        head.into_bytes()
    }
}

/// Reads one request head off `reader`.
///
/// Leading blank lines are skipped. Fails on EOF, on heads larger than
/// [`MAX_HEAD_BYTES`] or with more than [`MAX_HEADERS`] fields, and on
/// targets that are not valid URIs.
pub async fn read_request<R>(reader: &mut R) -> Result<HttpRequest>
where
    R: AsyncBufRead + Unpin,
{
    let head = read_head(reader).await?;
    parse_head(&head)
}

async fn read_head<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    loop {
        let start = head.len();
        let limit = (MAX_HEAD_BYTES + 1).saturating_sub(start) as u64;
        let n = (&mut *reader).take(limit).read_until(b'\n', &mut head).await?;
        if n == 0 {
            return Err(Error::malformed("connection closed before end of request head"));
        }

        let line = &head[start..];
        if !line.ends_with(b"\n") {
            if head.len() > MAX_HEAD_BYTES {
                return Err(Error::malformed("request head too large"));
            }
            return Err(Error::malformed("connection closed before end of request head"));
        }
        if line == b"\r\n" || line == b"\n" {
            if start == 0 {
                head.clear();
                continue;
            }
            return Ok(head);
        }
        if head.len() > MAX_HEAD_BYTES {
            return Err(Error::malformed("request head too large"));
        }
    }
}

fn parse_head(head: &[u8]) -> Result<HttpRequest> {
    let mut fields = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut fields);
    match req.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(Error::malformed("incomplete request head")),
        Err(e) => return Err(Error::malformed(format!("invalid request head: {e}"))),
    }

    let method = req
        .method
        .ok_or_else(|| Error::malformed("missing method"))?
        .to_string();
    let target = req
        .path
        .ok_or_else(|| Error::malformed("missing request target"))?
        .to_string();
    let version = req.version.ok_or_else(|| Error::malformed("missing version"))?;
    let headers = req
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect();

    let destination = resolve_destination(&method, &target)?;

    Ok(HttpRequest {
        method,
        target,
        version,
        headers,
        host: destination.host,
        port: destination.port,
        origin_form: destination.origin_form,
    })
}

struct Destination {
    host: String,
    port: u16,
    origin_form: String,
}

impl Destination {
    fn none(origin_form: &str) -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            origin_form: origin_form.to_string(),
        }
    }
}

/// CONNECT targets are authority-form (`host:port`); everything else needs an
/// absolute URI to name a destination.
fn resolve_destination(method: &str, target: &str) -> Result<Destination> {
    if target.starts_with('/') || target == "*" {
        return Ok(Destination::none(target));
    }
    if method != "CONNECT" && !has_authority(target) {
        return Ok(Destination::none(target));
    }

    let url = if method == "CONNECT" {
        Url::parse(&format!("http://{target}"))
    } else {
        Url::parse(target)
    }
    .map_err(|e| Error::malformed(format!("invalid request target {target:?}: {e}")))?;

    let host = match url.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
        None => String::new(),
    };

    let mut origin_form = url.path().to_string();
    if let Some(query) = url.query() {
        origin_form.push('?');
        origin_form.push_str(query);
    }

    Ok(Destination {
        host,
        port: url.port_or_known_default().unwrap_or(DEFAULT_PORT),
        origin_form,
    })
}

/// Whether an absolute URI carries a non-empty `//authority` after its scheme.
/// `http:///path` and `http:path` name no host.
fn has_authority(target: &str) -> bool {
    let Some((_, rest)) = target.split_once(':') else {
        return false;
    };
    let Some(after) = rest.strip_prefix("//") else {
        return false;
    };
    let end = after.find(['/', '?', '#']).unwrap_or(after.len());
    !after[..end].is_empty()
}
