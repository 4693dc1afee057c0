use memchr::memmem::Finder;

// Request head parsing only. Bodies are exposed as raw bytes; nothing here
// understands chunking or pipelining.

pub const MAX_HEADERS: usize = 32;

thread_local! {
    static HEAD_END: Finder<'static> = Finder::new(b"\r\n\r\n");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
}

impl HttpMethod {
    pub fn parse(token: &[u8]) -> Option<HttpMethod> {
        Some(match token {
            b"GET" => HttpMethod::Get,
            b"POST" => HttpMethod::Post,
            b"PUT" => HttpMethod::Put,
            b"DELETE" => HttpMethod::Delete,
            b"HEAD" => HttpMethod::Head,
            b"OPTIONS" => HttpMethod::Options,
            b"PATCH" => HttpMethod::Patch,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Patch => "PATCH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn parse(token: &[u8]) -> Option<HttpVersion> {
        match token {
            b"HTTP/1.0" => Some(HttpVersion::Http10),
            b"HTTP/1.1" => Some(HttpVersion::Http11),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HttpHeader<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
}

#[derive(Debug, Clone)]
pub struct HttpRequest<'a> {
    pub method: HttpMethod,
    pub path: &'a [u8],
    pub version: HttpVersion,
    headers: [HttpHeader<'a>; MAX_HEADERS],
    header_count: usize,
    pub body: &'a [u8],
}

impl<'a> HttpRequest<'a> {
    pub fn headers(&self) -> &[HttpHeader<'a>] {
        &self.headers[..self.header_count]
    }

    /// First header named `key`, compared case-insensitively.
    pub fn header(&self, key: &[u8]) -> Option<&'a [u8]> {
        self.headers()
            .iter()
            .find(|h| h.key.eq_ignore_ascii_case(key))
            .map(|h| h.value)
    }
}

/// Parses `METHOD PATH VERSION\r\n` followed by `Key: value\r\n` lines up to the
/// blank line. Headers past [`MAX_HEADERS`] are dropped.
pub fn parse_request(buffer: &[u8]) -> Option<HttpRequest<'_>> {
    let head_end = HEAD_END.with(|f| f.find(buffer))?;
    let head = &buffer[..head_end];
    let body = &buffer[head_end + 4..];

    let line_end = memchr::memmem::find(head, b"\r\n").unwrap_or(head.len());
    let (method, path, version) = parse_request_line(&head[..line_end])?;

    let mut headers = [HttpHeader::default(); MAX_HEADERS];
    let mut header_count = 0;
    let mut rest = if line_end < head.len() { &head[line_end + 2..] } else { &[][..] };
    while !rest.is_empty() {
        let end = memchr::memmem::find(rest, b"\r\n").unwrap_or(rest.len());
        let line = &rest[..end];
        rest = if end < rest.len() { &rest[end + 2..] } else { &[][..] };

        let colon = memchr::memchr(b':', line)?;
        if header_count == MAX_HEADERS {
            continue;
        }
        headers[header_count] = HttpHeader {
            key: &line[..colon],
            value: line[colon + 1..].trim_ascii_start(),
        };
        header_count += 1;
    }

    Some(HttpRequest {
        method,
        path,
        version,
        headers,
        header_count,
        body,
    })
}

fn parse_request_line(line: &[u8]) -> Option<(HttpMethod, &[u8], HttpVersion)> {
    let space1 = memchr::memchr(b' ', line)?;
    let method = HttpMethod::parse(&line[..space1])?;
    let rest = &line[space1 + 1..];
    let space2 = memchr::memchr(b' ', rest)?;
    let path = &rest[..space2];
    let version = HttpVersion::parse(&rest[space2 + 1..])?;
    Some((method, path, version))
}
