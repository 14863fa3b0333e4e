//! Just enough HTTP/1.x to carry one request and one response per echo
//! exchange.

use std::io::{self, BufRead, BufReader, Read};

use thiserror::Error;

/// Cap on request line plus headers.
pub const MAX_HEAD: usize = 64 * 1024;

const DEFAULT_PORT: u16 = 80;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("read request: {0}")]
    Io(#[from] io::Error),

    #[error("bad request: {0}")]
    Malformed(String),

    #[error("request head exceeds {} bytes", MAX_HEAD)]
    HeadTooLarge,

    #[error("chunked request bodies are not supported")]
    LengthRequired,

    #[error("request body of {size} bytes exceeds the {limit} byte limit")]
    BodyTooLarge { size: u64, limit: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// Reads one request. `Ok(None)` when the stream ends before any byte.
    ///
    /// A declared body longer than `body_limit` is refused before it is read.
    pub fn read_from<R: BufRead>(
        r: &mut R,
        body_limit: usize,
    ) -> Result<Option<Request>, HttpError> {
        let mut head_len = 0usize;
        let Some(start) = read_line(r, &mut head_len)? else {
            return Ok(None);
        };

        let mut parts = start.split_whitespace();
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(HttpError::Malformed(format!("request line {start:?}")));
        };
        if !version.starts_with("HTTP/1.") {
            return Err(HttpError::Malformed(format!("version {version}")));
        }

        let mut headers = Vec::new();
        loop {
            let line = read_line(r, &mut head_len)?
                .ok_or_else(|| HttpError::Malformed("stream ended inside headers".into()))?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HttpError::Malformed(format!("header line {line:?}")))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let mut req = Request {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers,
            body: Vec::new(),
        };

        if req.header("transfer-encoding").is_some() {
            return Err(HttpError::LengthRequired);
        }
        if let Some(len) = req.header("content-length") {
            let len: u64 = len
                .parse()
                .map_err(|_| HttpError::Malformed(format!("content-length {len:?}")))?;
            if len > body_limit as u64 {
                return Err(HttpError::BodyTooLarge {
                    size: len,
                    limit: body_limit,
                });
            }
            req.body = vec![0u8; len as usize];
            r.read_exact(&mut req.body)?;
        }

        Ok(Some(req))
    }

    /// Parses a request carried whole inside `bytes`.
    pub fn parse(bytes: &[u8], body_limit: usize) -> Result<Request, HttpError> {
        let mut r = BufReader::new(bytes);
        Request::read_from(&mut r, body_limit)?
            .ok_or_else(|| HttpError::Malformed("empty request".into()))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// `host:port` this request is aimed at, from the CONNECT target, an
    /// absolute URI, or the Host header, in that order.
    pub fn authority(&self) -> Option<String> {
        let host = if self.is_connect() {
            self.target.as_str()
        } else if let Some((authority, _)) = split_absolute(&self.target) {
            authority
        } else {
            self.header("host")?
        };
        if host.is_empty() {
            return None;
        }
        Some(with_port(host))
    }

    /// Serialized as received, in proxy form.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.serialize(&self.target, &self.headers)
    }

    /// Serialized for the origin server: path-only target and a single
    /// request per connection.
    pub fn to_origin_bytes(&self) -> Vec<u8> {
        let path = match split_absolute(&self.target) {
            Some((_, "")) => "/",
            Some((_, path)) => path,
            None => self.target.as_str(),
        };

        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .filter(|(k, _)| {
                !k.eq_ignore_ascii_case("connection") && !k.eq_ignore_ascii_case("proxy-connection")
            })
            .cloned()
            .collect();
        if self.header("host").is_none() {
            if let Some((authority, _)) = split_absolute(&self.target) {
                headers.push(("Host".into(), authority.into()));
            }
        }
        headers.push(("Connection".into(), "close".into()));

        self.serialize(path, &headers)
    }

    fn serialize(&self, target: &str, headers: &[(String, String)]) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, target, self.version).into_bytes();
        for (k, v) in headers {
            out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

fn read_line<R: BufRead>(r: &mut R, head_len: &mut usize) -> Result<Option<String>, HttpError> {
    let mut line = Vec::new();
    let n = r
        .by_ref()
        .take((MAX_HEAD - *head_len) as u64 + 1)
        .read_until(b'\n', &mut line)?;
    if n == 0 {
        return Ok(None);
    }
    *head_len += n;
    if *head_len > MAX_HEAD {
        return Err(HttpError::HeadTooLarge);
    }
    if line.last() != Some(&b'\n') {
        return Err(HttpError::Malformed("truncated line".into()));
    }
    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| HttpError::Malformed("non utf-8 header".into()))
}

/// `http://authority/path` -> (authority, /path)
fn split_absolute(target: &str) -> Option<(&str, &str)> {
    let rest = target.strip_prefix("http://")?;
    Some(match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    })
}

fn with_port(host: &str) -> String {
    let has_port = match host.rsplit_once(':') {
        Some((h, port)) => !h.is_empty() && !host.ends_with(']') && port.parse::<u16>().is_ok(),
        None => false,
    };
    if has_port {
        host.to_string()
    } else {
        format!("{host}:{DEFAULT_PORT}")
    }
}

/// Status code of a serialized response, if it starts with a valid HTTP/1.x
/// status line.
pub fn status_code(response: &[u8]) -> Option<u16> {
    let end = response.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&response[..end]).ok()?;
    let mut parts = line.splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        return None;
    }
    let code = parts.next()?;
    if code.len() != 3 {
        return None;
    }
    code.parse().ok().filter(|c| (100..600).contains(c))
}

/// Complete response with a plain-text body; the connection closes after it.
pub fn simple_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1472;

    #[test]
    fn reads_proxy_request_with_body() {
        let raw = b"POST http://example.com:8080/submit?q=1 HTTP/1.1\r\n\
                    Host: example.com:8080\r\n\
                    Content-Length: 5\r\n\
                    Proxy-Connection: keep-alive\r\n\
                    \r\n\
                    hello";
        let req = Request::parse(raw, LIMIT).unwrap();

        assert_eq!(req.method, "POST");
        assert_eq!(req.body, b"hello");
        assert_eq!(req.authority().unwrap(), "example.com:8080");
        assert_eq!(req.to_bytes(), raw.to_vec());

        let origin = String::from_utf8(req.to_origin_bytes()).unwrap();
        assert!(origin.starts_with("POST /submit?q=1 HTTP/1.1\r\n"));
        assert!(origin.contains("Connection: close\r\n"));
        assert!(!origin.contains("Proxy-Connection"));
        assert!(origin.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn authority_defaults_port() {
        let req = Request::parse(b"GET http://example.com HTTP/1.1\r\n\r\n", LIMIT).unwrap();
        assert_eq!(req.authority().unwrap(), "example.com:80");

        let origin = String::from_utf8(req.to_origin_bytes()).unwrap();
        assert!(origin.starts_with("GET / HTTP/1.1\r\n"));
        assert!(origin.contains("Host: example.com\r\n"));

        let req = Request::parse(b"GET /x HTTP/1.0\r\nhost: [::1]\r\n\r\n", LIMIT).unwrap();
        assert_eq!(req.authority().unwrap(), "[::1]:80");
    }

    #[test]
    fn connect_target_is_authority() {
        let req = Request::parse(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n", LIMIT).unwrap();
        assert!(req.is_connect());
        assert_eq!(req.authority().unwrap(), "example.com:443");
    }

    #[test]
    fn empty_stream_is_none() {
        let mut r = BufReader::new(&b""[..]);
        assert!(Request::read_from(&mut r, LIMIT).unwrap().is_none());
    }

    #[test]
    fn rejects_bad_requests() {
        assert!(matches!(
            Request::parse(b"GARBAGE\r\n\r\n", LIMIT),
            Err(HttpError::Malformed(_))
        ));
        assert!(matches!(
            Request::parse(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n", LIMIT),
            Err(HttpError::LengthRequired)
        ));
        assert!(matches!(
            Request::parse(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort", LIMIT),
            Err(HttpError::Io(_))
        ));

        let mut huge = b"GET / HTTP/1.1\r\nX-Fill: ".to_vec();
        huge.extend(std::iter::repeat(b'a').take(MAX_HEAD));
        huge.extend_from_slice(b"\r\n\r\n");
        assert!(matches!(Request::parse(&huge, LIMIT), Err(HttpError::HeadTooLarge)));
    }

    #[test]
    fn declared_body_above_limit_is_refused_before_reading() {
        for declared in ["18446744073709551615", "70000000000000"] {
            let raw = format!("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: {declared}\r\n\r\nx");
            match Request::parse(raw.as_bytes(), LIMIT) {
                Err(HttpError::BodyTooLarge { size, limit }) => {
                    assert_eq!(size.to_string(), declared);
                    assert_eq!(limit, LIMIT);
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        // too big for a u64 at all
        assert!(matches!(
            Request::parse(b"POST / HTTP/1.1\r\nContent-Length: 99999999999999999999\r\n\r\n", LIMIT),
            Err(HttpError::Malformed(_))
        ));
    }

    #[test]
    fn body_limit_is_inclusive() {
        let at = b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nabcd";
        assert_eq!(Request::parse(at, 4).unwrap().body, b"abcd");

        let over = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nabcde";
        assert!(matches!(
            Request::parse(over, 4),
            Err(HttpError::BodyTooLarge { size: 5, limit: 4 })
        ));
    }

    #[test]
    fn status_line() {
        assert_eq!(status_code(b"HTTP/1.1 200 OK\r\n\r\n"), Some(200));
        assert_eq!(status_code(b"HTTP/1.0 404 Not Found\r\nX: y\r\n\r\n"), Some(404));
        assert_eq!(status_code(b"HTTP/1.1 204\r\n\r\n"), Some(204));
        assert_eq!(status_code(b"SSH-2.0-OpenSSH\r\n"), None);
        assert_eq!(status_code(b"HTTP/1.1 2000 OK\r\n"), None);
        assert_eq!(status_code(b"HTTP/1.1 200 OK"), None);
    }

    #[test]
    fn simple_response_is_parseable() {
        let resp = simple_response(504, "Gateway Timeout", "no reply");
        assert_eq!(status_code(&resp), Some(504));
        assert!(resp.ends_with(b"\r\n\r\nno reply"));
    }
}
