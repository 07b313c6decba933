//! Wire encoding of forwarded requests and decoding of backend responses.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{ProxyError, Upstream};
use crate::http::{Headers, Method, Request, Response, StatusCode};
use crate::ratelimit::FORWARDED_FOR_HEADER;

/// Headers that describe a single hop and are never relayed.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Maximum number of headers accepted in a backend response.
const MAX_RESPONSE_HEADERS: usize = 100;

// Hop-by-hop names, plus any the message nominates in its own `Connection` header.
fn hop_by_hop_names(headers: &Headers) -> Vec<String> {
    let mut names: Vec<String> = HOP_BY_HOP.iter().map(|s| (*s).to_owned()).collect();
    for value in headers.get_all("connection") {
        names.extend(
            value
                .split(',')
                .map(|token| token.trim().to_ascii_lowercase())
                .filter(|token| !token.is_empty()),
        );
    }
    names
}

fn is_listed(names: &[String], name: &str) -> bool {
    names.iter().any(|n| n.eq_ignore_ascii_case(name))
}

fn put_header(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put(name.as_bytes());
    buf.put(&b": "[..]);
    buf.put(value.as_bytes());
    buf.put(&b"\r\n"[..]);
}

/// Serializes `request` for the backend.
///
/// `Host` is rewritten to the upstream authority, hop-by-hop headers are
/// dropped, the peer IP is appended to `X-Forwarded-For`, and the
/// connection is marked `close` so the backend ends the exchange.
pub(crate) fn encode_request(upstream: &Upstream, request: &Request) -> BytesMut {
    let body = request.body();
    let mut buf = BytesMut::with_capacity(256 + request.headers().len() * 48 + body.len());

    buf.put(request.method().as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put(upstream.join_path(request.path()).as_bytes());
    if let Some(query) = request.query_string() {
        buf.put_u8(b'?');
        buf.put(query.as_bytes());
    }
    buf.put(&b" HTTP/1.1\r\n"[..]);

    put_header(&mut buf, "Host", &upstream.authority());

    let skip = hop_by_hop_names(request.headers());
    let mut forwarded_for: Vec<&str> = Vec::new();
    for (name, value) in request.headers().iter() {
        if name.eq_ignore_ascii_case(FORWARDED_FOR_HEADER) {
            forwarded_for.push(value);
            continue;
        }
        if name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
            || is_listed(&skip, name)
        {
            continue;
        }
        put_header(&mut buf, name, value);
    }

    let peer_ip = request.peer_addr().map(|addr| addr.ip().to_string());
    if let Some(ip) = peer_ip.as_deref() {
        forwarded_for.push(ip);
    }
    if !forwarded_for.is_empty() {
        put_header(&mut buf, FORWARDED_FOR_HEADER, &forwarded_for.join(", "));
    }

    let expects_body = matches!(request.method(), Method::Post | Method::Put | Method::Patch);
    if !body.is_empty() || expects_body {
        put_header(&mut buf, "Content-Length", &body.len().to_string());
    }
    put_header(&mut buf, "Connection", "close");
    buf.put(&b"\r\n"[..]);
    buf.put(body.as_ref());

    buf
}

/// How the body of a decoded response head is delimited.
#[derive(Debug)]
enum Framing {
    Empty,
    Length(usize),
    Chunked { body: BytesMut, in_trailers: bool },
    UntilEof,
}

#[derive(Debug)]
struct Head {
    status: StatusCode,
    headers: Headers,
    framing: Framing,
}

/// Incremental decoder for one backend response.
///
/// Feed it the connection's read buffer after every read. The status line
/// and headers are parsed once; after that, completed body bytes are taken
/// out of the buffer so each byte is examined a bounded number of times no
/// matter how many reads the body spans.
#[derive(Debug)]
pub(crate) struct ResponseDecoder {
    bodyless: bool,
    head: Option<Head>,
}

impl ResponseDecoder {
    /// `bodyless` is set for replies to `HEAD`.
    pub(crate) fn new(bodyless: bool) -> Self {
        Self { bodyless, head: None }
    }

    /// Returns `Ok(None)` while more bytes are needed.
    ///
    /// `eof` tells the decoder the backend has closed the connection, which
    /// terminates a body that has neither a length nor chunked framing.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut, eof: bool) -> Result<Option<Response>, ProxyError> {
        if self.head.is_none() {
            match decode_head(buf, self.bodyless)? {
                Some(head) => self.head = Some(head),
                None if eof => {
                    return Err(ProxyError::MalformedResponse(
                        "connection closed before response headers".into(),
                    ));
                }
                None => return Ok(None),
            }
        }
        let Some(head) = self.head.as_mut() else {
            return Ok(None);
        };

        let body = match &mut head.framing {
            Framing::Empty => Bytes::new(),
            Framing::Length(length) => {
                let length = *length;
                if buf.len() < length {
                    if eof {
                        return Err(ProxyError::MalformedResponse(format!(
                            "connection closed after {} of {length} body bytes",
                            buf.len()
                        )));
                    }
                    return Ok(None);
                }
                buf.split_to(length).freeze()
            }
            Framing::Chunked { body, in_trailers } => {
                if !decode_chunks(buf, body, in_trailers)? {
                    if eof {
                        return Err(ProxyError::MalformedResponse(
                            "connection closed inside chunked body".into(),
                        ));
                    }
                    return Ok(None);
                }
                std::mem::take(body).freeze()
            }
            Framing::UntilEof if eof => buf.split().freeze(),
            Framing::UntilEof => return Ok(None),
        };

        match self.head.take() {
            Some(head) => Ok(Some(Response::from_parts(head.status, head.headers, body))),
            None => Ok(None),
        }
    }
}

// Parses the status line and headers, consuming them from `buf` once complete.
fn decode_head(buf: &mut BytesMut, bodyless: bool) -> Result<Option<Head>, ProxyError> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut raw = httparse::Response::new(&mut raw_headers);

    let body_offset = match raw.parse(&buf[..]) {
        Ok(httparse::Status::Complete(offset)) => offset,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(ProxyError::MalformedResponse(e.to_string())),
    };

    let code = raw
        .code
        .ok_or_else(|| ProxyError::MalformedResponse("missing status code".into()))?;
    let status = StatusCode::from_u16(code)
        .ok_or_else(|| ProxyError::MalformedResponse(format!("status code {code} out of range")))?;

    let mut all = Headers::with_capacity(raw.headers.len());
    for header in raw.headers.iter() {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| ProxyError::MalformedResponse(format!("non-UTF-8 value in header {}", header.name)))?;
        all.insert(header.name, value);
    }

    let no_body = bodyless || code < 200 || code == 204 || code == 304;
    let chunked = all
        .get_all("transfer-encoding")
        .any(|v| v.to_ascii_lowercase().contains("chunked"));

    let framing = if no_body {
        Framing::Empty
    } else if chunked {
        Framing::Chunked {
            body: BytesMut::new(),
            in_trailers: false,
        }
    } else if let Some(length) = all.get("content-length") {
        let length: usize = length
            .trim()
            .parse()
            .map_err(|_| ProxyError::MalformedResponse(format!("invalid Content-Length {length:?}")))?;
        Framing::Length(length)
    } else {
        Framing::UntilEof
    };

    let skip = hop_by_hop_names(&all);
    let mut headers = Headers::with_capacity(all.len());
    for (name, value) in all.iter() {
        if name.eq_ignore_ascii_case("content-length") || is_listed(&skip, name) {
            continue;
        }
        headers.insert(name, value);
    }

    buf.advance(body_offset);
    Ok(Some(Head {
        status,
        headers,
        framing,
    }))
}

/// Moves every complete chunk from `buf` into `body`.
///
/// Returns `true` once the terminating chunk and trailer section have been
/// consumed. A chunk is only taken once all of its data and its CRLF are
/// buffered.
fn decode_chunks(buf: &mut BytesMut, body: &mut BytesMut, in_trailers: &mut bool) -> Result<bool, ProxyError> {
    loop {
        if *in_trailers {
            // Trailer section, ended by an empty line.
            let Some(end) = buf.windows(2).position(|w| w == b"\r\n") else {
                return Ok(false);
            };
            buf.advance(end + 2);
            if end == 0 {
                return Ok(true);
            }
            continue;
        }

        let (consumed, size) = match httparse::parse_chunk_size(&buf[..]) {
            Ok(httparse::Status::Complete(pair)) => pair,
            Ok(httparse::Status::Partial) => return Ok(false),
            Err(_) => return Err(ProxyError::InvalidChunk),
        };

        if size == 0 {
            buf.advance(consumed);
            *in_trailers = true;
            continue;
        }

        let size = usize::try_from(size).map_err(|_| ProxyError::InvalidChunk)?;
        let needed = consumed
            .checked_add(size)
            .and_then(|n| n.checked_add(2))
            .ok_or(ProxyError::InvalidChunk)?;
        if buf.len() < needed {
            return Ok(false);
        }
        buf.advance(consumed);
        let data = buf.split_to(size);
        if &buf[..2] != b"\r\n" {
            return Err(ProxyError::InvalidChunk);
        }
        buf.advance(2);
        body.extend_from_slice(&data);
    }
}
