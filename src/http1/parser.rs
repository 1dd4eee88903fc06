use bytes::Bytes;
use http::StatusCode;
use httparse::Status;

use crate::error::CodecError;
use crate::headers::HeaderMap;
use crate::proto::Protocol;

// httparse needs the header array sized up front; one extra slot lets us
// tell "exactly at the limit" apart from "over it"
const HEADER_SLOTS: usize = 256;

/// a fully parsed request or response head
#[derive(Debug)]
pub struct ParsedHead {
    pub protocol: Protocol,
    pub method: Option<String>,
    pub target: Option<String>,
    pub status: Option<u16>,
    pub headers: HeaderMap,
}

/// outcome of a head parse attempt over accumulated bytes
#[derive(Debug)]
pub enum HeadParse {
    /// not enough bytes yet
    Incomplete,
    /// head finished, `consumed` bytes belong to it
    Complete { consumed: usize, head: ParsedHead },
}

/// outcome of scanning for a chunk header
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkParse {
    Incomplete,
    Complete { consumed: usize, size: u64 },
}

/// limits applied while heads accumulate
#[derive(Debug, Clone, Copy)]
pub struct HeadLimits {
    pub max_bytes: usize,
    pub max_count: usize,
}

fn too_large() -> CodecError {
    CodecError::protocol_with_code(
        "headers-too-large",
        StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
    )
}

/// parse a request head out of `buf`
///
/// the buffer holds everything received so far for this head; partial
/// input parses again from the start next time more bytes arrive, the way
/// the session readers retry `httparse` on growth.
pub fn parse_request_head(buf: &[u8], limits: HeadLimits) -> Result<HeadParse, CodecError> {
    let mut headers = [httparse::EMPTY_HEADER; HEADER_SLOTS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(buf) {
        Ok(Status::Complete(consumed)) => {
            check_head_limits(consumed, request.headers.len(), limits)?;
            let protocol = version_from(request.version)?;
            let head = ParsedHead {
                protocol,
                method: request.method.map(str::to_string),
                target: request.path.map(str::to_string),
                status: None,
                headers: collect_headers(request.headers)?,
            };
            Ok(HeadParse::Complete { consumed, head })
        }
        Ok(Status::Partial) => {
            if buf.len() > limits.max_bytes {
                return Err(too_large());
            }
            Ok(HeadParse::Incomplete)
        }
        Err(httparse::Error::TooManyHeaders) => Err(too_large()),
        Err(e) => {
            tracing::debug!(error = %e, "request head parse failure");
            Err(CodecError::protocol("invalid-request-head"))
        }
    }
}

/// parse a response head out of `buf`
pub fn parse_response_head(buf: &[u8], limits: HeadLimits) -> Result<HeadParse, CodecError> {
    let mut headers = [httparse::EMPTY_HEADER; HEADER_SLOTS];
    let mut response = httparse::Response::new(&mut headers);
    let mut config = httparse::ParserConfig::default();
    config.allow_spaces_after_header_name_in_responses(true);
    config.allow_obsolete_multiline_headers_in_responses(true);
    match config.parse_response(&mut response, buf) {
        Ok(Status::Complete(consumed)) => {
            check_head_limits(consumed, response.headers.len(), limits)?;
            let protocol = version_from(response.version)?;
            let head = ParsedHead {
                protocol,
                method: None,
                target: None,
                status: response.code,
                headers: collect_headers(response.headers)?,
            };
            Ok(HeadParse::Complete { consumed, head })
        }
        Ok(Status::Partial) => {
            if buf.len() > limits.max_bytes {
                return Err(too_large());
            }
            Ok(HeadParse::Incomplete)
        }
        Err(httparse::Error::TooManyHeaders) => Err(too_large()),
        Err(e) => {
            tracing::debug!(error = %e, "response head parse failure");
            Err(CodecError::protocol("invalid-response-head"))
        }
    }
}

/// parse a chunked-body trailer section (terminated by an empty line)
pub fn parse_trailers(buf: &[u8], limits: HeadLimits) -> Result<HeadParse, CodecError> {
    let mut headers = [httparse::EMPTY_HEADER; HEADER_SLOTS];
    match httparse::parse_headers(buf, &mut headers) {
        Ok(Status::Complete((consumed, parsed))) => {
            check_head_limits(consumed, parsed.len(), limits)?;
            let head = ParsedHead {
                protocol: Protocol::Http11,
                method: None,
                target: None,
                status: None,
                headers: collect_headers(parsed)?,
            };
            Ok(HeadParse::Complete { consumed, head })
        }
        Ok(Status::Partial) => {
            if buf.len() > limits.max_bytes {
                return Err(too_large());
            }
            Ok(HeadParse::Incomplete)
        }
        Err(httparse::Error::TooManyHeaders) => Err(too_large()),
        Err(e) => {
            tracing::debug!(error = %e, "trailer parse failure");
            Err(CodecError::protocol("invalid-trailers"))
        }
    }
}

/// scan a chunk-size line, `consumed` covers up to and including its CRLF
pub fn parse_chunk_header(buf: &[u8]) -> Result<ChunkParse, CodecError> {
    match httparse::parse_chunk_size(buf) {
        Ok(Status::Complete((consumed, size))) => Ok(ChunkParse::Complete { consumed, size }),
        Ok(Status::Partial) => Ok(ChunkParse::Incomplete),
        Err(_) => Err(CodecError::protocol("invalid-chunk-header")),
    }
}

fn check_head_limits(
    consumed: usize,
    count: usize,
    limits: HeadLimits,
) -> Result<(), CodecError> {
    if consumed > limits.max_bytes || count > limits.max_count {
        return Err(too_large());
    }
    Ok(())
}

fn version_from(version: Option<u8>) -> Result<Protocol, CodecError> {
    match version {
        Some(0) => Ok(Protocol::Http10),
        Some(1) => Ok(Protocol::Http11),
        _ => Err(CodecError::protocol("unsupported-http-version")),
    }
}

// field names are lower-cased and values right-trimmed as they enter the
// map, so everything downstream sees one spelling
fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap, CodecError> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for header in parsed {
        if header.name.is_empty() {
            continue;
        }
        let name = header.name.to_ascii_lowercase();
        let value = trim_value(header.value);
        headers.append(name, Bytes::copy_from_slice(value));
    }
    Ok(headers)
}

fn trim_value(value: &[u8]) -> &[u8] {
    let mut end = value.len();
    while end > 0 && (value[end - 1] == b' ' || value[end - 1] == b'\t') {
        end -= 1;
    }
    let mut start = 0;
    while start < end && (value[start] == b' ' || value[start] == b'\t') {
        start += 1;
    }
    &value[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> HeadLimits {
        HeadLimits {
            max_bytes: 60 * 1024,
            max_count: 100,
        }
    }

    #[test]
    fn request_head_roundtrip() {
        let buf = b"GET /x?a=1 HTTP/1.1\r\nHost: a\r\nX-Test: v \r\n\r\nrest";
        match parse_request_head(buf, limits()).unwrap() {
            HeadParse::Complete { consumed, head } => {
                assert_eq!(&buf[consumed..], b"rest");
                assert_eq!(head.method.as_deref(), Some("GET"));
                assert_eq!(head.target.as_deref(), Some("/x?a=1"));
                assert_eq!(head.protocol, Protocol::Http11);
                assert_eq!(head.headers.get("host"), Some(b"a".as_ref()));
                // trailing space trimmed
                assert_eq!(head.headers.get("x-test"), Some(b"v".as_ref()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn partial_head() {
        let buf = b"GET / HTTP/1.1\r\nHost: a";
        assert!(matches!(
            parse_request_head(buf, limits()).unwrap(),
            HeadParse::Incomplete
        ));
    }

    #[test]
    fn oversized_head_rejected() {
        let buf = b"GET / HTTP/1.1\r\nHost: a";
        let tight = HeadLimits {
            max_bytes: 4,
            max_count: 100,
        };
        assert!(parse_request_head(buf, tight).is_err());
    }

    #[test]
    fn header_count_limit() {
        let mut buf = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..5 {
            buf.extend_from_slice(format!("x-h{}: v\r\n", i).as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
        let tight = HeadLimits {
            max_bytes: 60 * 1024,
            max_count: 3,
        };
        assert!(parse_request_head(&buf, tight).is_err());
    }

    #[test]
    fn response_head() {
        let buf = b"HTTP/1.0 204 No Content\r\n\r\n";
        match parse_response_head(buf, limits()).unwrap() {
            HeadParse::Complete { head, .. } => {
                assert_eq!(head.status, Some(204));
                assert_eq!(head.protocol, Protocol::Http10);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn chunk_header() {
        assert_eq!(
            parse_chunk_header(b"5\r\nhello").unwrap(),
            ChunkParse::Complete {
                consumed: 3,
                size: 5
            }
        );
        assert_eq!(parse_chunk_header(b"5").unwrap(), ChunkParse::Incomplete);
        assert!(parse_chunk_header(b"zz\r\n").is_err());
    }

    #[test]
    fn trailer_section() {
        let buf = b"x-check: ok\r\n\r\n";
        match parse_trailers(buf, limits()).unwrap() {
            HeadParse::Complete { consumed, head } => {
                assert_eq!(consumed, buf.len());
                assert_eq!(head.headers.get("x-check"), Some(b"ok".as_ref()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn empty_trailer_section() {
        match parse_trailers(b"\r\n", limits()).unwrap() {
            HeadParse::Complete { consumed, head } => {
                assert_eq!(consumed, 2);
                assert!(head.headers.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
