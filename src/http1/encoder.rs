use bytes::Bytes;
use http::{Method, StatusCode};

use crate::buffer::Buffer;
use crate::headers::{values, HeaderMap};
use crate::proto::Protocol;

pub const CRLF: &[u8] = b"\r\n";
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";
const HEADER_DELIMITER: &[u8] = b": ";

pub fn encode_status_line(out: &mut Buffer, protocol: Protocol, status: StatusCode) {
    let mut line = Vec::with_capacity(64);
    line.extend_from_slice(protocol.as_str().as_bytes());
    line.push(b' ');
    line.extend_from_slice(status.as_str().as_bytes());
    line.push(b' ');
    line.extend_from_slice(
        status
            .canonical_reason()
            .unwrap_or("Unknown")
            .as_bytes(),
    );
    line.extend_from_slice(CRLF);
    out.append(Bytes::from(line));
}

pub fn encode_request_line(out: &mut Buffer, method: &Method, target: &str, protocol: Protocol) {
    let mut line = Vec::with_capacity(64 + target.len());
    line.extend_from_slice(method.as_str().as_bytes());
    line.push(b' ');
    line.extend_from_slice(target.as_bytes());
    line.push(b' ');
    line.extend_from_slice(protocol.as_str().as_bytes());
    line.extend_from_slice(CRLF);
    out.append(Bytes::from(line));
}

/// serialize the header block, translating `:authority` to `Host` (unless
/// a host entry already exists) and dropping every other `:` name
pub fn encode_header_block(out: &mut Buffer, headers: &HeaderMap) {
    encode_header_block_except(out, headers, &[]);
}

/// like `encode_header_block`, with names the codec owns held back
/// (framing headers are re-derived from the actual framing decision)
pub fn encode_header_block_except(out: &mut Buffer, headers: &HeaderMap, skip: &[&str]) {
    let has_host = headers.contains(values::HOST);
    let mut block = Vec::with_capacity(256);
    for (name, value) in headers.iter() {
        if name.is_pseudo() {
            if name.matches(values::AUTHORITY.as_bytes()) && !has_host {
                block.extend_from_slice(b"Host");
                block.extend_from_slice(HEADER_DELIMITER);
                block.extend_from_slice(value);
                block.extend_from_slice(CRLF);
            }
            continue;
        }
        if skip.iter().any(|skipped| name.matches(skipped.as_bytes())) {
            continue;
        }
        block.extend_from_slice(name.wire_spelling());
        block.extend_from_slice(HEADER_DELIMITER);
        block.extend_from_slice(value);
        block.extend_from_slice(CRLF);
    }
    out.append(Bytes::from(block));
}

pub fn encode_extra_header(out: &mut Buffer, name: &str, value: &str) {
    let mut line = Vec::with_capacity(name.len() + value.len() + 4);
    line.extend_from_slice(name.as_bytes());
    line.extend_from_slice(HEADER_DELIMITER);
    line.extend_from_slice(value.as_bytes());
    line.extend_from_slice(CRLF);
    out.append(Bytes::from(line));
}

pub fn finish_head(out: &mut Buffer) {
    out.append(Bytes::from_static(CRLF));
}

/// write one body chunk with chunked-coding framing
pub fn encode_chunk(out: &mut Buffer, data: Bytes) {
    if data.is_empty() {
        return;
    }
    out.append(Bytes::from(format!("{:x}\r\n", data.len())));
    out.append(data);
    out.append(Bytes::from_static(CRLF));
}

/// write the terminating chunk, with or without a trailer section
pub fn encode_last_chunk(out: &mut Buffer, trailers: Option<&HeaderMap>) {
    match trailers {
        Some(trailers) if !trailers.is_empty() => {
            out.append(Bytes::from_static(b"0\r\n"));
            encode_header_block(out, trailers);
            finish_head(out);
        }
        _ => out.append(Bytes::from_static(LAST_CHUNK)),
    }
}
