use bytes::{Bytes, BytesMut};

use crate::buffer::Buffer;
use crate::error::CodecError;
use crate::headers::HeaderMap;
use crate::http1::parser::{self, ChunkParse, HeadLimits, HeadParse};
use crate::proto::{CodecSettings, Protocol};

// a chunk-size line that refuses to finish within this many bytes is junk
const PARTIAL_CHUNK_HEAD_LIMIT: usize = 8 * 1024;

/// where the decode side of a connection currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecodeState {
    // accumulating a request/response head
    Head,
    // counting down a content-length body
    BodyContentLength { remaining: u64 },
    // response body delimited by connection close
    BodyUntilClose,
    // expecting a chunk-size line
    ChunkHeader,
    // inside chunk payload
    ChunkData { remaining: u64 },
    // expecting the CRLF that closes a chunk payload
    ChunkDataCrlf,
    // consuming the trailer section after the 0 chunk
    Trailers,
    // message done, paused until the owner restarts the cycle
    Complete,
    // raw tunnel, bytes pass straight through
    Upgrade,
}

/// what a body pass produced
#[derive(Debug)]
pub(crate) enum BodyEvent {
    /// input exhausted, stay in the current state
    NeedMore,
    /// message finished, trailers present when the peer sent any
    MessageComplete { trailers: Option<HeaderMap> },
}

/// state shared by the server and client connection machines
pub(crate) struct ConnBase {
    pub settings: CodecSettings,
    pub state: DecodeState,
    pub protocol: Protocol,
    // unparsed input, accumulated across dispatches
    pub buf: BytesMut,
    // decoded body bytes not yet handed to the decoder
    pub buffered_body: Buffer,
    // serialized output waiting for the socket
    pub output: Buffer,
}

impl ConnBase {
    pub fn new(settings: CodecSettings) -> Self {
        ConnBase {
            settings,
            state: DecodeState::Head,
            protocol: Protocol::Http11,
            buf: BytesMut::new(),
            buffered_body: Buffer::new(),
            output: Buffer::new(),
        }
    }

    pub fn head_limits(&self) -> HeadLimits {
        HeadLimits {
            max_bytes: self.settings.max_headers_kb * 1024,
            max_count: self.settings.max_headers_count,
        }
    }

    pub fn push_input(&mut self, input: &mut Buffer) {
        while let Some(slice) = input.first_slice() {
            let len = slice.len();
            self.buf.extend_from_slice(slice);
            input.advance(len);
        }
    }

    /// drain everything decoded so far for the body callback
    pub fn take_buffered_body(&mut self) -> Option<Bytes> {
        if self.buffered_body.is_empty() {
            return None;
        }
        Some(self.buffered_body.take_all())
    }

    /// advance the body machine over the accumulated input
    ///
    /// decoded payload lands in `buffered_body`; the caller flushes it to
    /// the decoder between passes. `BodyUntilClose` never completes here,
    /// only `on_input_closed` finishes it.
    pub fn run_body(&mut self) -> Result<BodyEvent, CodecError> {
        loop {
            match self.state {
                DecodeState::BodyContentLength { remaining } => {
                    if remaining == 0 {
                        self.state = DecodeState::Complete;
                        return Ok(BodyEvent::MessageComplete { trailers: None });
                    }
                    if self.buf.is_empty() {
                        return Ok(BodyEvent::NeedMore);
                    }
                    let take = (self.buf.len() as u64).min(remaining) as usize;
                    let data = self.buf.split_to(take).freeze();
                    self.buffered_body.append(data);
                    self.state = DecodeState::BodyContentLength {
                        remaining: remaining - take as u64,
                    };
                }
                DecodeState::BodyUntilClose => {
                    if self.buf.is_empty() {
                        return Ok(BodyEvent::NeedMore);
                    }
                    let data = self.buf.split().freeze();
                    self.buffered_body.append(data);
                }
                DecodeState::ChunkHeader => match parser::parse_chunk_header(&self.buf)? {
                    ChunkParse::Incomplete => {
                        if self.buf.len() > PARTIAL_CHUNK_HEAD_LIMIT {
                            return Err(CodecError::protocol("chunk-header-too-long"));
                        }
                        return Ok(BodyEvent::NeedMore);
                    }
                    ChunkParse::Complete { consumed, size } => {
                        let _ = self.buf.split_to(consumed);
                        if size == 0 {
                            self.state = DecodeState::Trailers;
                        } else {
                            self.state = DecodeState::ChunkData { remaining: size };
                        }
                    }
                },
                DecodeState::ChunkData { remaining } => {
                    if self.buf.is_empty() {
                        return Ok(BodyEvent::NeedMore);
                    }
                    let take = (self.buf.len() as u64).min(remaining) as usize;
                    let data = self.buf.split_to(take).freeze();
                    self.buffered_body.append(data);
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        DecodeState::ChunkDataCrlf
                    } else {
                        DecodeState::ChunkData { remaining: left }
                    };
                }
                DecodeState::ChunkDataCrlf => {
                    if self.buf.len() < 2 {
                        return Ok(BodyEvent::NeedMore);
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(CodecError::protocol("invalid-chunk-framing"));
                    }
                    let _ = self.buf.split_to(2);
                    self.state = DecodeState::ChunkHeader;
                }
                DecodeState::Trailers => {
                    match parser::parse_trailers(&self.buf, self.head_limits())? {
                        HeadParse::Incomplete => return Ok(BodyEvent::NeedMore),
                        HeadParse::Complete { consumed, head } => {
                            let _ = self.buf.split_to(consumed);
                            self.state = DecodeState::Complete;
                            let trailers = if self.settings.enable_trailers
                                && !head.headers.is_empty()
                            {
                                Some(head.headers)
                            } else {
                                // trailers disabled (or absent): consumed and dropped
                                None
                            };
                            return Ok(BodyEvent::MessageComplete { trailers });
                        }
                    }
                }
                DecodeState::Head
                | DecodeState::Complete
                | DecodeState::Upgrade => {
                    unreachable!("run_body called outside a body state")
                }
            }
        }
    }

    /// the peer closed its write side; only close-delimited bodies finish
    pub fn close_delimited_complete(&mut self) -> bool {
        if self.state == DecodeState::BodyUntilClose {
            self.state = DecodeState::Complete;
            return true;
        }
        false
    }
}
