use bytes::Bytes;
use http::{Method, StatusCode};

use crate::buffer::Buffer;
use crate::error::{CodecError, StreamResetReason};
use crate::headers::{values, HeaderMap};
use crate::http1::codec::{BodyEvent, ConnBase, DecodeState};
use crate::http1::encoder;
use crate::http1::parser::{self, HeadParse, ParsedHead};
use crate::proto::{CodecSettings, Protocol, ResponseDecoder};

/// the request currently in flight on a client connection
#[derive(Debug)]
struct PendingResponse {
    method: Method,
    // request fully serialized (trailing chunk included)
    encode_complete: bool,
    chunk_encoding: bool,
    response_complete: bool,
    // the peer answered `connection: close` or is 1.0 without keep-alive
    saw_close: bool,
    ignore_message_complete_for_1xx: bool,
}

impl PendingResponse {
    fn new(method: Method) -> Self {
        PendingResponse {
            method,
            encode_complete: false,
            chunk_encoding: false,
            response_complete: false,
            saw_close: false,
            ignore_message_complete_for_1xx: false,
        }
    }
}

/// what the peer closing its write side means for the in-flight response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfCloseOutcome {
    /// nothing in flight, or the response had already finished
    Idle,
    /// a close-delimited body just completed
    ResponseComplete,
    /// the response was cut short
    Reset(StreamResetReason),
}

/// client side of an http/1 connection: encodes requests, decodes responses
pub struct ClientConnection {
    base: ConnBase,
    pending: Option<PendingResponse>,
    force_reset_on_premature_half_close: bool,
    premature_half_close: bool,
}

impl ClientConnection {
    pub fn new(settings: CodecSettings) -> Self {
        ClientConnection {
            base: ConnBase::new(settings),
            pending: None,
            force_reset_on_premature_half_close: false,
            premature_half_close: false,
        }
    }

    pub fn set_force_reset_on_premature_half_close(&mut self, on: bool) {
        self.force_reset_on_premature_half_close = on;
    }

    pub fn output(&mut self) -> &mut Buffer {
        &mut self.base.output
    }

    pub fn active_streams(&self) -> usize {
        usize::from(self.pending.is_some())
    }

    pub fn response_complete(&self) -> bool {
        self.pending.as_ref().map_or(false, |p| p.response_complete)
    }

    /// response finished before the request was fully written
    pub fn took_premature_half_close(&mut self) -> bool {
        std::mem::take(&mut self.premature_half_close)
    }

    /// peer asked for the connection to go away after this exchange
    pub fn saw_connection_close(&self) -> bool {
        self.pending.as_ref().map_or(false, |p| p.saw_close)
    }

    /// begin a new exchange; only one may be in flight on http/1
    pub fn new_stream(&mut self, method: Method) -> Result<(), CodecError> {
        if self.pending.is_some() {
            return Err(CodecError::Client("request-already-pending"));
        }
        self.pending = Some(PendingResponse::new(method));
        self.base.state = DecodeState::Head;
        Ok(())
    }

    /// drop the finished exchange so the connection can be pooled again
    pub fn release_stream(&mut self) {
        self.pending = None;
        self.base.state = DecodeState::Head;
    }

    pub fn encode_request_headers(
        &mut self,
        headers: &HeaderMap,
        end_stream: bool,
    ) -> Result<(), CodecError> {
        let pending = self
            .pending
            .as_mut()
            .ok_or(CodecError::Client("no-pending-request"))?;
        let method = pending.method.clone();
        let is_connect = method == Method::CONNECT;

        let target = if is_connect {
            headers
                .host()
                .or_else(|| headers.get_str(values::AUTHORITY))
                .ok_or(CodecError::Client("connect-missing-authority"))?
                .to_string()
        } else {
            headers
                .path()
                .ok_or(CodecError::Client("request-missing-path"))?
                .to_string()
        };
        if !headers.contains(values::HOST) && !headers.contains(values::AUTHORITY) {
            return Err(CodecError::Client("request-missing-host"));
        }

        let has_length = headers.contains(values::CONTENT_LENGTH);
        let chunked = !end_stream && !has_length && !is_connect;
        pending.chunk_encoding = chunked;

        let preserve_connection_headers = is_connect || headers.contains(values::UPGRADE);
        let mut skip: Vec<&str> = vec![values::TRANSFER_ENCODING];
        if !preserve_connection_headers {
            skip.extend([
                values::CONNECTION,
                values::KEEP_ALIVE,
                values::PROXY_CONNECTION,
            ]);
        }
        encoder::encode_request_line(&mut self.base.output, &method, &target, Protocol::Http11);
        // the codec owns request framing too
        encoder::encode_header_block_except(&mut self.base.output, headers, &skip);
        if chunked {
            encoder::encode_extra_header(&mut self.base.output, "Transfer-Encoding", "chunked");
        }
        encoder::finish_head(&mut self.base.output);

        if end_stream {
            self.end_encode(false);
        }
        Ok(())
    }

    pub fn encode_request_data(
        &mut self,
        data: Bytes,
        end_stream: bool,
    ) -> Result<(), CodecError> {
        let pending = self
            .pending
            .as_ref()
            .ok_or(CodecError::Client("no-pending-request"))?;
        if pending.chunk_encoding {
            encoder::encode_chunk(&mut self.base.output, data);
        } else {
            self.base.output.append(data);
        }
        if end_stream {
            self.end_encode(false);
        }
        Ok(())
    }

    pub fn encode_request_trailers(&mut self, trailers: &HeaderMap) -> Result<(), CodecError> {
        let pending = self
            .pending
            .as_ref()
            .ok_or(CodecError::Client("no-pending-request"))?;
        if pending.chunk_encoding {
            let send = self.base.settings.enable_trailers.then_some(trailers);
            encoder::encode_last_chunk(&mut self.base.output, send);
        }
        self.end_encode(true);
        Ok(())
    }

    fn end_encode(&mut self, chunk_already_terminated: bool) {
        let pending = self.pending.as_mut().expect("end encode without request");
        if pending.chunk_encoding && !chunk_already_terminated {
            encoder::encode_last_chunk(&mut self.base.output, None);
        }
        pending.encode_complete = true;
    }

    /// feed wire bytes through the response decoder
    pub fn dispatch(
        &mut self,
        input: &mut Buffer,
        decoder: &mut dyn ResponseDecoder,
    ) -> Result<(), CodecError> {
        if self.base.state == DecodeState::Upgrade {
            self.base.push_input(input);
            let data = self.base.buf.split().freeze();
            if !data.is_empty() {
                decoder.decode_data(data, false);
            }
            return Ok(());
        }
        self.base.push_input(input);
        loop {
            match self.base.state {
                DecodeState::Head => {
                    if self.base.buf.is_empty() {
                        break;
                    }
                    if self.pending.is_none() {
                        return Err(CodecError::PrematureResponse);
                    }
                    let limits = self.base.head_limits();
                    match parser::parse_response_head(&self.base.buf, limits)? {
                        HeadParse::Incomplete => break,
                        HeadParse::Complete { consumed, head } => {
                            let _ = self.base.buf.split_to(consumed);
                            self.on_response_head(head, decoder)?;
                        }
                    }
                }
                DecodeState::Complete => break,
                DecodeState::Upgrade => {
                    let data = self.base.buf.split().freeze();
                    if !data.is_empty() {
                        decoder.decode_data(data, false);
                    }
                    break;
                }
                _ => match self.base.run_body()? {
                    BodyEvent::NeedMore => {
                        if let Some(data) = self.base.take_buffered_body() {
                            decoder.decode_data(data, false);
                        }
                        break;
                    }
                    BodyEvent::MessageComplete { trailers } => {
                        match trailers {
                            Some(trailers) => {
                                if let Some(data) = self.base.take_buffered_body() {
                                    decoder.decode_data(data, false);
                                }
                                decoder.decode_trailers(trailers);
                            }
                            None => {
                                let data =
                                    self.base.take_buffered_body().unwrap_or_else(Bytes::new);
                                decoder.decode_data(data, true);
                            }
                        }
                        self.on_message_complete();
                    }
                },
            }
        }
        Ok(())
    }

    fn on_response_head(
        &mut self,
        head: ParsedHead,
        decoder: &mut dyn ResponseDecoder,
    ) -> Result<(), CodecError> {
        self.base.protocol = head.protocol;
        let status = head
            .status
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or_else(|| CodecError::protocol("invalid-status"))?;
        let mut headers = head.headers;
        headers.set_status(status);

        let pending = self
            .pending
            .as_mut()
            .ok_or(CodecError::PrematureResponse)?;
        pending.saw_close = headers.requests_close()
            || (head.protocol == Protocol::Http10
                && !headers
                    .get(values::CONNECTION)
                    .map_or(false, |v| v.eq_ignore_ascii_case(b"keep-alive")));

        let is_connect = pending.method == Method::CONNECT;
        let is_head = pending.method == Method::HEAD;

        // CONNECT accepted: everything from here on is tunnel payload
        if is_connect && status.is_success() {
            self.base.state = DecodeState::Upgrade;
            decoder.decode_headers(headers, false);
            return Ok(());
        }

        if status.is_informational() {
            if status == StatusCode::SWITCHING_PROTOCOLS {
                self.base.state = DecodeState::Upgrade;
                decoder.decode_headers(headers, false);
                return Ok(());
            }
            check_bodiless_rules(&headers)?;
            pending.ignore_message_complete_for_1xx = true;
            // stay in Head: the real response follows
            decoder.decode_1xx_headers(headers);
            return Ok(());
        }
        if status == StatusCode::NO_CONTENT {
            check_bodiless_rules(&headers)?;
        }

        let bodiless = is_head
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
            || (!headers.is_chunked() && headers.content_length() == Some(0));

        if bodiless {
            pending.response_complete = true;
            self.base.state = DecodeState::Complete;
            decoder.decode_headers(headers, true);
            self.check_premature_half_close();
            return Ok(());
        }

        if headers.is_chunked() {
            self.base.state = DecodeState::ChunkHeader;
        } else if let Some(len) = headers.content_length() {
            self.base.state = DecodeState::BodyContentLength { remaining: len };
        } else {
            // no framing from the peer: the body runs until close
            self.base.state = DecodeState::BodyUntilClose;
        }
        decoder.decode_headers(headers, false);
        Ok(())
    }

    fn on_message_complete(&mut self) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        if pending.ignore_message_complete_for_1xx {
            pending.ignore_message_complete_for_1xx = false;
            return;
        }
        pending.response_complete = true;
        self.check_premature_half_close();
    }

    fn check_premature_half_close(&mut self) {
        let Some(pending) = self.pending.as_ref() else {
            return;
        };
        if self.force_reset_on_premature_half_close
            && pending.response_complete
            && !pending.encode_complete
        {
            self.premature_half_close = true;
        }
    }

    /// the peer closed its write side
    pub fn on_remote_close(&mut self, decoder: &mut dyn ResponseDecoder) -> HalfCloseOutcome {
        let Some(pending) = self.pending.as_mut() else {
            return HalfCloseOutcome::Idle;
        };
        if pending.response_complete {
            return HalfCloseOutcome::Idle;
        }
        if self.base.close_delimited_complete() {
            pending.response_complete = true;
            let data = self.base.take_buffered_body().unwrap_or_else(Bytes::new);
            decoder.decode_data(data, true);
            return HalfCloseOutcome::ResponseComplete;
        }
        // mid-head or mid-body close
        if self.force_reset_on_premature_half_close {
            HalfCloseOutcome::Reset(StreamResetReason::Http1PrematureUpstreamHalfClose)
        } else {
            HalfCloseOutcome::Reset(StreamResetReason::ConnectionTermination)
        }
    }
}

fn check_bodiless_rules(headers: &HeaderMap) -> Result<(), CodecError> {
    if headers.contains(values::TRANSFER_ENCODING) {
        return Err(CodecError::protocol("invalid-transfer-encoding"));
    }
    if headers.content_length().map_or(false, |len| len > 0) {
        return Err(CodecError::protocol("invalid-content-length"));
    }
    Ok(())
}
