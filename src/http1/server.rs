use bytes::Bytes;
use http::{Method, StatusCode, Uri};

use crate::buffer::Buffer;
use crate::error::CodecError;
use crate::headers::{values, HeaderMap};
use crate::http1::codec::{BodyEvent, ConnBase, DecodeState};
use crate::http1::encoder;
use crate::http1::parser::{self, HeadParse, ParsedHead};
use crate::proto::{CodecSettings, Protocol, ServerCodecCallbacks, StreamId};

/// one request/response cycle as the server connection tracks it
#[derive(Debug)]
struct ActiveRequest {
    stream: StreamId,
    is_head: bool,
    is_connect: bool,
    upgrade: bool,
    // close the connection once the response has flushed
    close_after_response: bool,
    response_started: bool,
    response_complete: bool,
    chunk_encoding: bool,
    disable_chunk_encoding: bool,
    // 204/304: the codec eats any body the filters emit
    bodiless_response: bool,
    tunnel: bool,
}

impl ActiveRequest {
    fn new(stream: StreamId) -> Self {
        ActiveRequest {
            stream,
            is_head: false,
            is_connect: false,
            upgrade: false,
            close_after_response: false,
            response_started: false,
            response_complete: false,
            chunk_encoding: false,
            disable_chunk_encoding: false,
            bodiless_response: false,
            tunnel: false,
        }
    }
}

/// server side of an http/1 connection: decodes requests, encodes responses
///
/// `dispatch` pushes decoded events at the callbacks object and pauses
/// after each complete request until `on_response_complete` restarts the
/// cycle, which is what serializes streams on a keep-alive connection.
pub struct ServerConnection {
    base: ConnBase,
    active: Option<ActiveRequest>,
    reset_called: bool,
}

impl ServerConnection {
    pub fn new(settings: CodecSettings) -> Self {
        ServerConnection {
            base: ConnBase::new(settings),
            active: None,
            reset_called: false,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.base.protocol
    }

    /// serialized bytes waiting for the socket
    pub fn output(&mut self) -> &mut Buffer {
        &mut self.base.output
    }

    pub fn has_active_request(&self) -> bool {
        self.active.is_some()
    }

    /// true once the current request has fully arrived
    pub fn request_complete(&self) -> bool {
        matches!(self.base.state, DecodeState::Complete)
    }

    pub fn response_started(&self) -> bool {
        self.active.as_ref().map_or(false, |a| a.response_started)
    }

    pub fn response_complete(&self) -> bool {
        self.active.as_ref().map_or(false, |a| a.response_complete)
    }

    /// the connection must not be reused after the current response
    pub fn close_after_response(&self) -> bool {
        self.active.as_ref().map_or(false, |a| {
            a.close_after_response || a.tunnel || a.upgrade
        })
    }

    /// unparsed input is still queued (pipelined request bytes)
    pub fn has_buffered_input(&self) -> bool {
        !self.base.buf.is_empty()
    }

    pub fn reset(&mut self) {
        self.reset_called = true;
        self.active = None;
    }

    /// feed wire bytes through the decoder
    pub fn dispatch(
        &mut self,
        input: &mut Buffer,
        callbacks: &mut dyn ServerCodecCallbacks,
    ) -> Result<(), CodecError> {
        if self.reset_called {
            input.clear();
            return Ok(());
        }
        if self.base.state == DecodeState::Upgrade {
            self.base.push_input(input);
            let data = self.base.buf.split().freeze();
            if !data.is_empty() {
                if let Some(active) = &self.active {
                    callbacks.decode_data(active.stream, data, false);
                }
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
                    if self.active.is_none() {
                        let stream = callbacks.new_stream();
                        self.active = Some(ActiveRequest::new(stream));
                    }
                    let limits = self.base.head_limits();
                    match parser::parse_request_head(&self.base.buf, limits)? {
                        HeadParse::Incomplete => break,
                        HeadParse::Complete { consumed, head } => {
                            let _ = self.base.buf.split_to(consumed);
                            self.on_request_head(head, callbacks)?;
                        }
                    }
                }
                DecodeState::Complete => break,
                DecodeState::Upgrade => {
                    let data = self.base.buf.split().freeze();
                    if !data.is_empty() {
                        if let Some(active) = &self.active {
                            callbacks.decode_data(active.stream, data, false);
                        }
                    }
                    break;
                }
                _ => {
                    let event = self.base.run_body()?;
                    let stream = self
                        .active
                        .as_ref()
                        .expect("body bytes without a request")
                        .stream;
                    match event {
                        BodyEvent::NeedMore => {
                            if let Some(data) = self.base.take_buffered_body() {
                                callbacks.decode_data(stream, data, false);
                            }
                            break;
                        }
                        BodyEvent::MessageComplete { trailers } => match trailers {
                            Some(trailers) => {
                                if let Some(data) = self.base.take_buffered_body() {
                                    callbacks.decode_data(stream, data, false);
                                }
                                callbacks.decode_trailers(stream, trailers);
                            }
                            None => {
                                let data =
                                    self.base.take_buffered_body().unwrap_or_else(Bytes::new);
                                callbacks.decode_data(stream, data, true);
                            }
                        },
                    }
                }
            }
        }
        Ok(())
    }

    fn on_request_head(
        &mut self,
        head: ParsedHead,
        callbacks: &mut dyn ServerCodecCallbacks,
    ) -> Result<(), CodecError> {
        self.base.protocol = head.protocol;
        if head.protocol == Protocol::Http10 && !self.base.settings.accept_http_10 {
            return Err(CodecError::protocol("http10-not-allowed"));
        }
        let method = head
            .method
            .as_deref()
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .ok_or_else(|| CodecError::protocol("invalid-method"))?;
        let target = head
            .target
            .ok_or_else(|| CodecError::protocol("missing-target"))?;
        let mut headers = head.headers;
        let is_connect = method == Method::CONNECT;

        self.parse_target(&method, &target, &mut headers, callbacks)?;

        if is_connect && headers.content_length().map_or(false, |len| len > 0) {
            return Err(CodecError::protocol("body-disallowed"));
        }
        if headers.contains(values::CONTENT_LENGTH) && headers.is_chunked() {
            if self.base.settings.allow_chunked_length {
                headers.remove(values::CONTENT_LENGTH);
            } else {
                return Err(CodecError::protocol("chunked-content-length"));
            }
        }
        if headers.has_non_chunked_transfer_encoding()
            || (is_connect && headers.contains(values::TRANSFER_ENCODING))
        {
            return Err(CodecError::protocol_with_code(
                "invalid-transfer-encoding",
                StatusCode::NOT_IMPLEMENTED,
            ));
        }
        if !is_connect && !headers.contains(values::HOST) {
            return Err(CodecError::protocol("missing-host"));
        }

        // the Expect dance is answered here, it never travels upstream
        if let Some(expect) = headers.get(values::EXPECT) {
            if expect.eq_ignore_ascii_case(b"100-continue") {
                self.base
                    .output
                    .append(Bytes::from_static(b"HTTP/1.1 100 Continue\r\n\r\n"));
                headers.remove(values::EXPECT);
            }
        }

        headers.set_method(&method);

        let upgrade = is_connect || is_upgrade_request(&headers);
        let close_after_response = match head.protocol {
            Protocol::Http10 => !has_connection_token(&headers, b"keep-alive"),
            Protocol::Http11 => headers.requests_close(),
        };

        {
            let active = self.active.as_mut().expect("head without active request");
            active.is_head = method == Method::HEAD;
            active.is_connect = is_connect;
            active.upgrade = upgrade;
            active.close_after_response = close_after_response;
        }
        let stream = self.active.as_ref().expect("just set").stream;

        if upgrade {
            self.base.state = DecodeState::Upgrade;
            callbacks.decode_headers(stream, headers, false);
        } else if headers.is_chunked() {
            self.base.state = DecodeState::ChunkHeader;
            callbacks.decode_headers(stream, headers, false);
        } else if let Some(len) = headers.content_length().filter(|len| *len > 0) {
            self.base.state = DecodeState::BodyContentLength { remaining: len };
            callbacks.decode_headers(stream, headers, false);
        } else {
            // no body: the head is the whole message
            self.base.state = DecodeState::Complete;
            callbacks.decode_headers(stream, headers, true);
        }
        Ok(())
    }

    // request-target forms: origin, absolute, authority (CONNECT),
    // asterisk (OPTIONS)
    fn parse_target(
        &mut self,
        method: &Method,
        target: &str,
        headers: &mut HeaderMap,
        callbacks: &mut dyn ServerCodecCallbacks,
    ) -> Result<(), CodecError> {
        if *method == Method::CONNECT {
            if target.is_empty() || target.starts_with('/') {
                return Err(CodecError::protocol("invalid-authority"));
            }
            headers.set_host(target);
            return Ok(());
        }
        if *method == Method::OPTIONS && target == "*" {
            headers.set_path("*");
            return Ok(());
        }
        if target.starts_with('/') {
            headers.set_path(target);
            return Ok(());
        }
        if !self.base.settings.allow_absolute_url {
            return Err(CodecError::protocol("absolute-url-not-allowed"));
        }
        let uri: Uri = target
            .parse()
            .map_err(|_| CodecError::protocol("invalid-url"))?;
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| CodecError::protocol("invalid-url"))?;
        let authority = uri
            .authority()
            .ok_or_else(|| CodecError::protocol("invalid-url"))?;
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        headers.set_host(authority.as_str());
        headers.set_scheme(scheme);
        headers.set_path(path);
        callbacks.set_requested_server_name(&authority.host().to_ascii_lowercase());
        Ok(())
    }

    /// restart the cycle once both sides of the exchange have finished
    pub fn on_response_complete(&mut self) {
        if self.base.state == DecodeState::Complete {
            self.base.state = DecodeState::Head;
        }
        self.active = None;
    }

    pub fn disable_chunk_encoding(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.disable_chunk_encoding = true;
        }
    }

    /// serialize response headers, settling the body framing
    pub fn encode_response_headers(
        &mut self,
        headers: &HeaderMap,
        end_stream: bool,
    ) -> Result<(), CodecError> {
        let status = headers
            .status()
            .ok_or(CodecError::Client("response-missing-status"))?;
        let active = self
            .active
            .as_mut()
            .ok_or(CodecError::Client("no-active-request"))?;

        if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
            encoder::encode_status_line(&mut self.base.output, Protocol::Http11, status);
            encoder::encode_header_block(&mut self.base.output, headers);
            encoder::finish_head(&mut self.base.output);
            return Ok(());
        }

        let response_protocol = if self.base.protocol == Protocol::Http10
            && self.base.settings.accept_http_10
        {
            Protocol::Http10
        } else {
            Protocol::Http11
        };

        let has_length = headers.contains(values::CONTENT_LENGTH);
        let bodiless_status =
            status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED;
        let tunnel = active.is_connect && status.is_success();

        let mut add_content_length_zero = false;
        let mut close_framed = false;
        let chunked = if has_length || active.disable_chunk_encoding {
            false
        } else if bodiless_status {
            false
        } else if end_stream && !active.is_head {
            add_content_length_zero = true;
            false
        } else if response_protocol == Protocol::Http10 {
            close_framed = !end_stream;
            false
        } else if tunnel {
            false
        } else {
            true
        };

        active.response_started = true;
        active.chunk_encoding = chunked;
        active.bodiless_response = bodiless_status;
        active.tunnel = tunnel;
        if close_framed {
            // 1.0 peer without a length: the body runs until we close
            active.close_after_response = true;
        }
        let preserve_connection_headers = active.upgrade || tunnel;

        // the framing decision above owns transfer-encoding; hop-by-hop
        // connection headers never transit the proxy
        let mut skip: Vec<&str> = vec![values::TRANSFER_ENCODING];
        if !preserve_connection_headers {
            skip.extend([
                values::CONNECTION,
                values::KEEP_ALIVE,
                values::PROXY_CONNECTION,
            ]);
        }
        encoder::encode_status_line(&mut self.base.output, response_protocol, status);
        encoder::encode_header_block_except(&mut self.base.output, headers, &skip);
        if !headers.contains("date") {
            encoder::encode_extra_header(
                &mut self.base.output,
                "Date",
                &httpdate::fmt_http_date(std::time::SystemTime::now()),
            );
        }
        if add_content_length_zero {
            encoder::encode_extra_header(&mut self.base.output, "Content-Length", "0");
        }
        if chunked {
            encoder::encode_extra_header(&mut self.base.output, "Transfer-Encoding", "chunked");
        }
        if close_framed {
            encoder::encode_extra_header(&mut self.base.output, "Connection", "close");
        }
        encoder::finish_head(&mut self.base.output);

        if end_stream {
            self.end_encode(false);
        }
        Ok(())
    }

    pub fn encode_response_data(
        &mut self,
        data: Bytes,
        end_stream: bool,
    ) -> Result<(), CodecError> {
        let active = self
            .active
            .as_ref()
            .ok_or(CodecError::Client("no-active-request"))?;
        if !active.response_started {
            return Err(CodecError::Client("data-before-headers"));
        }
        if active.bodiless_response || active.is_head {
            if !data.is_empty() {
                tracing::debug!(
                    bytes = data.len(),
                    "dropping body bytes on a bodiless response"
                );
            }
        } else if active.chunk_encoding {
            encoder::encode_chunk(&mut self.base.output, data);
        } else {
            self.base.output.append(data);
        }
        if end_stream {
            self.end_encode(false);
        }
        Ok(())
    }

    pub fn encode_response_trailers(
        &mut self,
        trailers: &HeaderMap,
    ) -> Result<(), CodecError> {
        let active = self
            .active
            .as_ref()
            .ok_or(CodecError::Client("no-active-request"))?;
        if active.chunk_encoding {
            let send = self.base.settings.enable_trailers.then_some(trailers);
            encoder::encode_last_chunk(&mut self.base.output, send);
        }
        self.end_encode(true);
        Ok(())
    }

    fn end_encode(&mut self, chunk_already_terminated: bool) {
        let active = self.active.as_mut().expect("end encode without request");
        if active.chunk_encoding && !chunk_already_terminated {
            encoder::encode_last_chunk(&mut self.base.output, None);
        }
        active.response_complete = true;
        if active.tunnel || active.upgrade {
            active.close_after_response = true;
        }
    }

    /// minimal direct error answer for protocol failures with no stream
    pub fn encode_error_response(&mut self, code: StatusCode, details: &str) {
        let body = Bytes::copy_from_slice(details.as_bytes());
        encoder::encode_status_line(&mut self.base.output, Protocol::Http11, code);
        encoder::encode_extra_header(
            &mut self.base.output,
            "Content-Length",
            &body.len().to_string(),
        );
        encoder::encode_extra_header(&mut self.base.output, "Content-Type", "text/plain");
        encoder::encode_extra_header(&mut self.base.output, "Connection", "close");
        encoder::finish_head(&mut self.base.output);
        self.base.output.append(body);
        if let Some(active) = self.active.as_mut() {
            active.response_started = true;
            active.response_complete = true;
            active.close_after_response = true;
        }
    }
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains(values::UPGRADE) && has_connection_token(headers, b"upgrade")
}

fn has_connection_token(headers: &HeaderMap, token: &[u8]) -> bool {
    headers.get_all(values::CONNECTION).iter().any(|value| {
        std::str::from_utf8(value)
            .map(|v| {
                v.split(',')
                    .any(|t| t.trim().as_bytes().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    })
}
