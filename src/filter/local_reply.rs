use bytes::Bytes;
use http::StatusCode;

use crate::headers::{values, HeaderMap};

/// a synthesized response on its way out
#[derive(Debug, Clone)]
pub struct LocalReply {
    pub code: StatusCode,
    pub body: Option<Bytes>,
    pub details: String,
}

impl LocalReply {
    pub fn new(code: StatusCode, details: impl Into<String>) -> Self {
        LocalReply {
            code,
            body: None,
            details: details.into(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// hook that may rewrite a local reply before it is encoded
///
/// gets the request headers (when any were decoded) so rewrites can key
/// off accept headers or the path; the default leaves the terse text as
/// is.
pub trait LocalReplyPolicy: Send + Sync {
    fn rewrite(
        &self,
        _request_headers: Option<&HeaderMap>,
        _code: &mut StatusCode,
        _body: &mut Option<Bytes>,
        _content_type: &mut &'static str,
    ) {
    }
}

/// terse text bodies with code-appropriate reason phrases
#[derive(Default)]
pub struct DefaultLocalReply;

impl LocalReplyPolicy for DefaultLocalReply {}

/// default body text for a reply that did not bring its own
pub fn default_body(code: StatusCode) -> Option<Bytes> {
    match code {
        StatusCode::SERVICE_UNAVAILABLE => Some(Bytes::from_static(b"no healthy upstream")),
        _ => code
            .canonical_reason()
            .map(|reason| Bytes::from(reason.as_bytes().to_vec())),
    }
}

/// materialize the reply into response headers + body
pub fn build_response(
    reply: &LocalReply,
    request_headers: Option<&HeaderMap>,
    policy: &dyn LocalReplyPolicy,
    is_head: bool,
) -> (HeaderMap, Option<Bytes>) {
    let mut code = reply.code;
    let mut body = reply.body.clone().or_else(|| default_body(reply.code));
    let mut content_type = "text/plain";
    policy.rewrite(request_headers, &mut code, &mut body, &mut content_type);

    let mut headers = HeaderMap::new();
    headers.set_status(code);
    match &body {
        Some(body) if !body.is_empty() => {
            headers.append(values::CONTENT_LENGTH, body.len().to_string());
            headers.append(values::CONTENT_TYPE, content_type.to_string());
        }
        _ => {
            headers.append(values::CONTENT_LENGTH, "0");
        }
    }
    let body = if is_head { None } else { body };
    (headers, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_reply_shape() {
        let reply = LocalReply::new(StatusCode::NOT_FOUND, "route_not_found");
        let (headers, body) = build_response(&reply, None, &DefaultLocalReply, false);
        assert_eq!(headers.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(body.as_deref(), Some(b"Not Found".as_ref()));
        assert_eq!(headers.get("content-length"), Some(b"9".as_ref()));
        assert_eq!(headers.get("content-type"), Some(b"text/plain".as_ref()));
    }

    #[test]
    fn unavailable_gets_upstream_text() {
        let reply = LocalReply::new(StatusCode::SERVICE_UNAVAILABLE, "overflow");
        let (_, body) = build_response(&reply, None, &DefaultLocalReply, false);
        assert_eq!(body.as_deref(), Some(b"no healthy upstream".as_ref()));
    }

    #[test]
    fn head_request_drops_body_but_keeps_length() {
        let reply = LocalReply::new(StatusCode::NOT_FOUND, "route_not_found");
        let (headers, body) = build_response(&reply, None, &DefaultLocalReply, true);
        assert!(body.is_none());
        assert_eq!(headers.get("content-length"), Some(b"9".as_ref()));
    }

    #[test]
    fn policy_can_rewrite() {
        struct Json;
        impl LocalReplyPolicy for Json {
            fn rewrite(
                &self,
                _request_headers: Option<&HeaderMap>,
                _code: &mut StatusCode,
                body: &mut Option<Bytes>,
                content_type: &mut &'static str,
            ) {
                *body = Some(Bytes::from_static(b"{\"error\":true}"));
                *content_type = "application/json";
            }
        }
        let reply = LocalReply::new(StatusCode::BAD_REQUEST, "x");
        let (headers, body) = build_response(&reply, None, &Json, false);
        assert_eq!(headers.get("content-type"), Some(b"application/json".as_ref()));
        assert_eq!(body.as_deref(), Some(b"{\"error\":true}".as_ref()));
    }
}
