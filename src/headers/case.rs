use bytes::Bytes;

/// a header name with its wire casing preserved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseHeaderName(Bytes);

impl CaseHeaderName {
    pub fn new(name: String) -> Self {
        CaseHeaderName(name.into())
    }

    pub fn from_slice(buf: &[u8]) -> Self {
        CaseHeaderName(Bytes::copy_from_slice(buf))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// case-insensitive comparison against another name
    pub fn matches(&self, other: &[u8]) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }

    /// true for `:`-prefixed pseudo header names
    pub fn is_pseudo(&self) -> bool {
        self.0.first() == Some(&b':')
    }

    /// the wire spelling: title case for well known lowercase names,
    /// stored bytes otherwise
    pub fn wire_spelling(&self) -> &[u8] {
        match titled_header_name(&self.0) {
            Some(titled) => titled.as_bytes(),
            None => &self.0,
        }
    }
}

pub trait IntoCaseHeaderName {
    fn into_case_header_name(self) -> CaseHeaderName;
}

impl IntoCaseHeaderName for CaseHeaderName {
    fn into_case_header_name(self) -> CaseHeaderName {
        self
    }
}

impl IntoCaseHeaderName for String {
    fn into_case_header_name(self) -> CaseHeaderName {
        CaseHeaderName(self.into())
    }
}

impl IntoCaseHeaderName for &'static str {
    fn into_case_header_name(self) -> CaseHeaderName {
        CaseHeaderName(self.into())
    }
}

impl IntoCaseHeaderName for Bytes {
    fn into_case_header_name(self) -> CaseHeaderName {
        CaseHeaderName(self)
    }
}

fn titled_header_name(name: &[u8]) -> Option<&'static str> {
    Some(match name {
        b"age" => "Age",
        b"cache-control" => "Cache-Control",
        b"connection" => "Connection",
        b"content-type" => "Content-Type",
        b"content-encoding" => "Content-Encoding",
        b"content-length" => "Content-Length",
        b"date" => "Date",
        b"transfer-encoding" => "Transfer-Encoding",
        b"host" => "Host",
        b"keep-alive" => "Keep-Alive",
        b"proxy-connection" => "Proxy-Connection",
        b"server" => "Server",
        b"set-cookie" => "Set-Cookie",
        b"upgrade" => "Upgrade",
        b"expect" => "Expect",
        b"te" => "TE",
        b"x-forwarded-proto" => "X-Forwarded-Proto",
        b"x-forwarded-port" => "X-Forwarded-Port",
        b"x-forwarded-for" => "X-Forwarded-For",
        _ => {
            return None;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn titled_spelling() {
        let name = CaseHeaderName::from_slice(b"content-length");
        assert_eq!(name.wire_spelling(), b"Content-Length");
    }

    #[test]
    fn unknown_spelling_kept() {
        let name = CaseHeaderName::from_slice(b"x-Custom-Thing");
        assert_eq!(name.wire_spelling(), b"x-Custom-Thing");
    }

    #[test]
    fn pseudo_detection() {
        assert!(CaseHeaderName::from_slice(b":method").is_pseudo());
        assert!(!CaseHeaderName::from_slice(b"host").is_pseudo());
    }
}
