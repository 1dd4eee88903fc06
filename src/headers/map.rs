use bytes::Bytes;
use http::{Method, StatusCode};

use super::case::{CaseHeaderName, IntoCaseHeaderName};
use super::values;

/// an ordered multimap of header names to values
///
/// names compare case-insensitively but keep the casing they were stored
/// with. duplicate names are allowed and keep insertion order. pseudo
/// headers (`:method`, `:path`, `:scheme`, `:status`, `:authority`) are
/// ordinary entries; the wire codec decides what to do with them.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(CaseHeaderName, Bytes)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        HeaderMap {
            entries: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        HeaderMap {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// total bytes held in names and values, used for header size limits
    pub fn byte_size(&self) -> usize {
        self.entries
            .iter()
            .map(|(name, value)| name.as_slice().len() + value.len())
            .sum()
    }

    /// append a header, keeping any existing entries with the same name
    pub fn append<N, V>(&mut self, name: N, value: V)
    where
        N: IntoCaseHeaderName,
        V: Into<Bytes>,
    {
        self.entries.push((name.into_case_header_name(), value.into()));
    }

    /// set a header, dropping any existing entries with the same name
    pub fn insert<N, V>(&mut self, name: N, value: V)
    where
        N: IntoCaseHeaderName,
        V: Into<Bytes>,
    {
        let name = name.into_case_header_name();
        self.entries.retain(|(n, _)| !n.matches(name.as_slice()));
        self.entries.push((name, value.into()));
    }

    /// remove every entry with the given name, returns how many went away
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.matches(name.as_bytes()));
        before - self.entries.len()
    }

    /// first value stored under the name
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _)| n.matches(name.as_bytes()))
            .map(|(_, v)| v.as_ref())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// every value stored under the name, in order
    pub fn get_all(&self, name: &str) -> Vec<&[u8]> {
        self.entries
            .iter()
            .filter(|(n, _)| n.matches(name.as_bytes()))
            .map(|(_, v)| v.as_ref())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn count(&self, name: &str) -> usize {
        self.entries
            .iter()
            .filter(|(n, _)| n.matches(name.as_bytes()))
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CaseHeaderName, &Bytes)> {
        self.entries.iter().map(|(n, v)| (n, v))
    }
}

/// typed accessors over the conventional entries
impl HeaderMap {
    pub fn method(&self) -> Option<Method> {
        self.get(values::METHOD)
            .and_then(|v| Method::from_bytes(v).ok())
    }

    pub fn path(&self) -> Option<&str> {
        self.get_str(values::PATH)
    }

    pub fn scheme(&self) -> Option<&str> {
        self.get_str(values::SCHEME)
    }

    pub fn host(&self) -> Option<&str> {
        self.get_str(values::HOST)
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.get(values::STATUS)
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|v| v.parse::<u16>().ok())
            .and_then(|v| StatusCode::from_u16(v).ok())
    }

    pub fn set_method(&mut self, method: &Method) {
        self.insert(values::METHOD, method.as_str().to_string());
    }

    pub fn set_path(&mut self, path: &str) {
        self.insert(values::PATH, path.to_string());
    }

    pub fn set_scheme(&mut self, scheme: &str) {
        self.insert(values::SCHEME, scheme.to_ascii_lowercase());
    }

    pub fn set_host(&mut self, host: &str) {
        self.insert(values::HOST, host.to_string());
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.insert(values::STATUS, status.as_str().to_string());
    }

    /// parsed `content-length`, rejecting junk and negative values
    pub fn content_length(&self) -> Option<u64> {
        let value = self.get(values::CONTENT_LENGTH)?;
        let text = std::str::from_utf8(value).ok()?;
        match text.trim().parse::<u64>() {
            Ok(len) => Some(len),
            Err(_) => {
                tracing::debug!(value = %text, "invalid content length value");
                None
            }
        }
    }

    /// true when `transfer-encoding: chunked` is the sole transfer coding
    pub fn is_chunked(&self) -> bool {
        match self.get(values::TRANSFER_ENCODING) {
            Some(value) => value.eq_ignore_ascii_case(values::CHUNKED.as_bytes()),
            None => false,
        }
    }

    /// any transfer-encoding present that is not plain `chunked`
    pub fn has_non_chunked_transfer_encoding(&self) -> bool {
        match self.get(values::TRANSFER_ENCODING) {
            Some(value) => !value.eq_ignore_ascii_case(values::CHUNKED.as_bytes()),
            None => false,
        }
    }

    /// true when a `connection: close` token is present
    pub fn requests_close(&self) -> bool {
        self.get_all(values::CONNECTION).iter().any(|value| {
            std::str::from_utf8(value)
                .map(|v| {
                    v.split(',')
                        .any(|token| token.trim().eq_ignore_ascii_case(values::CLOSE))
                })
                .unwrap_or(false)
        })
    }
}
