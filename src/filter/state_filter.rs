use crate::filter::state::{keys, Lifespan, Mutability};
use crate::filter::{DecoderFilter, FilterCallbacks, FilterHeadersStatus};
use crate::headers::HeaderMap;

/// a rewrite rule the state filter can stamp onto a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRule {
    pub name: String,
    pub host_suffix: String,
}

/// seeds per-request filter state from the decoded request headers
///
/// downstream consumers read `original_uri` (the target before any route
/// mutation), `passthrough` (no rule matched, leave the body alone) and
/// `rule` (the matched rewrite rule).
pub struct StateFilter {
    rules: Vec<RewriteRule>,
}

impl StateFilter {
    pub fn new(rules: Vec<RewriteRule>) -> Self {
        StateFilter { rules }
    }

    fn match_rule(&self, headers: &HeaderMap) -> Option<&RewriteRule> {
        let host = headers.host()?;
        let host = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
        self.rules
            .iter()
            .find(|rule| host.ends_with(&rule.host_suffix))
    }
}

impl DecoderFilter for StateFilter {
    fn decode_headers(
        &mut self,
        headers: &mut HeaderMap,
        _end_stream: bool,
        callbacks: &mut dyn FilterCallbacks,
    ) -> FilterHeadersStatus {
        if let Some(path) = headers.path() {
            let original = path.to_string();
            callbacks.filter_state().set(
                keys::ORIGINAL_URI,
                original,
                Lifespan::FilterChain,
                Mutability::ReadOnly,
            );
        }
        match self.match_rule(headers).cloned() {
            Some(rule) => {
                tracing::debug!(rule = %rule.name, "rewrite rule matched");
                callbacks.filter_state().set(
                    keys::RULE,
                    rule,
                    Lifespan::Request,
                    Mutability::ReadOnly,
                );
            }
            None => {
                callbacks.filter_state().set(
                    keys::PASSTHROUGH,
                    true,
                    Lifespan::Request,
                    Mutability::ReadOnly,
                );
            }
        }
        FilterHeadersStatus::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::info::StreamInfo;
    use crate::filter::local_reply::DefaultLocalReply;
    use crate::filter::manager::{EncodeSink, FilterChainBuilder, FilterManager};
    use crate::filter::state::ConnectionState;
    use bytes::Bytes;
    use std::sync::Arc;

    struct NullSink;
    impl EncodeSink for NullSink {
        fn encode_1xx_headers(&mut self, _headers: &HeaderMap) {}
        fn encode_headers(&mut self, _headers: &HeaderMap, _end_stream: bool) {}
        fn encode_data(&mut self, _data: Bytes, _end_stream: bool) {}
        fn encode_trailers(&mut self, _trailers: &HeaderMap) {}
    }

    fn run(rules: Vec<RewriteRule>, host: &str) -> FilterManager {
        let mut chain = FilterChainBuilder::new();
        chain.add_decoder_filter(Box::new(StateFilter::new(rules)));
        let mut fm = FilterManager::new(
            chain,
            StreamInfo::new(1, ConnectionState::default()),
            Arc::new(DefaultLocalReply),
        );
        let mut headers = HeaderMap::new();
        headers.set_method(&http::Method::GET);
        headers.set_path("/orig?q=1");
        headers.set_host(host);
        let mut sink = NullSink;
        fm.decode_headers(headers, true, &mut sink);
        fm
    }

    #[test]
    fn records_original_uri() {
        let fm = run(Vec::new(), "a.example");
        assert_eq!(
            fm.info().filter_state.get::<String>(keys::ORIGINAL_URI),
            Some("/orig?q=1".to_string())
        );
    }

    #[test]
    fn matching_rule_stored() {
        let rule = RewriteRule {
            name: "internal".into(),
            host_suffix: ".example".into(),
        };
        let fm = run(vec![rule.clone()], "a.example:8080");
        assert_eq!(
            fm.info().filter_state.get::<RewriteRule>(keys::RULE),
            Some(rule)
        );
        assert!(!fm.info().filter_state.has(keys::PASSTHROUGH));
    }

    #[test]
    fn no_rule_means_passthrough() {
        let fm = run(Vec::new(), "other.net");
        assert_eq!(
            fm.info().filter_state.get::<bool>(keys::PASSTHROUGH),
            Some(true)
        );
    }
}
