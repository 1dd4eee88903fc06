use crate::filter::{DecoderFilter, EncoderFilter};

/// identity filter: every callback keeps iterating
///
/// useful as a chain placeholder and as the base other filters start
/// from; the trait defaults already pass everything through, so there is
/// nothing to override.
#[derive(Default)]
pub struct PassThroughFilter;

impl DecoderFilter for PassThroughFilter {}
impl EncoderFilter for PassThroughFilter {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::info::StreamInfo;
    use crate::filter::local_reply::DefaultLocalReply;
    use crate::filter::manager::{EncodeSink, FilterChainBuilder, FilterManager, IterationOutcome};
    use crate::filter::state::ConnectionState;
    use crate::headers::HeaderMap;
    use bytes::Bytes;
    use std::sync::Arc;

    struct NullSink;
    impl EncodeSink for NullSink {
        fn encode_1xx_headers(&mut self, _headers: &HeaderMap) {}
        fn encode_headers(&mut self, _headers: &HeaderMap, _end_stream: bool) {}
        fn encode_data(&mut self, _data: Bytes, _end_stream: bool) {}
        fn encode_trailers(&mut self, _trailers: &HeaderMap) {}
    }

    #[test]
    fn passes_everything() {
        let mut chain = FilterChainBuilder::new();
        chain.add_decoder_filter(Box::new(PassThroughFilter));
        chain.add_encoder_filter(Box::new(PassThroughFilter));
        let mut fm = FilterManager::new(
            chain,
            StreamInfo::new(1, ConnectionState::default()),
            Arc::new(DefaultLocalReply),
        );
        let mut headers = HeaderMap::new();
        headers.set_method(&http::Method::GET);
        headers.set_path("/");
        headers.set_host("a");
        let mut sink = NullSink;
        assert_eq!(
            fm.decode_headers(headers, true, &mut sink),
            IterationOutcome::Completed
        );
        assert!(fm.decode_completed());
    }
}
