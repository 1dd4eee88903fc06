//! canonical header names as they appear after decode (lower case)

pub const STATUS: &str = ":status";
pub const METHOD: &str = ":method";
pub const PATH: &str = ":path";
pub const SCHEME: &str = ":scheme";
pub const AUTHORITY: &str = ":authority";

pub const HOST: &str = "host";
pub const CONTENT_LENGTH: &str = "content-length";
pub const TRANSFER_ENCODING: &str = "transfer-encoding";
pub const CONTENT_TYPE: &str = "content-type";
pub const CONNECTION: &str = "connection";
pub const UPGRADE: &str = "upgrade";
pub const KEEP_ALIVE: &str = "keep-alive";
pub const PROXY_CONNECTION: &str = "proxy-connection";
pub const TE: &str = "te";
pub const EXPECT: &str = "expect";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_PORT: &str = "x-forwarded-port";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

pub const CHUNKED: &str = "chunked";
pub const CLOSE: &str = "close";

pub const SCHEME_HTTP: &str = "http";
pub const SCHEME_HTTPS: &str = "https";
