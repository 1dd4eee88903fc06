pub mod client;
pub mod http1;

pub use client::{ActiveClient, ClientState, CodecClient};
pub use http1::{ClientLease, DrainBehavior, Http1Pool, PoolStats};
