use std::hash::{Hash, Hasher};
use std::io;

use ahash::AHasher;
use futures::future::BoxFuture;
use tokio::net::TcpStream;

use crate::net::stream::{Stream, StreamType};

/// produces the transport wrapping for upstream connections
///
/// the core treats the transport as opaque bytes; the raw factory is the
/// identity, a tls factory would hand back a handshaking wrapper.
pub trait TransportSocketFactory: Send + Sync {
    fn implements_secure_transport(&self) -> bool;
    fn wrap(&self, stream: Stream) -> Stream;
    /// folded into the pool hash key so plain and tls never share clients
    fn hash_key(&self) -> u64;
}

/// plain bytes, no wrapping
#[derive(Default)]
pub struct RawBufferSocketFactory;

impl TransportSocketFactory for RawBufferSocketFactory {
    fn implements_secure_transport(&self) -> bool {
        false
    }
    fn wrap(&self, stream: Stream) -> Stream {
        stream
    }
    fn hash_key(&self) -> u64 {
        let mut hasher = AHasher::default();
        "raw".hash(&mut hasher);
        hasher.finish()
    }
}

/// dials upstream sockets; swapped for an in-memory pipe in tests
pub trait Connect: Send + Sync {
    fn connect(&self) -> BoxFuture<'static, io::Result<Stream>>;
}

/// tcp connector for one `host:port` endpoint
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        TcpConnector {
            address: address.into(),
        }
    }
}

impl Connect for TcpConnector {
    fn connect(&self) -> BoxFuture<'static, io::Result<Stream>> {
        let address = self.address.clone();
        Box::pin(async move {
            let tcp = TcpStream::connect(&address).await?;
            let mut stream = StreamType::from(tcp);
            stream.set_no_delay();
            Ok(Box::new(stream) as Stream)
        })
    }
}
