use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::buffer::Buffer;
use crate::error::CodecError;
use crate::http1::ClientConnection;
use crate::net::Stream;
use crate::proto::{CodecSettings, ResponseDecoder};

const READ_CHUNK: usize = 16 * 1024;

/// what one socket read produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data,
    RemoteClosed,
}

/// one client codec bound to one upstream connection
///
/// owns both halves and moves bytes between them; everything above talks
/// to the codec, never to the socket.
pub struct CodecClient {
    pub codec: ClientConnection,
    stream: Stream,
    close_reason: Option<String>,
}

impl CodecClient {
    pub fn new(stream: Stream, settings: CodecSettings) -> Self {
        CodecClient {
            codec: ClientConnection::new(settings),
            stream,
            close_reason: None,
        }
    }

    /// push everything the codec has serialized onto the socket
    pub async fn flush(&mut self) -> tokio::io::Result<()> {
        let output = self.codec.output();
        while let Some(slice) = output.first_slice() {
            let len = slice.len();
            self.stream.write_all(slice).await?;
            output.advance(len);
        }
        self.stream.flush().await
    }

    /// read once and run the bytes through the response decoder
    pub async fn read_dispatch(
        &mut self,
        decoder: &mut dyn ResponseDecoder,
    ) -> Result<ReadOutcome, CodecError> {
        let mut chunk = BytesMut::with_capacity(READ_CHUNK);
        match self.stream.read_buf(&mut chunk).await {
            Ok(0) => Ok(ReadOutcome::RemoteClosed),
            Ok(_) => {
                let mut input = Buffer::from_bytes(chunk.freeze());
                self.codec.dispatch(&mut input, decoder)?;
                Ok(ReadOutcome::Data)
            }
            Err(e) => {
                self.close_reason = Some(e.to_string());
                Err(CodecError::Client("upstream-read-error"))
            }
        }
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    /// why the connection went away, when known
    pub fn connection_failure_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }
}

/// pool element lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Ready,
    Busy,
    Draining,
    Closed,
}

/// one pooled upstream client
pub struct ActiveClient {
    pub id: u64,
    pub codec_client: CodecClient,
    pub state: ClientState,
    /// exchanges this connection has carried
    pub total_streams: u64,
}

impl ActiveClient {
    pub fn new(id: u64, codec_client: CodecClient) -> Self {
        ActiveClient {
            id,
            codec_client,
            state: ClientState::Connecting,
            total_streams: 0,
        }
    }

    /// http/1 carries at most one stream at a time
    pub fn active_streams(&self) -> usize {
        self.codec_client.codec.active_streams()
    }
}
