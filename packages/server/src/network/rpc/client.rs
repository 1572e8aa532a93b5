//! Minimal RPC client over one connection, used by the batch pipeline and
//! by tests.

use std::collections::BTreeMap;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::frame::{self, RequestFrame, ResponseFrame, RpcError};

pub struct RpcClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    next_id: u64,
}

impl RpcClient {
    /// # Errors
    ///
    /// Fails when the connection cannot be established.
    pub async fn connect(addr: impl ToSocketAddrs, max_frame_bytes: usize) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_bytes)
            .new_codec();
        Ok(Self {
            framed: Framed::new(stream, codec),
            next_id: 1,
        })
    }

    /// Sends one request frame and waits for its response.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, an undecodable response, a closed connection or
    /// a response for another request.
    pub async fn call(
        &mut self,
        method: &str,
        metadata: BTreeMap<String, String>,
        body: Vec<u8>,
    ) -> Result<ResponseFrame, RpcError> {
        let id = self.next_id;
        self.next_id += 1;

        let mut request = RequestFrame::new(id, method, body);
        request.metadata = metadata;
        self.framed.send(Bytes::from(frame::encode(&request)?)).await?;

        let bytes = self.framed.next().await.ok_or(RpcError::Closed)??;
        let response: ResponseFrame = frame::decode(&bytes)?;
        if response.id != id {
            return Err(RpcError::IdMismatch {
                expected: id,
                got: response.id,
            });
        }
        Ok(response)
    }
}
