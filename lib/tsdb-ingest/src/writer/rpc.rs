use std::time::Duration;

use async_trait::async_trait;
use snafu::ResultExt as _;

use super::{BatchWriter, Transport, WriteError};
use crate::{
    batch::Batch,
    endpoint::Endpoint,
    transport::{Connector, ProtocolError, RpcTransport},
};

/// Writes point batches over the multi-value put RPC.
pub struct RpcWriter<C: Connector> {
    transport: RpcTransport<C>,
}

impl<C: Connector> RpcWriter<C> {
    /// Creates a new `RpcWriter` sending through `transport`.
    pub fn new(transport: RpcTransport<C>) -> Self {
        Self { transport }
    }

    /// Returns the underlying transport.
    pub fn transport(&self) -> &RpcTransport<C> {
        &self.transport
    }
}

#[async_trait]
impl<C: Connector> BatchWriter for RpcWriter<C> {
    fn endpoint(&self) -> &Endpoint {
        self.transport.endpoint()
    }

    async fn submit(&mut self, batch: Batch) -> Result<Duration, WriteError> {
        match batch {
            Batch::Points(points) => self.transport.send(&points).await.context(Transport),
            other => Err(WriteError::Protocol {
                endpoint: self.transport.endpoint().clone(),
                source: ProtocolError::UnsupportedBatch { kind: other.kind() },
            }),
        }
    }
}
