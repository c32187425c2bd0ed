use async_trait::async_trait;
use snafu::{IntoError as _, ResultExt as _};
use tonic::{
    client::Grpc,
    codec::ProstCodec,
    codegen::http::uri::PathAndQuery,
    transport::{Channel, Endpoint as ChannelEndpoint},
};
use tracing::debug;

use super::{
    proto::{MultiFieldPutRequest, PutResponse},
    Call, Connect, Connector, NotReady, Session, SessionError,
};
use crate::endpoint::Endpoint;

/// Service/method path of the multi-value put RPC.
pub const MULTI_FIELD_PUT_PATH: &str = "/tsdb.MultiFieldService/MultiFieldPut";

/// Connects to targets over plaintext gRPC.
#[derive(Clone, Debug, Default)]
pub struct GrpcConnector;

#[async_trait]
impl Connector for GrpcConnector {
    type Session = GrpcSession;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Session, SessionError> {
        let channel = ChannelEndpoint::from_shared(endpoint.http_url(""))
            .map_err(|e| connect_failed(endpoint, e))?
            .connect()
            .await
            .map_err(|e| connect_failed(endpoint, e))?;

        debug!(%endpoint, "Connected gRPC channel.");
        Ok(GrpcSession {
            client: Grpc::new(channel),
        })
    }
}

fn connect_failed<E>(endpoint: &Endpoint, e: E) -> SessionError
where
    E: std::error::Error + Send + Sync + 'static,
{
    Connect {
        endpoint: endpoint.clone(),
    }
    .into_error(Box::new(e))
}

/// A live gRPC session to one target.
pub struct GrpcSession {
    client: Grpc<Channel>,
}

#[async_trait]
impl Session for GrpcSession {
    async fn multi_put(&mut self, request: MultiFieldPutRequest) -> Result<bool, SessionError> {
        self.client.ready().await.context(NotReady)?;

        let codec = ProstCodec::<MultiFieldPutRequest, PutResponse>::default();
        let path = PathAndQuery::from_static(MULTI_FIELD_PUT_PATH);
        let response = self
            .client
            .unary(tonic::Request::new(request), path, codec)
            .await
            .context(Call)?;

        Ok(response.into_inner().success)
    }
}
