//! Wire types for the ping service.
//!
//! The message and the unary client/server plumbing are written out
//! directly against prost/tonic rather than generated from a .proto file,
//! so the workspace builds without a protoc toolchain. The wire format is
//! standard proto3: anything speaking `pacer.PingServer/Ping` with the
//! field numbers below interoperates.

/// Echoed back verbatim by the server, with `ts` stamped on receipt.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingMessage {
    #[prost(int64, tag = "1")]
    pub seq: i64,
    /// Server receive time, nanoseconds since the epoch.
    #[prost(int64, tag = "2")]
    pub ts: i64,
    #[prost(string, tag = "3")]
    pub payload: ::prost::alloc::string::String,
    /// Artificial response delay requested by the client.
    #[prost(int64, tag = "4")]
    pub delay_nanos: i64,
}

const PING_METHOD_PATH: &str = "/pacer.PingServer/Ping";

pub mod ping_client {
    use super::PingMessage;
    use tonic::codegen::*;

    #[derive(Debug, Clone)]
    pub struct PingClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl PingClient<tonic::transport::Channel> {
        pub fn new(channel: tonic::transport::Channel) -> Self {
            Self {
                inner: tonic::client::Grpc::new(channel),
            }
        }
    }

    impl<T> PingClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        pub async fn ping(
            &mut self,
            request: impl tonic::IntoRequest<PingMessage>,
        ) -> std::result::Result<tonic::Response<PingMessage>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("service not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(super::PING_METHOD_PATH);
            self.inner.unary(request.into_request(), path, codec).await
        }
    }
}

pub mod ping_server {
    use super::PingMessage;
    use tonic::codegen::*;

    #[async_trait]
    pub trait Ping: Send + Sync + 'static {
        async fn ping(
            &self,
            request: tonic::Request<PingMessage>,
        ) -> std::result::Result<tonic::Response<PingMessage>, tonic::Status>;
    }

    #[derive(Debug)]
    pub struct PingServer<T> {
        inner: Arc<T>,
    }

    impl<T> PingServer<T> {
        pub fn new(inner: T) -> Self {
            Self {
                inner: Arc::new(inner),
            }
        }
    }

    impl<T> Clone for PingServer<T> {
        fn clone(&self) -> Self {
            Self {
                inner: Arc::clone(&self.inner),
            }
        }
    }

    impl<T, B> tonic::codegen::Service<http::Request<B>> for PingServer<T>
    where
        T: Ping,
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = std::convert::Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(
            &mut self,
            _cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            match req.uri().path() {
                super::PING_METHOD_PATH => {
                    struct PingSvc<T>(Arc<T>);
                    impl<T: Ping> tonic::server::UnaryService<PingMessage> for PingSvc<T> {
                        type Response = PingMessage;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;

                        fn call(
                            &mut self,
                            request: tonic::Request<PingMessage>,
                        ) -> Self::Future {
                            let inner = Arc::clone(&self.0);
                            Box::pin(async move { inner.ping(request).await })
                        }
                    }
                    let inner = Arc::clone(&self.inner);
                    Box::pin(async move {
                        let method = PingSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec);
                        Ok(grpc.unary(method, req).await)
                    })
                }
                _ => Box::pin(async move {
                    Ok(http::Response::builder()
                        .status(http::StatusCode::OK)
                        .header("grpc-status", "12")
                        .header("content-type", "application/grpc")
                        .body(empty_body())
                        .expect("static unimplemented response"))
                }),
            }
        }
    }

    impl<T: Ping> tonic::server::NamedService for PingServer<T> {
        const NAME: &'static str = "pacer.PingServer";
    }
}
