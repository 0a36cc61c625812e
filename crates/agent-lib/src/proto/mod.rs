//! Protobuf bindings
//!
//! Two packages are bound here:
//! - `perfscope.v1`: the Profile service exposed by the node agent
//! - `runtime.v1`: the subset of the CRI runtime API used to resolve a
//!   container to its host pid
//!
//! The checked-in bindings mirror what tonic-build emits for `proto/`.
//! Build with the `proto-gen` feature to regenerate them with protoc instead.

#[cfg(feature = "proto-gen")]
pub mod perfscope {
    pub mod v1 {
        tonic::include_proto!("perfscope.v1");
    }
}

#[cfg(feature = "proto-gen")]
pub mod runtime {
    pub mod v1 {
        tonic::include_proto!("runtime.v1");
    }
}

#[cfg(not(feature = "proto-gen"))]
pub mod perfscope {
    pub mod v1 {
        use prost::Message;

        #[derive(Clone, PartialEq, Message)]
        pub struct PerfProfileRequest {
            #[prost(string, tag = "1")]
            pub container_id: String,
            #[prost(message, optional, tag = "2")]
            pub timeout: Option<prost_types::Duration>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct PerfProfileResponse {
            #[prost(bytes = "vec", tag = "1")]
            pub data: Vec<u8>,
        }

        pub mod profiler_client {
            use super::*;
            use tonic::codegen::*;

            #[derive(Debug, Clone)]
            pub struct ProfilerClient<T> {
                inner: tonic::client::Grpc<T>,
            }

            impl ProfilerClient<tonic::transport::Channel> {
                pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
                where
                    D: TryInto<tonic::transport::Endpoint>,
                    D::Error: Into<StdError>,
                {
                    let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
                    Ok(Self::new(conn))
                }
            }

            impl<T> ProfilerClient<T>
            where
                T: tonic::client::GrpcService<tonic::body::BoxBody>,
                T::Error: Into<StdError>,
                T::ResponseBody: Body<Data = Bytes> + Send + 'static,
                <T::ResponseBody as Body>::Error: Into<StdError> + Send,
            {
                pub fn new(inner: T) -> Self {
                    let inner = tonic::client::Grpc::new(inner);
                    Self { inner }
                }

                pub async fn profile(
                    &mut self,
                    request: impl tonic::IntoRequest<PerfProfileRequest>,
                ) -> Result<tonic::Response<tonic::codec::Streaming<PerfProfileResponse>>, tonic::Status>
                {
                    self.inner.ready().await.map_err(|e| {
                        tonic::Status::new(
                            tonic::Code::Unknown,
                            format!("Service was not ready: {}", e.into()),
                        )
                    })?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path =
                        http::uri::PathAndQuery::from_static("/perfscope.v1.Profiler/Profile");
                    self.inner
                        .server_streaming(request.into_request(), path, codec)
                        .await
                }
            }
        }

        pub mod profiler_server {
            use super::*;
            use tonic::codegen::*;

            #[async_trait]
            pub trait Profiler: Send + Sync + 'static {
                type ProfileStream: ::tokio_stream::Stream<Item = Result<PerfProfileResponse, tonic::Status>>
                    + Send
                    + 'static;

                async fn profile(
                    &self,
                    request: tonic::Request<PerfProfileRequest>,
                ) -> Result<tonic::Response<Self::ProfileStream>, tonic::Status>;
            }

            #[derive(Debug)]
            pub struct ProfilerServer<T: Profiler> {
                inner: Arc<T>,
            }

            impl<T: Profiler> ProfilerServer<T> {
                pub fn new(inner: T) -> Self {
                    Self::from_arc(Arc::new(inner))
                }

                pub fn from_arc(inner: Arc<T>) -> Self {
                    Self { inner }
                }
            }

            impl<T, B> Service<http::Request<B>> for ProfilerServer<T>
            where
                T: Profiler,
                B: Body + Send + 'static,
                B::Error: Into<StdError> + Send + 'static,
            {
                type Response = http::Response<tonic::body::BoxBody>;
                type Error = std::convert::Infallible;
                type Future = BoxFuture<Self::Response, Self::Error>;

                fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
                    Poll::Ready(Ok(()))
                }

                fn call(&mut self, req: http::Request<B>) -> Self::Future {
                    match req.uri().path() {
                        "/perfscope.v1.Profiler/Profile" => {
                            struct ProfileSvc<T: Profiler>(pub Arc<T>);

                            impl<T: Profiler> tonic::server::ServerStreamingService<PerfProfileRequest>
                                for ProfileSvc<T>
                            {
                                type Response = PerfProfileResponse;
                                type ResponseStream = T::ProfileStream;
                                type Future =
                                    BoxFuture<tonic::Response<Self::ResponseStream>, tonic::Status>;

                                fn call(
                                    &mut self,
                                    request: tonic::Request<PerfProfileRequest>,
                                ) -> Self::Future {
                                    let inner = Arc::clone(&self.0);
                                    Box::pin(async move { inner.profile(request).await })
                                }
                            }

                            let inner = Arc::clone(&self.inner);
                            Box::pin(async move {
                                let method = ProfileSvc(inner);
                                let codec = tonic::codec::ProstCodec::default();
                                let mut grpc = tonic::server::Grpc::new(codec);
                                let res = grpc.server_streaming(method, req).await;
                                Ok(res)
                            })
                        }
                        _ => Box::pin(async move {
                            let mut response = http::Response::new(empty_body());
                            let headers = response.headers_mut();
                            headers.insert(
                                "grpc-status",
                                http::HeaderValue::from_static("12"), // Unimplemented
                            );
                            headers.insert(
                                http::header::CONTENT_TYPE,
                                http::HeaderValue::from_static("application/grpc"),
                            );
                            Ok(response)
                        }),
                    }
                }
            }

            impl<T: Profiler> Clone for ProfilerServer<T> {
                fn clone(&self) -> Self {
                    Self {
                        inner: Arc::clone(&self.inner),
                    }
                }
            }

            impl<T: Profiler> tonic::server::NamedService for ProfilerServer<T> {
                const NAME: &'static str = "perfscope.v1.Profiler";
            }
        }
    }
}

#[cfg(not(feature = "proto-gen"))]
pub mod runtime {
    pub mod v1 {
        use prost::Message;

        #[derive(Clone, PartialEq, Message)]
        pub struct ContainerStatusRequest {
            #[prost(string, tag = "1")]
            pub container_id: String,
            #[prost(bool, tag = "2")]
            pub verbose: bool,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct ContainerStatus {
            #[prost(string, tag = "1")]
            pub id: String,
            #[prost(enumeration = "ContainerState", tag = "3")]
            pub state: i32,
            #[prost(int64, tag = "4")]
            pub created_at: i64,
            #[prost(int64, tag = "5")]
            pub started_at: i64,
            #[prost(int64, tag = "6")]
            pub finished_at: i64,
            #[prost(int32, tag = "7")]
            pub exit_code: i32,
            #[prost(string, tag = "10")]
            pub reason: String,
            #[prost(string, tag = "11")]
            pub message: String,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct ContainerStatusResponse {
            #[prost(message, optional, tag = "1")]
            pub status: Option<ContainerStatus>,
            #[prost(map = "string, string", tag = "2")]
            pub info: std::collections::HashMap<String, String>,
        }

        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration,
        )]
        #[repr(i32)]
        pub enum ContainerState {
            ContainerCreated = 0,
            ContainerRunning = 1,
            ContainerExited = 2,
            ContainerUnknown = 3,
        }

        impl ContainerState {
            pub fn as_str_name(&self) -> &'static str {
                match self {
                    ContainerState::ContainerCreated => "CONTAINER_CREATED",
                    ContainerState::ContainerRunning => "CONTAINER_RUNNING",
                    ContainerState::ContainerExited => "CONTAINER_EXITED",
                    ContainerState::ContainerUnknown => "CONTAINER_UNKNOWN",
                }
            }
        }

        pub mod runtime_service_client {
            use super::*;
            use tonic::codegen::*;

            #[derive(Debug, Clone)]
            pub struct RuntimeServiceClient<T> {
                inner: tonic::client::Grpc<T>,
            }

            impl<T> RuntimeServiceClient<T>
            where
                T: tonic::client::GrpcService<tonic::body::BoxBody>,
                T::Error: Into<StdError>,
                T::ResponseBody: Body<Data = Bytes> + Send + 'static,
                <T::ResponseBody as Body>::Error: Into<StdError> + Send,
            {
                pub fn new(inner: T) -> Self {
                    let inner = tonic::client::Grpc::new(inner);
                    Self { inner }
                }

                pub async fn container_status(
                    &mut self,
                    request: impl tonic::IntoRequest<ContainerStatusRequest>,
                ) -> Result<tonic::Response<ContainerStatusResponse>, tonic::Status> {
                    self.inner.ready().await.map_err(|e| {
                        tonic::Status::new(
                            tonic::Code::Unknown,
                            format!("Service was not ready: {}", e.into()),
                        )
                    })?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path = http::uri::PathAndQuery::from_static(
                        "/runtime.v1.RuntimeService/ContainerStatus",
                    );
                    self.inner.unary(request.into_request(), path, codec).await
                }
            }
        }
    }
}

pub use perfscope::v1::profiler_client::ProfilerClient;
pub use perfscope::v1::profiler_server::{Profiler, ProfilerServer};
pub use perfscope::v1::{PerfProfileRequest, PerfProfileResponse};
pub use runtime::v1::runtime_service_client::RuntimeServiceClient;
