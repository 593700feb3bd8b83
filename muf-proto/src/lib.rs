//! Generated gRPC types for the MUF frame transport.

pub mod v1 {
    tonic::include_proto!("muf.v1");
}

pub use v1::frame_router_client::FrameRouterClient;
pub use v1::frame_router_server::{FrameRouter, FrameRouterServer};
pub use v1::Multipart;
