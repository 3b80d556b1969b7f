//! Generated protocol types for the `fedn` RPC surface.
//!
//! The code under `generated/` is committed output of `tonic-build` over
//! `proto/fedn.proto`; see the header of that file for the regeneration
//! recipe. Client stubs are consumed by the engine, server stubs exist for
//! in-process mock combiners in the integration tests.

#![allow(clippy::all)]

include!("generated/fedn.rs");

pub use combiner_client::CombinerClient;
pub use connector_client::ConnectorClient;
pub use model_service_client::ModelServiceClient;
