//! fedn-client: federated learning client runtime
//!
//! A client participates in training rounds orchestrated by a remote
//! control plane: it authenticates to the discovery service over HTTP, is
//! assigned to a combiner, opens a long-lived task stream over gRPC and
//! answers task directives (train, validate, predict), each of which
//! downloads a model, invokes user code and streams a result back.
//!
//! ## Architecture
//!
//! - **config**: two immutable records resolved from one flat key-value source
//! - **discovery**: one-shot combiner assignment over the control-plane HTTP API
//! - **channel**: combiner channel construction with composed per-call credentials
//! - **engine**: heartbeat loop, task-stream consumer, chunked model transfer
//! - **scratch**: per-task temporary files and correlation ids
//! - **runtime**: the boot sequence tying the above together

pub mod channel;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod pb;
pub mod runtime;
pub mod scratch;

// Re-export the configuration records
pub use config::{AuthScheme, CombinerConfig, ConfigError, ConfigMap, ControllerConfig};

// Re-export the assignment client
pub use discovery::{Assignment, AssignmentError, DiscoveryClient};

// Re-export channel construction
pub use channel::{CallCredentials, ChannelError, CombinerChannel};

// Re-export the task engine and callback surface
pub use engine::handler::{DefaultTaskHandler, TaskHandler};
pub use engine::{ClientIdentity, EngineError, TaskEngine, TaskSession};

// Re-export the top-level client
pub use runtime::{ClientError, FednClient};
