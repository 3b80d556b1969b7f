//! Combiner channel construction
//!
//! A pure function of the combiner config: insecure channels carry no
//! credentials at all, TLS channels compose the default trust roots with
//! per-call metadata injectors for `authorization` and `grpc-server`.
//!
//! The `grpc-server` value always names the true combiner host, even when
//! the channel dials a fronting proxy instead: that header is how an L7
//! proxy serving several combiners routes the call.

use std::time::Duration;

use tonic::metadata::AsciiMetadataValue;
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use crate::config::CombinerConfig;

/// Keepalive ping cadence on the combiner channel.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
/// Keepalive ping timeout. The sole liveness backstop for hung streams.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);

/// A combiner channel whose calls carry [`CallCredentials`].
pub type AuthedChannel = InterceptedService<Channel, CallCredentials>;

/// Channel construction errors. Fatal to startup.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid combiner configuration: {0}")]
    ConfigInvalid(String),
    #[error("invalid combiner endpoint '{endpoint}': {source}")]
    Endpoint {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("TLS setup failed: {0}")]
    Tls(#[source] tonic::transport::Error),
}

/// One metadata entry attached to every outgoing call.
#[derive(Debug, Clone)]
pub struct MetadataInjector {
    key: &'static str,
    value: AsciiMetadataValue,
}

impl MetadataInjector {
    /// `authorization: <scheme> <token>`.
    pub fn authorization(header_value: &str) -> Result<Self, ChannelError> {
        Ok(Self {
            key: "authorization",
            value: ascii_value("authorization", header_value)?,
        })
    }

    /// `grpc-server: <host>`, the true combiner host, used by a fronting
    /// proxy to route the call.
    pub fn server_route(host: &str) -> Result<Self, ChannelError> {
        Ok(Self {
            key: "grpc-server",
            value: ascii_value("grpc-server", host)?,
        })
    }
}

fn ascii_value(key: &str, raw: &str) -> Result<AsciiMetadataValue, ChannelError> {
    raw.parse().map_err(|_| {
        ChannelError::ConfigInvalid(format!("metadata value for '{key}' is not valid ASCII"))
    })
}

/// Ordered composition of metadata injectors, applied to every call on the
/// channel. Empty in insecure mode.
#[derive(Debug, Clone, Default)]
pub struct CallCredentials {
    injectors: Vec<MetadataInjector>,
}

impl CallCredentials {
    pub fn is_empty(&self) -> bool {
        self.injectors.is_empty()
    }
}

impl Interceptor for CallCredentials {
    fn call(&mut self, mut req: tonic::Request<()>) -> Result<tonic::Request<()>, tonic::Status> {
        for injector in &self.injectors {
            req.metadata_mut()
                .insert(injector.key, injector.value.clone());
        }
        Ok(req)
    }
}

/// A built combiner channel plus the credentials its calls must carry.
#[derive(Debug, Clone)]
pub struct CombinerChannel {
    pub channel: Channel,
    pub credentials: CallCredentials,
    /// Host actually dialed: the proxy when one is configured, the
    /// combiner itself otherwise. Kept for logging.
    pub dial_target: String,
}

impl CombinerChannel {
    /// Wrap the raw channel with the per-call credentials.
    pub fn authed(&self) -> AuthedChannel {
        InterceptedService::new(self.channel.clone(), self.credentials.clone())
    }
}

/// Host the channel dials: `proxy_host` when set, `host` otherwise.
pub fn dial_host(config: &CombinerConfig) -> &str {
    config.proxy_host.as_deref().unwrap_or(&config.host)
}

/// Build the combiner channel from its config.
///
/// The channel connects lazily; no I/O happens here. Keepalive pings run
/// every 60 s with a 20 s timeout and are permitted without in-flight
/// calls.
pub fn build(config: &CombinerConfig) -> Result<CombinerChannel, ChannelError> {
    if config.host.is_empty() {
        return Err(ChannelError::ConfigInvalid(
            "combiner host is empty".to_string(),
        ));
    }

    let (endpoint_url, credentials) = if config.insecure {
        (format!("http://{}", config.host), CallCredentials::default())
    } else {
        if config.token.is_empty() {
            return Err(ChannelError::ConfigInvalid(
                "secure mode requires a non-empty token".to_string(),
            ));
        }
        let header_value = format!("{} {}", config.auth_scheme, config.token);
        let credentials = CallCredentials {
            injectors: vec![
                MetadataInjector::authorization(&header_value)?,
                MetadataInjector::server_route(&config.host)?,
            ],
        };
        (format!("https://{}", dial_host(config)), credentials)
    };

    let mut endpoint =
        Endpoint::from_shared(endpoint_url.clone()).map_err(|source| ChannelError::Endpoint {
            endpoint: endpoint_url.clone(),
            source,
        })?;

    if !config.insecure {
        endpoint = endpoint
            .tls_config(ClientTlsConfig::new().with_native_roots())
            .map_err(ChannelError::Tls)?;
    }

    let channel = endpoint
        .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
        .keep_alive_timeout(KEEPALIVE_TIMEOUT)
        .keep_alive_while_idle(true)
        .connect_lazy();

    Ok(CombinerChannel {
        channel,
        credentials,
        dial_target: dial_host(config).to_string(),
    })
}
