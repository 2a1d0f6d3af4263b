use std::sync::Arc;
use std::time::Duration;

use derive_builder::Builder;
use gcp_auth::AuthenticationManager;
use tonic::transport::ClientTlsConfig;

use crate::trace::{LogTracer, Tracer};
use crate::transaction::{DirectedReadOptions, IsolationLevel};
use crate::{Client, DatabaseId, Error, QueryOptions};

const EMULATOR_HOST_ENV: &str = "SPANNER_EMULATOR_HOST";
const MULTIPLEXED_ENV: &str = "GOOGLE_CLOUD_SPANNER_MULTIPLEXED_SESSIONS";
const MULTIPLEXED_PARTITIONED_ENV: &str =
    "GOOGLE_CLOUD_SPANNER_MULTIPLEXED_SESSIONS_PARTITIONED_OPS";
const MULTIPLEXED_RW_ENV: &str = "GOOGLE_CLOUD_SPANNER_MULTIPLEXED_SESSIONS_FOR_RW";

/// Sizing of the session pool and use of multiplexed sessions.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionOptions {
    pub min_sessions: u32,
    pub max_sessions: u32,
    /// How long to wait for a pooled session before failing.
    pub acquire_timeout: Duration,
    /// Use a multiplexed session for read-only transactions.
    pub multiplexed: bool,
    /// Use a multiplexed session for partitioned DML (requires `multiplexed`).
    pub multiplexed_for_partitioned_ops: bool,
    /// Use a multiplexed session for read-write transactions (requires `multiplexed`).
    pub multiplexed_for_rw: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            min_sessions: 0,
            max_sessions: 100,
            acquire_timeout: Duration::from_secs(30),
            multiplexed: false,
            multiplexed_for_partitioned_ops: false,
            multiplexed_for_rw: false,
        }
    }
}

impl SessionOptions {
    /// Defaults, with the multiplexed session flags read from the environment.
    pub fn from_env() -> Self {
        let flag = |name: &str| {
            std::env::var(name)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };
        let multiplexed = flag(MULTIPLEXED_ENV);
        Self {
            multiplexed,
            multiplexed_for_partitioned_ops: multiplexed && flag(MULTIPLEXED_PARTITIONED_ENV),
            multiplexed_for_rw: multiplexed && flag(MULTIPLEXED_RW_ENV),
            ..Default::default()
        }
    }
}

/// Client configuration.
///
/// ```no_run
/// # use spanner_txn::*;
/// # #[tokio::main]
/// # async fn main() -> Result<(), Error> {
/// let client = Config::builder()
///     .database(DatabaseId::new(InstanceId::new("my-project", "my-instance"), "my-db"))
///     .connect()
///     .await?;
/// # Ok(()) }
/// ```
#[derive(Builder, Clone)]
#[builder(pattern = "owned", build_fn(error = "crate::Error"))]
pub struct Config {
    #[builder(setter(into, strip_option), default)]
    pub(crate) endpoint: Option<String>,
    #[builder(setter(strip_option), default = "Some(ClientTlsConfig::new())")]
    pub(crate) tls_config: Option<ClientTlsConfig>,
    #[builder(setter(strip_option), default)]
    pub(crate) auth: Option<Arc<AuthenticationManager>>,
    pub(crate) database: DatabaseId,
    #[builder(default = "SessionOptions::from_env()")]
    pub(crate) session: SessionOptions,
    /// Isolation level of read-write transactions that do not set their own.
    #[builder(default)]
    pub(crate) default_isolation_level: IsolationLevel,
    /// Applied to read-only requests that do not carry their own.
    #[builder(setter(strip_option), default)]
    pub(crate) directed_read_options: Option<DirectedReadOptions>,
    #[builder(setter(strip_option), default)]
    pub(crate) query_options: Option<QueryOptions>,
    /// Total time a transaction runner keeps retrying.
    #[builder(default = "Duration::from_secs(60 * 60)")]
    pub(crate) transaction_deadline: Duration,
    #[builder(default = "Arc::new(LogTracer)")]
    pub(crate) tracer: Arc<dyn Tracer>,
    /// Talk to the Cloud Spanner emulator: no TLS, no authentication.
    #[builder(default)]
    pub(crate) emulator: bool,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn database(&self) -> &DatabaseId {
        &self.database
    }

    /// Resolves the emulator host from `SPANNER_EMULATOR_HOST` when no endpoint was given.
    pub(crate) fn resolve_emulator(mut self) -> Self {
        if self.endpoint.is_none() {
            if let Ok(host) = std::env::var(EMULATOR_HOST_ENV) {
                self.endpoint = Some(format!("http://{}", host));
                self.emulator = true;
            }
        }
        if self.emulator {
            self.tls_config = None;
            self.auth = None;
        }
        self
    }
}

impl ConfigBuilder {
    /// Connects to an emulator listening for gRPC on `localhost:port`.
    pub fn with_emulator_grpc_port(self, port: u16) -> Self {
        self.with_emulator_host(format!("localhost:{}", port))
    }

    /// Connects to an emulator at `host:port` without TLS or authentication.
    pub fn with_emulator_host(mut self, host: String) -> Self {
        self.endpoint = Some(Some(format!("http://{}", host)));
        self.tls_config = Some(None);
        self.auth = Some(None);
        self.emulator = Some(true);
        self
    }

    pub fn disable_tls(mut self) -> Self {
        self.tls_config = Some(None);
        self
    }

    pub async fn connect(self) -> Result<Client, Error> {
        Client::connect(self.build()?).await
    }
}
