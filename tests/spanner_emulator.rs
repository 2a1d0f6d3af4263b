//! Runs the Cloud Spanner emulator in docker, one container and database per test.

use spanner_txn::{Client, DatabaseId, Error, InstanceId, SessionOptions, SpannerResource};

use ctor::ctor;
use std::ops::Deref;
use testcontainers::images::generic::{GenericImage, WaitFor};
use testcontainers::{clients, Container, Docker};

const EMULATOR_IMAGE: &str = "gcr.io/cloud-spanner-emulator/emulator";
const GRPC_PORT: u16 = 9010;
const REST_PORT: u16 = 9020;

#[ctor]
static DOCKER: clients::Cli = clients::Cli::default();

/// The database a test runs against: its schema and how the client uses sessions.
pub(crate) struct TestDatabase {
    ddl: Vec<String>,
    sessions: SessionOptions,
}

impl TestDatabase {
    pub(crate) fn with_ddl(statements: &[&str]) -> Self {
        Self {
            ddl: statements.iter().map(|s| s.to_string()).collect(),
            sessions: SessionOptions::default(),
        }
    }

    /// Routes every kind of transaction through the multiplexed session.
    #[allow(dead_code)]
    pub(crate) fn multiplexed(mut self) -> Self {
        self.sessions.multiplexed = true;
        self.sessions.multiplexed_for_rw = true;
        self.sessions.multiplexed_for_partitioned_ops = true;
        self
    }

    /// Starts an emulator, creates the database and connects a client to it.
    pub(crate) async fn start<'a>(self) -> Result<EmulatedClient<'a>, Error> {
        let _ = env_logger::builder().is_test(true).try_init();

        let container = DOCKER.run(
            GenericImage::new(EMULATOR_IMAGE)
                .with_wait_for(WaitFor::message_on_stderr("gRPC server listening")),
        );
        let admin = Admin {
            port: container
                .get_host_port(REST_PORT)
                .expect("emulator REST port is not mapped"),
        };

        let instance = InstanceId::new("test-project", "test-instance");
        let database = DatabaseId::new(instance.clone(), "test-database");
        admin.create_instance(&instance).await;
        admin.create_database(&database, &self.ddl).await;

        let grpc_port = container
            .get_host_port(GRPC_PORT)
            .expect("emulator gRPC port is not mapped");
        let client = Client::configure()
            .with_emulator_grpc_port(grpc_port)
            .database(database)
            .session(self.sessions)
            .connect()
            .await?;

        Ok(EmulatedClient {
            _container: container,
            client,
        })
    }
}

/// The instance and database admin endpoints, served by the emulator's REST gateway.
struct Admin {
    port: u16,
}

impl Admin {
    async fn create_instance(&self, instance: &InstanceId) {
        self.post(
            instance.resources_id(),
            format!(r#"{{"instanceId": "{}"}}"#, instance.name()),
        )
        .await
    }

    async fn create_database(&self, database: &DatabaseId, ddl: &[String]) {
        let statements = ddl
            .iter()
            .map(|statement| format!(r#""{}""#, statement.replace('"', r#"\""#)))
            .collect::<Vec<_>>()
            .join(",");
        self.post(
            database.resources_id(),
            format!(
                r#"{{"createStatement": "CREATE DATABASE `{}`", "extraStatements": [{}]}}"#,
                database.name(),
                statements,
            ),
        )
        .await
    }

    async fn post(&self, path: String, body: String) {
        let response = reqwest::Client::new()
            .post(format!("http://localhost:{}/v1/{}", self.port, path))
            .body(body)
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success(), "{:?}", response);
    }
}

/// A client to an emulated database. Dropping it stops the emulator.
pub(crate) struct EmulatedClient<'a> {
    _container: Container<'a, clients::Cli, GenericImage>,
    client: Client,
}

impl<'a> Deref for EmulatedClient<'a> {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}
