//! The transaction core of an asynchronous Cloud Spanner client.
//!
//! # Example
//!
//! ```no_run
//! use spanner_txn::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let client = Client::configure()
//!         .database(DatabaseId::new(InstanceId::new("my-gcp-project", "my-instance"), "my-database"))
//!         .connect()
//!         .await?;
//!
//!     // assuming the following table:
//!     //   person(id INT64, name STRING(MAX), data BYTES(MAX))
//!     client
//!         .read_write()
//!         .run(|tx| {
//!             Box::pin(async move {
//!                 tx.run_update(
//!                     Statement::new("INSERT INTO person(id, name, data) VALUES(@id, @name, NULL)")
//!                         .bind("id", &42)?
//!                         .bind("name", &"ferris")?,
//!                 )
//!                 .await
//!             })
//!         })
//!         .await?;
//!
//!     let result_set = client
//!         .single_use(TimestampBound::Strong)
//!         .await?
//!         .run(Statement::new("SELECT * FROM person"))
//!         .await?;
//!
//!     for row in result_set.iter() {
//!         let id: u32 = row.get("id")?;
//!         let name: &str = row.get("name")?;
//!         let data: Option<&[u8]> = row.get("data")?;
//!
//!         println!("found person: {} {} {:?}", id, name, data);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Transactions
//!
//! Cloud Spanner [supports](https://cloud.google.com/spanner/docs/transactions) three kinds of
//! transactions:
//!
//! * read-only, see [`Snapshot`]: consistent reads, no writes;
//! * read-write, see [`Transaction`]: the only way to write, using locks and retries;
//! * partitioned DML, see [`PartitionedDml`]: one large DML statement applied partition by
//!   partition.
//!
//! All of them read through [`ReadContext`]; the ones that run DML implement [`Dml`].
//!
//! ## Read Only
//!
//! [`Client::single_use`] reads in single-use transactions, each seeing the latest data
//! within its [`TimestampBound`]. [`Client::snapshot`] begins the transaction first so that
//! every read sees the same data.
//!
//! ## Read Write
//!
//! A read-write transaction begins with its first query or read: the request carries the
//! options of the new transaction and its response the transaction id. Requests issued
//! before the id is known wait for it and then run in the order they were issued.
//!
//! Mutations are buffered and sent with the commit. A transaction that only buffers
//! mutations commits in a single request.
//!
//! When a transaction conflicts with another one, Cloud Spanner may abort it.
//! [`TransactionRunner`] runs the whole function again in a new transaction when that
//! happens:
//!
//! ```no_run
//! # use spanner_txn::*;
//! # async fn f(client: Client) -> Result<(), Error> {
//! client
//!     .read_write()
//!     .run(|tx| {
//!         // this closure may be invoked more than once
//!         Box::pin(async move {
//!             let rs = tx.run(Statement::new("SELECT id FROM person")).await?;
//!             tx.delete_rows("person", KeySet::all())?;
//!             Ok(rs.len())
//!         })
//!     })
//!     .await?;
//! # Ok(()) }
//! ```
//!
//! ## Sessions
//!
//! Every transaction runs on a session obtained from a [`SessionSource`] and returns it
//! when it ends. [`SessionFactory`] pools regular sessions with [`bb8`] and may hand out a
//! shared multiplexed session instead, as configured by [`SessionOptions`].
//!
//! ## Authentication
//!
//! Authentication uses the [`gcp_auth`] crate which supports several authentication methods.

pub use crate::client::*;
pub use crate::config::*;
pub use crate::connection::{Connection, ResponseStream};
pub use crate::error::Error;
pub use crate::from_spanner::*;
pub use crate::keys::*;
pub use crate::mutation::{Mutation, MutationGroup, MutationRow, MutationSet, Write};
pub use crate::resource::*;
pub use crate::result_set::*;
pub use crate::session::*;
pub use crate::statement::*;
pub use crate::to_spanner::*;
pub use crate::trace::{FinishedSpan, InMemoryTracer, LogTracer, SpanStatus, TraceSpan, Tracer};
pub use crate::transaction::*;
pub use crate::types::*;
pub use crate::value::*;

mod auth;
mod client;
mod config;
mod connection;
mod error;
mod from_spanner;
mod keys;
mod mutation;
pub mod proto;
mod resource;
mod result_set;
mod session;
mod statement;
mod stream;
mod to_spanner;
mod trace;
mod transaction;
mod types;
mod value;
