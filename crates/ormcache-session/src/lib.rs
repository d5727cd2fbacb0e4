//! Record cache and unit of work for ormcache.
//!
//! `ormcache-session` sits between an ORM layer and its database. It keeps
//! every record read or written during a transaction in an identity map,
//! tracks which fields changed, and writes the changes back in dependency
//! order when the transaction commits.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one cache slot per `(model, id)`; placeholder ids
//!   (`id <= 0`) stand for records not yet inserted.
//! - **Change tracking**: scheduled inserts, dirty fields and link-table
//!   syncs are recorded as values are written.
//! - **Flush**: inserts run dependencies first, then updates, then link
//!   tables.
//! - **Retry**: a unit of work that hits a serialization failure is rolled
//!   back and run again in a fresh environment.
//!
//! # Example
//!
//! ```ignore
//! let config = EnvironmentConfig::new(uid);
//! let order = execute_in_new_environment(&cx, &conn, &registry, &config, async |env| {
//!     let customer = env.create("customer", FieldMap::from([("name".into(), "Jane".into())]))?;
//!     env.create("order", FieldMap::from([("customer_id".into(), customer.id.into())]))
//! })
//! .await;
//! ```

pub mod cache;
pub mod config;
pub mod environment;
pub mod flush;
pub mod links;
pub mod transaction;

pub use cache::{Cache, CacheRef, FieldMap, PATH_SEPARATOR};
pub use config::{Context, DB_SERIALIZATION_MAX_RETRIES, EnvironmentConfig};
pub use environment::Environment;
pub use flush::{FlushResult, InsertPlanner, LinkTableOp, PendingOp, Statement};
pub use links::LinkTable;
pub use transaction::{execute_in_new_environment, simulate_in_new_environment};
