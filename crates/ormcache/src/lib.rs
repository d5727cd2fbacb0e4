//! ormcache - a transactional record cache for ORM layers.
//!
//! ormcache keeps the records an ORM touches during a transaction in memory
//! and writes them back when the transaction commits:
//!
//! - Identity map keyed by `(model, id)`, with placeholder ids for records
//!   that are not yet in the database
//! - Dotted-path reads and writes across many-to-one relations
//! - Derived one-to-many, reverse one-to-one and many-to-many values
//! - Dependency-ordered flush with cycle detection
//! - Automatic retry of units of work that hit serialization failures
//!
//! # Quick Start
//!
//! ```ignore
//! use ormcache::prelude::*;
//!
//! static CUSTOMER: ModelInfo = ModelInfo::new("customer", "customers", &[
//!     FieldInfo::scalar("name"),
//! ]);
//! static ORDER: ModelInfo = ModelInfo::new("order", "orders", &[
//!     FieldInfo::many2one("customer_id", "customer"),
//! ]);
//!
//! async fn place_order(cx: &Cx, conn: &impl Connection) -> Outcome<i64, Error> {
//!     let registry = Arc::new(Registry::from_models(&[&CUSTOMER, &ORDER])?);
//!     let config = EnvironmentConfig::new(1);
//!     execute_in_new_environment(cx, conn, &registry, &config, async |env| {
//!         let customer = env.create("customer", FieldMap::from([("name".into(), "Jane".into())]))?;
//!         let order = env.create("order", FieldMap::from([("customer_id".into(), customer.id.into())]))?;
//!         Ok(order.id)
//!     })
//!     .await
//! }
//! ```
//!
//! Drivers implement [`Connection`] and [`Cursor`]; everything above them is
//! driver independent.

pub use ormcache_core::{
    CacheError, CacheErrorKind, ConfigError, Connection, ConnectionError, ConnectionErrorKind,
    ConsistencyError, Cursor, Cx, Dialect, Error, FieldInfo, FieldKind, ID_FIELD, IsolationLevel,
    LinkTableInfo, ModelInfo, Outcome, QueryError, QueryErrorKind, Registry, Result, SchemaError,
    SchemaErrorKind, TransactionError, TransactionErrorKind, Value, outcome_into_result,
};
pub use ormcache_session::{
    Cache, CacheRef, Context, DB_SERIALIZATION_MAX_RETRIES, Environment, EnvironmentConfig,
    FieldMap, FlushResult, InsertPlanner, LinkTable, LinkTableOp, PATH_SEPARATOR, PendingOp,
    Statement, execute_in_new_environment, simulate_in_new_environment,
};

/// Common imports.
///
/// ```ignore
/// use ormcache::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Cache, CacheRef, Connection, Cursor, Cx, Environment, EnvironmentConfig, Error, FieldInfo,
        FieldKind, FieldMap, FlushResult, IsolationLevel, LinkTableInfo, ModelInfo, Outcome,
        Registry, Result, Value, execute_in_new_environment, simulate_in_new_environment,
    };
    pub use std::sync::Arc;
}
