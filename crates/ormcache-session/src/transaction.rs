//! Running units of work inside fresh environments.
//!
//! [`execute_in_new_environment`] commits the work and retries it when the
//! database reports a serialization failure. [`simulate_in_new_environment`]
//! runs the same work and always rolls back.

use crate::config::EnvironmentConfig;
use crate::environment::Environment;
use asupersync::{Cx, Outcome};
use ormcache_core::{Connection, Error, Registry, Result};
use std::sync::Arc;

/// Open a transaction and wrap it in a fresh environment.
async fn open<'c, C: Connection>(
    cx: &Cx,
    conn: &'c C,
    registry: &Arc<Registry>,
    config: &EnvironmentConfig,
    attempt: u32,
) -> Outcome<Environment<C::Tx<'c>>, Error> {
    conn.begin_with(cx, config.isolation)
        .await
        .map(|tx| Environment::new(tx, Arc::clone(registry), config).with_attempt(attempt))
}

/// Run `work` in a new environment and commit.
///
/// Each attempt gets its own transaction and an empty cache. If the work or
/// the commit fails with a serialization failure the transaction is rolled
/// back and the work runs again, up to `config.max_attempts` times in total.
/// Any other error rolls back and is returned at once.
#[tracing::instrument(level = "info", skip_all, fields(uid = config.uid))]
pub async fn execute_in_new_environment<'c, C, F, R>(
    cx: &Cx,
    conn: &'c C,
    registry: &Arc<Registry>,
    config: &EnvironmentConfig,
    mut work: F,
) -> Outcome<R, Error>
where
    C: Connection,
    F: AsyncFnMut(&mut Environment<C::Tx<'c>>) -> Result<R>,
{
    if let Err(e) = config.validate() {
        return Outcome::Err(e);
    }

    let mut attempt = 1;
    loop {
        let mut env = match open(cx, conn, registry, config, attempt).await {
            Outcome::Ok(env) => env,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let error = match work(&mut env).await {
            Ok(value) => match env.commit(cx).await {
                Outcome::Ok(_) => return Outcome::Ok(value),
                // The environment has already been rolled back or consumed.
                Outcome::Err(e) => e,
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            },
            Err(e) => {
                env.discard(cx).await;
                e
            }
        };

        if !error.is_serialization_failure() || attempt >= config.max_attempts {
            if error.is_serialization_failure() {
                tracing::warn!(
                    attempts = attempt,
                    error = %error,
                    "Serialization failures exhausted retries"
                );
            }
            return Outcome::Err(error);
        }

        tracing::warn!(
            attempt,
            max_attempts = config.max_attempts,
            error = %error,
            "Serialization failure, retrying in a new environment"
        );
        attempt += 1;
    }
}

/// Run `work` in a new environment and roll everything back.
///
/// Nothing is flushed. The return value of `work` is passed through; it is
/// never retried.
#[tracing::instrument(level = "info", skip_all, fields(uid = config.uid))]
pub async fn simulate_in_new_environment<'c, C, F, R>(
    cx: &Cx,
    conn: &'c C,
    registry: &Arc<Registry>,
    config: &EnvironmentConfig,
    mut work: F,
) -> Outcome<R, Error>
where
    C: Connection,
    F: AsyncFnMut(&mut Environment<C::Tx<'c>>) -> Result<R>,
{
    let mut env = match open(cx, conn, registry, config, 1).await {
        Outcome::Ok(env) => env,
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };

    let result = work(&mut env).await;
    match env.rollback(cx).await {
        Outcome::Ok(()) => {}
        Outcome::Err(e) => {
            tracing::warn!(error = %e, "Rollback of simulated environment failed");
            if result.is_ok() {
                return Outcome::Err(e);
            }
        }
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    }
    match result {
        Ok(value) => Outcome::Ok(value),
        Err(e) => Outcome::Err(e),
    }
}
