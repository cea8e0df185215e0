/*!
 * Per-destination controllers
 *
 * One rate limiter and circuit breaker pair per destination (host, base URL
 * or API key), created on first use and shared by every caller after that.
 */

use crate::config::TollgateConfig;
use crate::error::Result;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tollgate_core_resilience::{
    Attempt, AttemptOutcome, Clock, ControllerStatus, ExecutionController, ExecutionError,
    RunContext, TokioClock,
};
use tracing::debug;

/// Lazily built [`ExecutionController`]s keyed by destination
#[derive(Debug)]
pub struct DestinationRegistry {
    config: TollgateConfig,
    default_timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
    controllers: RwLock<HashMap<String, ExecutionController>>,
}

impl DestinationRegistry {
    /// Create an empty registry; fails if `config` is invalid
    pub fn new(config: TollgateConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(TokioClock))
    }

    /// Create a registry whose controllers all read `clock`
    pub fn with_clock(config: TollgateConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            default_timeout: config.request_timeout()?,
            config,
            clock,
            controllers: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &TollgateConfig {
        &self.config
    }

    /// Controller for `destination`, building it on first use
    pub fn controller(&self, destination: &str) -> Result<ExecutionController> {
        {
            let controllers = self.controllers.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(controller) = controllers.get(destination) {
                return Ok(controller.clone());
            }
        }

        let built = ExecutionController::with_clock(
            destination,
            self.config.execution_config(Some(destination))?,
            Arc::clone(&self.clock),
        )?;

        let mut controllers = self.controllers.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have registered it while we were building
        let controller = controllers
            .entry(destination.to_string())
            .or_insert_with(|| {
                debug!(destination, "Registered destination");
                built
            })
            .clone();
        Ok(controller)
    }

    /// Run `attempt_fn` against `destination`.
    ///
    /// The outer `Result` reports registry problems (a destination whose
    /// settings cannot be built); the inner one is the run's own outcome.
    /// Runs without a deadline get `request_timeout_secs`, if configured.
    pub async fn run<T, E, F, Fut>(
        &self,
        destination: &str,
        ctx: &RunContext,
        attempt_fn: F,
    ) -> Result<std::result::Result<T, ExecutionError<E>>>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = AttemptOutcome<T, E>>,
        E: fmt::Display,
    {
        let controller = self.controller(destination)?;
        let outcome = match (ctx.timeout, self.default_timeout) {
            (None, Some(timeout)) => {
                let ctx = ctx.clone().with_timeout(timeout);
                controller.run(&ctx, attempt_fn).await
            }
            _ => controller.run(ctx, attempt_fn).await,
        };
        Ok(outcome)
    }

    /// Names of every registered destination, sorted
    pub fn destinations(&self) -> Vec<String> {
        let controllers = self.controllers.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = controllers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Forget a destination; its next use starts with fresh state
    pub fn remove(&self, destination: &str) -> Option<ExecutionController> {
        self.controllers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(destination)
    }

    /// Status of every registered destination, sorted by name
    pub async fn statuses(&self) -> Vec<ControllerStatus> {
        let controllers: Vec<ExecutionController> = {
            let guard = self.controllers.read().unwrap_or_else(PoisonError::into_inner);
            guard.values().cloned().collect()
        };

        let mut statuses = Vec::with_capacity(controllers.len());
        for controller in controllers {
            statuses.push(controller.status().await);
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}
