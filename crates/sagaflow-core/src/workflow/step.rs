use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use super::context::StepContext;
use crate::error::StepError;

/// Boxed future returned by erased step functions.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

type ForwardFn =
    Arc<dyn Fn(Value, StepContext) -> BoxFuture<Result<StepOutput, StepError>> + Send + Sync>;

type CompensateFn =
    Arc<dyn Fn(Value, StepContext) -> BoxFuture<Result<(), StepError>> + Send + Sync>;

/// Step execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step not yet started.
    Pending,
    /// Step currently running.
    Running,
    /// Step completed successfully.
    Completed,
    /// Step failed.
    Failed,
    /// Step compensation ran.
    Compensated,
    /// Step compensation failed.
    CompensationFailed,
}

impl StepStatus {
    /// Convert to string for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Compensated => "compensated",
            Self::CompensationFailed => "compensation_failed",
        }
    }
}

/// What a step does to the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// May mutate; compensable when a compensation is registered.
    Action,
    /// Side-effect free read; never compensated.
    Read,
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay each time.
    Fixed,
    /// Delay increases linearly.
    Linear,
    /// Delay doubles each time.
    Exponential,
}

/// Opt-in retry policy for a step's forward function.
///
/// The default policy makes a single attempt. Compensations are never
/// retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self::default()
    }

    /// Up to `max_attempts` attempts with exponential backoff.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before the attempt following the `attempt`-th failure.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let backoff = match self.backoff {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt.max(1)),
            BackoffStrategy::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1))),
        };
        backoff.min(self.max_delay)
    }

    /// Whether a failure on `attempt` should be followed by another attempt.
    pub fn should_retry(&self, attempt: u32, error: &StepError) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }
}

/// Output of a forward function plus an optional compensation payload.
///
/// Without an explicit payload the compensation receives the output, or
/// the step input when the output is `null`.
#[derive(Debug, Clone)]
pub struct StepResponse<O> {
    pub output: O,
    pub compensation_input: Option<Value>,
}

impl<O> StepResponse<O> {
    pub fn new(output: O) -> Self {
        Self {
            output,
            compensation_input: None,
        }
    }

    /// Hand `data` to the compensation instead of the output.
    pub fn compensate_with<C: Serialize>(mut self, data: C) -> Result<Self, StepError> {
        self.compensation_input = Some(serde_json::to_value(data)?);
        Ok(self)
    }
}

/// Erased result of a forward invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub output: Value,
    pub compensation_input: Option<Value>,
}

/// A named unit of work with an optional compensating action.
///
/// ```ignore
/// let charge = StepDefinition::new("charge-card", |input: Charge, _ctx| async move {
///     payments::charge(&input).await.map_err(StepError::failed)
/// })
/// .compensate(|receipt: Receipt, _ctx| async move {
///     payments::refund(&receipt.id).await.map_err(StepError::failed)
/// })
/// .retry(RetryPolicy::attempts(3));
/// ```
pub struct StepDefinition {
    name: String,
    kind: StepKind,
    description: Option<String>,
    forward: ForwardFn,
    compensate: Option<CompensateFn>,
    retry: RetryPolicy,
    timeout: Option<Duration>,
}

impl StepDefinition {
    /// Define a step whose forward function returns its output directly.
    pub fn new<I, O, F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, StepError>> + Send + 'static,
    {
        Self::with_response(name, move |input: I, ctx| {
            let fut = f(input, ctx);
            async move { fut.await.map(StepResponse::new) }
        })
    }

    /// Define a step whose forward function returns a [`StepResponse`].
    pub fn with_response<I, O, F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepResponse<O>, StepError>> + Send + 'static,
    {
        let name = name.into();
        let step_name = name.clone();
        let forward: ForwardFn = Arc::new(
            move |input: Value, ctx: StepContext| -> BoxFuture<Result<StepOutput, StepError>> {
                let typed: I = match serde_json::from_value(input) {
                    Ok(typed) => typed,
                    Err(e) => {
                        let error = StepError::serialization(format!(
                            "invalid input for step '{}': {}",
                            step_name, e
                        ));
                        return Box::pin(async move { Err::<StepOutput, StepError>(error) });
                    }
                };
                let fut = f(typed, ctx);
                Box::pin(async move {
                    let response = fut.await?;
                    Ok::<_, StepError>(StepOutput {
                        output: serde_json::to_value(response.output)?,
                        compensation_input: response.compensation_input,
                    })
                })
            },
        );

        Self {
            name,
            kind: StepKind::Action,
            description: None,
            forward,
            compensate: None,
            retry: RetryPolicy::default(),
            timeout: None,
        }
    }

    /// Set the compensation function (rollback handler).
    pub fn compensate<C, F, Fut>(mut self, f: F) -> Self
    where
        C: DeserializeOwned + Send + 'static,
        F: Fn(C, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        let step_name = self.name.clone();
        let compensate: CompensateFn = Arc::new(
            move |payload: Value, ctx: StepContext| -> BoxFuture<Result<(), StepError>> {
                match serde_json::from_value::<C>(payload) {
                    Ok(typed) => Box::pin(f(typed, ctx)),
                    Err(e) => {
                        let error = StepError::serialization(format!(
                            "invalid compensation input for step '{}': {}",
                            step_name, e
                        ));
                        Box::pin(async move { Err::<(), StepError>(error) })
                    }
                }
            },
        );
        self.compensate = Some(compensate);
        self
    }

    /// Opt into retrying the forward function.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Bound each forward attempt.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Turn the definition into a read step. Drops any compensation.
    pub(crate) fn into_read(mut self) -> Self {
        self.kind = StepKind::Read;
        self.compensate = None;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether rollback will invoke anything for this step.
    pub fn is_compensable(&self) -> bool {
        self.kind == StepKind::Action && self.compensate.is_some()
    }

    /// Invoke the forward function once.
    pub fn invoke(&self, input: Value, ctx: StepContext) -> BoxFuture<Result<StepOutput, StepError>> {
        (self.forward)(input, ctx)
    }

    /// Invoke the compensation function, if the step is compensable.
    pub fn invoke_compensation(
        &self,
        payload: Value,
        ctx: StepContext,
    ) -> Option<BoxFuture<Result<(), StepError>>> {
        if !self.is_compensable() {
            return None;
        }
        self.compensate.as_ref().map(|f| f(payload, ctx))
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("compensable", &self.is_compensable())
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Shared, immutable reference to a registered step.
#[derive(Debug, Clone)]
pub struct StepHandle(Arc<StepDefinition>);

impl StepHandle {
    pub fn new(definition: StepDefinition) -> Self {
        Self(Arc::new(definition))
    }

    /// Check if two handles point at the same definition.
    pub fn same_as(&self, other: &StepHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for StepHandle {
    type Target = StepDefinition;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<StepDefinition> for StepHandle {
    fn from(definition: StepDefinition) -> Self {
        Self::new(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::context::ExecutionContext;
    use serde_json::json;
    use uuid::Uuid;

    fn step_ctx() -> StepContext {
        StepContext::new(
            ExecutionContext::new(Uuid::new_v4(), "test", json!({})),
            "node",
            1,
        )
    }

    #[test]
    fn test_step_status_conversion() {
        assert_eq!(StepStatus::Pending.as_str(), "pending");
        assert_eq!(StepStatus::Completed.as_str(), "completed");
        assert_eq!(StepStatus::Compensated.as_str(), "compensated");
        assert_eq!(
            StepStatus::CompensationFailed.as_str(),
            "compensation_failed"
        );
    }

    #[test]
    fn test_retry_policy_defaults_to_single_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.should_retry(1, &StepError::failed("x")));
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy::attempts(5).with_base_delay(Duration::from_millis(100));
        assert_eq!(policy.calculate_backoff(1), Duration::from_millis(100));
        assert_eq!(policy.calculate_backoff(2), Duration::from_millis(200));
        assert_eq!(policy.calculate_backoff(3), Duration::from_millis(400));

        let linear = policy.clone().with_backoff(BackoffStrategy::Linear);
        assert_eq!(linear.calculate_backoff(3), Duration::from_millis(300));

        let capped = policy.with_max_delay(Duration::from_millis(150));
        assert_eq!(capped.calculate_backoff(4), Duration::from_millis(150));
    }

    #[test]
    fn test_retry_skips_deterministic_errors() {
        let policy = RetryPolicy::attempts(3);
        assert!(policy.should_retry(1, &StepError::failed("flaky")));
        assert!(!policy.should_retry(3, &StepError::failed("flaky")));
        assert!(!policy.should_retry(1, &StepError::validation("bad")));
    }

    #[tokio::test]
    async fn test_forward_uses_typed_input_and_output() {
        #[derive(Deserialize)]
        struct Input {
            a: i64,
            b: i64,
        }

        let step = StepDefinition::new("add", |input: Input, _ctx| async move {
            Ok::<_, StepError>(input.a + input.b)
        });

        let out = step.invoke(json!({"a": 2, "b": 3}), step_ctx()).await.unwrap();
        assert_eq!(out.output, json!(5));
        assert_eq!(out.compensation_input, None);
        assert!(!step.is_compensable());
    }

    #[tokio::test]
    async fn test_forward_rejects_mismatched_input() {
        let step = StepDefinition::new("typed", |input: u32, _ctx| async move {
            Ok::<_, StepError>(input)
        });

        let err = step.invoke(json!("nope"), step_ctx()).await.unwrap_err();
        assert!(matches!(err, StepError::Serialization { .. }));
    }

    #[tokio::test]
    async fn test_step_response_carries_compensation_payload() {
        let step = StepDefinition::with_response("create", |input: String, _ctx| async move {
            StepResponse::new(format!("created {}", input)).compensate_with(vec![input])
        });

        let out = step.invoke(json!("a"), step_ctx()).await.unwrap();
        assert_eq!(out.output, json!("created a"));
        assert_eq!(out.compensation_input, Some(json!(["a"])));
    }

    #[tokio::test]
    async fn test_compensation_invocation() {
        let step = StepDefinition::new("noop", |_: (), _ctx| async move { Ok::<_, StepError>(()) })
            .compensate(|ids: Vec<String>, _ctx| async move {
                if ids.is_empty() {
                    Err(StepError::failed("nothing to undo"))
                } else {
                    Ok(())
                }
            });

        assert!(step.is_compensable());
        let ok = step.invoke_compensation(json!(["x"]), step_ctx()).unwrap().await;
        assert!(ok.is_ok());
        let err = step.invoke_compensation(json!([]), step_ctx()).unwrap().await;
        assert!(err.is_err());
    }

    #[test]
    fn test_read_kind_is_never_compensable() {
        let step = StepDefinition::new("read", |_: (), _ctx| async move { Ok::<_, StepError>(()) })
            .compensate(|_: Value, _ctx| async move { Ok(()) })
            .into_read();

        assert_eq!(step.kind(), StepKind::Read);
        assert!(!step.is_compensable());
        assert!(step.invoke_compensation(json!(null), step_ctx()).is_none());
    }
}
