//! Model fallback cascade.
//!
//! The primary model is retried to exhaustion before any fallback is touched.
//! Fallbacks are then tried strictly in order, each with its own retry budget.
//! Nothing here ever runs two models at once.

use std::future::Future;

use crate::config::RetryConfig;
use crate::llm::classifier::{FailoverReason, FailureSignal, classify};
use crate::llm::retry::{RetryEvent, with_retry};

/// Successful result of a cascade.
#[derive(Debug, Clone)]
pub struct FallbackOutcome<T> {
    pub result: T,
    pub model_used: String,
    /// 0 for the primary, `i + 1` for the i-th fallback.
    pub fallback_attempt: usize,
    /// Every model that was tried, in order, including the one that succeeded.
    pub attempted_models: Vec<String>,
}

/// Progress reported while a cascade runs.
#[derive(Debug, Clone)]
pub enum CascadeEvent {
    Retry { model: String, event: RetryEvent },
    Fallback {
        from: String,
        to: String,
        fallback_attempt: usize,
        reason: FailoverReason,
    },
}

/// Run `run(model)` against `primary`, then each of `fallbacks`.
///
/// If every fallback fails, the error of the last fallback is returned. With no
/// fallbacks the primary's error is returned.
pub async fn run_with_fallback<T, E, F, Fut, O>(
    primary: &str,
    fallbacks: &[String],
    retry: &RetryConfig,
    on_event: O,
    mut run: F,
) -> Result<FallbackOutcome<T>, E>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: FailureSignal,
    O: Fn(CascadeEvent),
{
    let mut attempted_models = vec![primary.to_string()];

    let primary_err = match attempt_model(primary, retry, &on_event, &mut run).await {
        Ok(result) => {
            return Ok(FallbackOutcome {
                result,
                model_used: primary.to_string(),
                fallback_attempt: 0,
                attempted_models,
            });
        }
        Err(err) => err,
    };

    let mut last_err = primary_err;
    let mut previous = primary.to_string();
    for (index, model) in fallbacks.iter().enumerate() {
        let reason = classify(&last_err);
        tracing::warn!(
            from = %previous,
            to = %model,
            %reason,
            error = %last_err.failure_message(),
            "Model failed, falling back"
        );
        on_event(CascadeEvent::Fallback {
            from: previous.clone(),
            to: model.clone(),
            fallback_attempt: index + 1,
            reason,
        });

        attempted_models.push(model.clone());
        match attempt_model(model, retry, &on_event, &mut run).await {
            Ok(result) => {
                tracing::info!(model = %model, fallback_attempt = index + 1, "Fallback model succeeded");
                return Ok(FallbackOutcome {
                    result,
                    model_used: model.clone(),
                    fallback_attempt: index + 1,
                    attempted_models,
                });
            }
            Err(err) => {
                last_err = err;
                previous = model.clone();
            }
        }
    }

    Err(last_err)
}

async fn attempt_model<T, E, F, Fut, O>(
    model: &str,
    retry: &RetryConfig,
    on_event: &O,
    run: &mut F,
) -> Result<T, E>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: FailureSignal,
    O: Fn(CascadeEvent),
{
    with_retry(
        retry,
        |event| {
            on_event(CascadeEvent::Retry {
                model: model.to_string(),
                event: event.clone(),
            })
        },
        |_| run(model.to_string()),
    )
    .await
}
