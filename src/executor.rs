use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::artifact::{Artifact, ArtifactKey, Payload};
use crate::error::{StageErrorCause, StageExecutionError};
use crate::graph::StageInstance;
use crate::registry::{CancelToken, FailureKind, StageContext, StageFailure, StageInputs};

/// Runs one stage instance. Never retries; that decision belongs to the
/// orchestrator.
///
/// Timeouts come from the stage definition, which already carries any
/// configured override.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageExecutor;

impl StageExecutor {
    pub fn new() -> Self {
        Self
    }

    pub fn execute(
        &self,
        node: &StageInstance,
        key: &ArtifactKey,
        inputs: StageInputs,
        cancel: &CancelToken,
    ) -> Result<Artifact, StageExecutionError> {
        let fail = |cause: StageErrorCause| StageExecutionError {
            node: node.id.clone(),
            stage: node.definition.name.clone(),
            version: node.definition.version,
            params: node.params.clone(),
            cause,
        };

        if cancel.is_cancelled() {
            return Err(fail(StageErrorCause::Cancelled));
        }

        let ctx = StageContext::new(node.id.clone(), cancel.clone());
        let started = Instant::now();
        let outcome = match node.definition.timeout {
            Some(limit) => self.dispatch_with_timeout(node, inputs, ctx, limit),
            None => dispatch(node, &inputs, &ctx),
        };
        let elapsed = started.elapsed();

        let payload = match outcome {
            Dispatch::Done(Ok(payload)) => payload,
            Dispatch::Done(Err(failure)) if failure.kind == FailureKind::Cancelled => {
                return Err(fail(StageErrorCause::Cancelled));
            }
            Dispatch::Done(Err(failure)) => {
                return Err(fail(StageErrorCause::Failed {
                    kind: failure.kind,
                    message: failure.message,
                }));
            }
            Dispatch::Panicked(message) => return Err(fail(StageErrorCause::Panicked(message))),
            Dispatch::TimedOut(limit) => return Err(fail(StageErrorCause::Timeout(limit))),
        };

        let found = payload.artifact_type();
        if found != node.definition.output {
            return Err(fail(StageErrorCause::OutputTypeMismatch {
                expected: node.definition.output,
                found,
            }));
        }

        debug!(
            node = %node.id,
            elapsed_ms = elapsed.as_millis() as u64,
            "Stage implementation returned"
        );
        Artifact::new(
            key.clone(),
            &node.definition.name,
            node.definition.version,
            node.params.clone(),
            payload,
            elapsed.as_millis() as u64,
        )
        .map_err(|err| fail(StageErrorCause::InvalidOutput(err)))
    }

    /// Run the implementation on a helper thread so a hung call can be
    /// abandoned. On expiry the call token is cancelled; cooperative
    /// implementations stop at their next checkpoint.
    fn dispatch_with_timeout(
        &self,
        node: &StageInstance,
        inputs: StageInputs,
        ctx: StageContext,
        limit: Duration,
    ) -> Dispatch {
        let (tx, rx) = mpsc::channel();
        let call_token = ctx.call_token();
        let worker_node = node.clone();
        let spawned = thread::Builder::new()
            .name(format!("stage-{}", node.id))
            .spawn(move || {
                let _ = tx.send(dispatch(&worker_node, &inputs, &ctx));
            });
        if let Err(err) = spawned {
            return Dispatch::Done(Err(StageFailure::transient(format!(
                "failed to spawn stage thread: {err}"
            ))));
        }

        match rx.recv_timeout(limit) {
            Ok(outcome) => outcome,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                call_token.cancel();
                Dispatch::TimedOut(limit)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Dispatch::Panicked("stage thread exited without a result".to_string())
            }
        }
    }
}

enum Dispatch {
    Done(Result<Payload, StageFailure>),
    Panicked(String),
    TimedOut(Duration),
}

fn dispatch(node: &StageInstance, inputs: &StageInputs, ctx: &StageContext) -> Dispatch {
    let implementation = Arc::clone(&node.implementation);
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        implementation.execute(inputs, &node.params, ctx)
    }));
    match result {
        Ok(outcome) => Dispatch::Done(outcome),
        Err(panic) => Dispatch::Panicked(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
