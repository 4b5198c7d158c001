//! Deadline-bounded dispatch into loaded packs.
//!
//! [`ExecutionCoordinator::execute`] looks a pack up in the registry, takes
//! the pack's execution slot (one call in flight per pack), and races the call
//! against the pack's `max_execution_time` deadline and the caller's
//! cancellation token.  The coordinator never waits on a call that ignores
//! cancellation: once the deadline passes it drops the call and returns.
//! Backends that can stop the code (the wasm backend) see the call's token
//! fire and abort it.
//!
//! When the deadline and the caller's cancellation fire together the timeout
//! wins, because it is the pack that misbehaved.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEvent, AuditSink, Severity, sanitize_reason};
use crate::error::{Result, SandboxError};
use crate::isolation::{Invocation, IsolationContext, PackFault, PackState};
use crate::registry::PackRegistry;

/// How a raced call ended.
enum Outcome {
    Finished(std::result::Result<Value, PackFault>),
    TimedOut,
    CallerCancelled,
}

/// Holds a context in `Executing` until dropped.
struct Executing<'a> {
    context: &'a IsolationContext,
    next: PackState,
}

impl<'a> Executing<'a> {
    fn enter(context: &'a IsolationContext) -> Self {
        context.set_state(PackState::Executing);
        Self {
            context,
            next: PackState::Loaded,
        }
    }
}

impl Drop for Executing<'_> {
    fn drop(&mut self) {
        self.context.set_state(self.next);
    }
}

fn not_loaded(pack: &str) -> SandboxError {
    SandboxError::PackNotLoaded {
        name: pack.to_owned(),
    }
}

/// Invokes operations on loaded packs under a deadline.
#[derive(Debug, Clone)]
pub struct ExecutionCoordinator {
    registry: PackRegistry,
}

impl ExecutionCoordinator {
    #[must_use]
    pub fn new(registry: PackRegistry) -> Self {
        Self { registry }
    }

    /// Run `method` on the pack called `pack` with JSON `args`.
    pub async fn execute(
        &self,
        pack: &str,
        method: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let context = self.registry.get(pack).ok_or_else(|| not_loaded(pack))?;
        self.execute_on(context, pack, method, args, cancel).await
    }

    /// Run `method` through a context looked up earlier.
    ///
    /// If the context was unloaded in the meantime and the name has been
    /// loaded again, the call goes to the new pack.
    pub(crate) async fn execute_on(
        &self,
        mut context: Arc<IsolationContext>,
        pack: &str,
        method: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let audit = self.registry.audit_sink();
        let resource = format!("{pack}.{method}");

        let mut reloaded = false;
        let slot = loop {
            let slot = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    audit.record(
                        AuditEvent::system("execute", &resource)
                            .failed("cancelled while waiting for the pack")
                            .with_severity(Severity::Warning),
                    );
                    return Err(SandboxError::Cancelled {
                        pack: pack.to_owned(),
                        method: method.to_owned(),
                    });
                }
                slot = context.slot() => slot,
            };
            if slot.is_some() {
                break slot;
            }
            drop(slot);

            match self.registry.get(pack) {
                Some(fresh) if !reloaded && !Arc::ptr_eq(&fresh, &context) => {
                    context = fresh;
                    reloaded = true;
                }
                _ => return Err(not_loaded(pack)),
            }
        };
        let Some(boundary) = slot.as_ref() else {
            return Err(not_loaded(pack));
        };
        if context.state() == PackState::Error {
            return Err(SandboxError::ExecutionFailed {
                pack: pack.to_owned(),
                method: method.to_owned(),
                reason: "pack is in an error state".into(),
            });
        }

        let limit = context.permissions().max_execution_time;
        let limits = context.limits();
        let deadline = Instant::now() + limit;
        let token = cancel.child_token();

        audit.record(
            AuditEvent::privileged("execute", &resource)
                .with_metadata("limit_ms", limit.as_millis()),
        );

        if !context.has_operation(method) {
            audit.record(AuditEvent::violation(
                "execute",
                &resource,
                "unknown operation",
            ));
            return Err(SandboxError::UnknownOperation {
                pack: pack.to_owned(),
                method: method.to_owned(),
            });
        }

        let mut executing = Executing::enter(&context);
        // Cancels the call even if this future is dropped mid-flight.
        let _abort = token.clone().drop_guard();
        let started = Instant::now();
        let call = Invocation {
            method: method.to_owned(),
            args,
            limits,
            cancel: token.clone(),
        };

        let outcome = {
            let invoke = boundary.invoke(call);
            tokio::pin!(invoke);
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => Outcome::TimedOut,
                result = &mut invoke => Outcome::Finished(result),
                _ = cancel.cancelled() => Outcome::CallerCancelled,
            }
        };
        token.cancel();

        let elapsed = started.elapsed();
        let timed_out = Instant::now() >= deadline;
        let outcome = match outcome {
            Outcome::Finished(Err(PackFault::Interrupted)) | Outcome::CallerCancelled
                if timed_out =>
            {
                Outcome::TimedOut
            }
            Outcome::Finished(Err(PackFault::Interrupted)) if cancel.is_cancelled() => {
                Outcome::CallerCancelled
            }
            other => other,
        };

        if let Outcome::Finished(Err(PackFault::Fatal(_))) = &outcome {
            executing.next = PackState::Error;
        }
        drop(executing);
        drop(slot);

        self.settle(pack, method, &resource, outcome, limit, elapsed, audit.as_ref())
    }

    /// Turn a raced outcome into the caller's result, auditing failures.
    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        pack: &str,
        method: &str,
        resource: &str,
        outcome: Outcome,
        limit: Duration,
        elapsed: Duration,
        audit: &dyn AuditSink,
    ) -> Result<Value> {
        let limit_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
        match outcome {
            Outcome::Finished(Ok(value)) => {
                tracing::debug!(
                    pack,
                    method,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "pack call completed"
                );
                Ok(value)
            }
            Outcome::TimedOut => {
                audit.record(
                    AuditEvent::violation("execute", resource, "execution time limit exceeded")
                        .with_metadata("limit_ms", limit_ms),
                );
                tracing::warn!(pack, method, limit_ms, "pack call timed out");
                Err(SandboxError::Timeout {
                    pack: pack.to_owned(),
                    method: method.to_owned(),
                    limit_ms,
                })
            }
            Outcome::CallerCancelled => {
                audit.record(
                    AuditEvent::system("execute", resource)
                        .failed("cancelled by caller")
                        .with_severity(Severity::Warning),
                );
                tracing::info!(pack, method, "pack call cancelled by caller");
                Err(SandboxError::Cancelled {
                    pack: pack.to_owned(),
                    method: method.to_owned(),
                })
            }
            Outcome::Finished(Err(fault)) => {
                let reason = sanitize_reason(&fault.to_string());
                let severity = match fault {
                    PackFault::Fatal(_) => Severity::Critical,
                    _ => Severity::Warning,
                };
                audit.record(
                    AuditEvent::violation("execute", resource, &reason).with_severity(severity),
                );
                tracing::warn!(pack, method, %reason, "pack call failed");
                Err(SandboxError::ExecutionFailed {
                    pack: pack.to_owned(),
                    method: method.to_owned(),
                    reason,
                })
            }
        }
    }
}
