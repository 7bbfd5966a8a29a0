use super::environment::{expand_environment, EnvVars, EnvironmentExpander};
use crate::shared::errors::WorkspaceError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BodyOutcome {
    Succeeded { result: Value },
    Failed { error: String },
    Cancelled { cause: String },
}

impl BodyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BodyOutcome::Succeeded { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            BodyOutcome::Succeeded { .. } => "succeeded",
            BodyOutcome::Failed { .. } => "failed",
            BodyOutcome::Cancelled { .. } => "cancelled",
        }
    }
}

type CompletionCallback = Box<dyn FnOnce(&BodyOutcome) + Send>;

/// Single-use completion token shared by every termination path of a body.
///
/// The first `complete` wins; later calls are ignored. Callbacks run before the outcome
/// becomes visible to `outcome`/`wait`, and a callback registered after completion runs
/// immediately on the registering thread.
#[derive(Clone)]
pub struct CompletionHandle {
    inner: Arc<CompletionInner>,
}

struct CompletionInner {
    fired: AtomicBool,
    state: Mutex<CompletionState>,
    published: Condvar,
}

#[derive(Default)]
struct CompletionState {
    callbacks: Vec<CompletionCallback>,
    finished: Option<BodyOutcome>,
    published: Option<BodyOutcome>,
}

impl Default for CompletionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("fired", &self.has_fired())
            .field("outcome", &self.outcome())
            .finish()
    }
}

impl CompletionHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                fired: AtomicBool::new(false),
                state: Mutex::new(CompletionState::default()),
                published: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CompletionState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_complete(&self, callback: impl FnOnce(&BodyOutcome) + Send + 'static) {
        let mut state = self.lock();
        if let Some(outcome) = state.finished.clone() {
            drop(state);
            run_callback(Box::new(callback), &outcome);
            return;
        }
        state.callbacks.push(Box::new(callback));
    }

    /// Returns `false` when another termination path already completed the handle.
    pub fn complete(&self, outcome: BodyOutcome) -> bool {
        if self.inner.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        let callbacks = {
            let mut state = self.lock();
            state.finished = Some(outcome.clone());
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            run_callback(callback, &outcome);
        }
        let mut state = self.lock();
        state.published = Some(outcome);
        self.inner.published.notify_all();
        true
    }

    pub fn has_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.lock().published.is_some()
    }

    pub fn outcome(&self) -> Option<BodyOutcome> {
        self.lock().published.clone()
    }

    pub fn wait(&self) -> BodyOutcome {
        let mut state = self.lock();
        loop {
            if let Some(outcome) = &state.published {
                return outcome.clone();
            }
            state = self
                .inner
                .published
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<BodyOutcome> {
        let state = self.lock();
        let (state, _) = self
            .inner
            .published
            .wait_timeout_while(state, timeout, |state| state.published.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        state.published.clone()
    }
}

fn run_callback(callback: CompletionCallback, outcome: &BodyOutcome) {
    let _ = panic::catch_unwind(AssertUnwindSafe(|| callback(outcome)));
}

#[derive(Debug, Clone)]
pub struct BodyInvocation {
    pub environment: Arc<dyn EnvironmentExpander>,
    pub working_directory: PathBuf,
}

/// Starts the block of work nested under a step.
pub trait BodyRunner: Send + Sync {
    /// Must return without waiting for the body, and must complete `completion`
    /// exactly when the body terminates.
    fn start(
        &self,
        invocation: BodyInvocation,
        completion: CompletionHandle,
    ) -> Result<Arc<dyn BodyExecution>, WorkspaceError>;
}

pub trait BodyExecution: Send + Sync {
    /// Returns `false` if the body had already terminated.
    fn cancel(&self, cause: &str) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    cause: Arc<Mutex<Option<String>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, cause: &str) -> bool {
        let mut current = self.cause.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_none() {
            *current = Some(cause.to_string());
        }
        !self.flag.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn cause(&self) -> Option<String> {
        self.cause
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sleeps in short slices; returns `false` if cancelled before `total` elapsed.
    pub fn sleep(&self, total: Duration) -> bool {
        let mut remaining = total;
        while remaining > Duration::from_millis(0) {
            if self.is_cancelled() {
                return false;
            }
            let step = remaining.min(Duration::from_millis(20));
            thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        !self.is_cancelled()
    }
}

#[derive(Debug, Clone)]
pub struct BodyContext {
    pub environment: EnvVars,
    pub working_directory: PathBuf,
    pub cancel: CancelToken,
}

type BodyFn = dyn Fn(&BodyContext) -> Result<Value, String> + Send + Sync;

/// Runs each body on its own thread.
#[derive(Clone)]
pub struct ThreadBodyRunner {
    body: Arc<BodyFn>,
    base_env: EnvVars,
}

impl ThreadBodyRunner {
    pub fn new(
        body: impl Fn(&BodyContext) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            body: Arc::new(body),
            base_env: EnvVars::new(),
        }
    }

    pub fn with_base_env(mut self, base_env: EnvVars) -> Self {
        self.base_env = base_env;
        self
    }
}

struct ThreadBodyExecution {
    token: CancelToken,
    completion: CompletionHandle,
}

impl BodyExecution for ThreadBodyExecution {
    fn cancel(&self, cause: &str) -> bool {
        if self.completion.has_fired() {
            return false;
        }
        self.token.cancel(cause);
        true
    }
}

impl BodyRunner for ThreadBodyRunner {
    fn start(
        &self,
        invocation: BodyInvocation,
        completion: CompletionHandle,
    ) -> Result<Arc<dyn BodyExecution>, WorkspaceError> {
        let token = CancelToken::new();
        let context = BodyContext {
            environment: expand_environment(&self.base_env, invocation.environment.as_ref()),
            working_directory: invocation.working_directory,
            cancel: token.clone(),
        };
        let body = Arc::clone(&self.body);
        let body_completion = completion.clone();

        thread::Builder::new()
            .name("workspace-body".to_string())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| body(&context)));
                let outcome = match result {
                    Ok(Ok(result)) => BodyOutcome::Succeeded { result },
                    Ok(Err(error)) if context.cancel.is_cancelled() => BodyOutcome::Cancelled {
                        cause: context.cancel.cause().unwrap_or(error),
                    },
                    Ok(Err(error)) => BodyOutcome::Failed { error },
                    Err(payload) => BodyOutcome::Failed {
                        error: format!("body panicked: {}", panic_message(payload.as_ref())),
                    },
                };
                body_completion.complete(outcome);
            })
            .map_err(|err| WorkspaceError::BodyStart(err.to_string()))?;

        Ok(Arc::new(ThreadBodyExecution { token, completion }))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}
