pub mod host;
pub mod marshal;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Function, Runtime};
use serde_json::Value as Json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::auth::UserContext;
use crate::capabilities::CapabilitySet;
use crate::db::bridge::TransactionSlot;
use crate::error::{EngineError, EngineResult};
use crate::AppState;

/// The four invocation shapes a sandbox accepts, plus `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    Init,
    Http,
    Graphql,
    Scheduled,
    Message,
}

impl InvocationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Http => "http",
            Self::Graphql => "graphql",
            Self::Scheduled => "scheduled",
            Self::Message => "message",
        }
    }
}

/// One queued invocation, answered over the oneshot.
pub struct InvocationRequest {
    pub handler: String,
    pub kind: InvocationKind,
    pub payload: Json,
    pub auth: UserContext,
    pub depth: u8,
    pub reply: oneshot::Sender<EngineResult<Json>>,
}

enum WorkerMsg {
    Invoke(InvocationRequest),
    Shutdown,
}

/// Init outcome recorded on the in-memory script state.
#[derive(Debug, Default, Clone)]
pub struct InitStatus {
    pub completed: bool,
    pub error: Option<String>,
}

/// CPU-budget deadline shared with the interpreter's interrupt handler.
pub(crate) struct DeadlineCell {
    until: StdMutex<Option<Instant>>,
    fired: AtomicBool,
}

impl DeadlineCell {
    fn new() -> Self {
        Self {
            until: StdMutex::new(None),
            fired: AtomicBool::new(false),
        }
    }

    fn arm(&self, budget: Duration) {
        *self.until.lock().expect("deadline poisoned") = Some(Instant::now() + budget);
        self.fired.store(false, Ordering::SeqCst);
    }

    fn disarm(&self) {
        *self.until.lock().expect("deadline poisoned") = None;
    }

    /// Called from the interpreter's interrupt hook; returning true aborts
    /// the running JS.
    fn should_interrupt(&self) -> bool {
        let until = *self.until.lock().expect("deadline poisoned");
        match until {
            Some(deadline) if Instant::now() >= deadline => {
                self.fired.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    fn take_fired(&self) -> bool {
        self.fired.swap(false, Ordering::SeqCst)
    }
}

/// Per-invocation state threaded through every host call.
pub(crate) struct InvocationState {
    pub kind: InvocationKind,
    pub auth: UserContext,
    pub depth: u8,
    pub slot: TransactionSlot,
}

impl InvocationState {
    fn new(kind: InvocationKind, auth: UserContext, depth: u8) -> Self {
        Self {
            kind,
            auth,
            depth,
            slot: TransactionSlot::new(),
        }
    }
}

/// Everything the worker thread and its host closures share. Lives on the
/// worker thread only (Rc, RefCell); the async world talks to it through the
/// mailbox.
pub(crate) struct WorkerShared {
    pub state: Arc<AppState>,
    pub script_uri: String,
    pub caps: Arc<CapabilitySet>,
    pub handle: tokio::runtime::Handle,
    pub deadline: Arc<DeadlineCell>,
    pub budget: Duration,
    pub stack: RefCell<Vec<InvocationState>>,
    mailbox: RefCell<mpsc::UnboundedReceiver<WorkerMsg>>,
    /// Set when a shutdown request is observed mid-drain by
    /// `host::block_on_processing`; the main loop honors it afterwards.
    pub(crate) shutdown: Cell<bool>,
}

impl WorkerShared {
    /// Current invocation's auth context (anonymous outside an invocation,
    /// which only happens for top-level script statements).
    pub fn current_auth(&self) -> UserContext {
        self.stack
            .borrow()
            .last()
            .map(|s| s.auth.clone())
            .unwrap_or_else(UserContext::anonymous)
    }

    pub fn current_depth(&self) -> u8 {
        self.stack.borrow().last().map(|s| s.depth).unwrap_or(0)
    }

    /// Actor identity for script/asset store operations initiated from this
    /// sandbox. A privileged script acts with admin scope regardless of the
    /// invocation's user (its capability set already passed the gate).
    pub fn store_actor(&self) -> UserContext {
        let mut auth = self.current_auth();
        if self.caps.privileged() {
            auth.is_authenticated = true;
            auth.is_admin = true;
        }
        auth
    }

    /// Run a future to completion on the engine runtime, from this worker
    /// thread. Used for every I/O-bound host call.
    pub fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.handle.block_on(fut)
    }
}

/// Control handle for one loaded sandbox. Cloning is cheap; the worker thread
/// and its interpreter are shared.
#[derive(Clone)]
pub struct SandboxHandle {
    pub script_uri: String,
    pub caps: Arc<CapabilitySet>,
    tx: mpsc::UnboundedSender<WorkerMsg>,
    init: Arc<StdMutex<InitStatus>>,
}

impl SandboxHandle {
    /// Spawn the dedicated interpreter thread for a script. Must be called
    /// from within the engine's async runtime (the tokio handle is captured
    /// for host-call I/O).
    pub fn spawn(state: Arc<AppState>, script_uri: &str, source: String, privileged: bool) -> Self {
        let caps = Arc::new(CapabilitySet::for_script(privileged));
        let (tx, rx) = mpsc::unbounded_channel();
        let init = Arc::new(StdMutex::new(InitStatus::default()));
        let handle = tokio::runtime::Handle::current();

        let thread_caps = caps.clone();
        let thread_uri = script_uri.to_string();
        let thread_name = format!("sandbox-{}", short_label(script_uri));
        let spawned = std::thread::Builder::new().name(thread_name).spawn(move || {
            run_worker(state, thread_uri, source, thread_caps, handle, rx);
        });
        if let Err(e) = spawned {
            error!(uri = %script_uri, error = %e, "Failed to spawn sandbox thread");
        }

        Self {
            script_uri: script_uri.to_string(),
            caps,
            tx,
            init,
        }
    }

    /// Queue an invocation and await its result.
    pub async fn invoke(
        &self,
        handler: &str,
        kind: InvocationKind,
        payload: Json,
        auth: UserContext,
        depth: u8,
    ) -> EngineResult<Json> {
        let (reply, rx) = oneshot::channel();
        let request = InvocationRequest {
            handler: handler.to_string(),
            kind,
            payload,
            auth,
            depth,
            reply,
        };
        self.tx
            .send(WorkerMsg::Invoke(request))
            .map_err(|_| EngineError::internal("sandbox is shut down"))?;
        rx.await
            .map_err(|_| EngineError::internal("sandbox terminated during invocation"))?
    }

    pub fn init_status(&self) -> InitStatus {
        self.init.lock().expect("init status poisoned").clone()
    }

    pub fn record_init(&self, error: Option<String>) {
        let mut status = self.init.lock().expect("init status poisoned");
        status.completed = true;
        status.error = error;
    }

    /// Ask the worker to exit; in-flight work completes first.
    pub fn shutdown(&self) {
        let _ = self.tx.send(WorkerMsg::Shutdown);
    }
}

fn short_label(uri: &str) -> String {
    uri.rsplit('/').next().unwrap_or(uri).chars().take(24).collect()
}

fn run_worker(
    state: Arc<AppState>,
    script_uri: String,
    source: String,
    caps: Arc<CapabilitySet>,
    handle: tokio::runtime::Handle,
    rx: mpsc::UnboundedReceiver<WorkerMsg>,
) {
    let budget = Duration::from_millis(state.config.sandbox_execution_timeout_ms);
    let memory_limit = state.config.sandbox_memory_limit_bytes();

    let runtime = match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(uri = %script_uri, error = %e, "Failed to create JS runtime");
            drain_with_error(rx, &format!("runtime creation failed: {e}"));
            return;
        }
    };
    runtime.set_memory_limit(memory_limit);

    let deadline = Arc::new(DeadlineCell::new());
    {
        let deadline = deadline.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || deadline.should_interrupt())));
    }

    let context = match Context::full(&runtime) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(uri = %script_uri, error = %e, "Failed to create JS context");
            drain_with_error(rx, &format!("context creation failed: {e}"));
            return;
        }
    };

    let shared = Rc::new(WorkerShared {
        state,
        script_uri: script_uri.clone(),
        caps,
        handle,
        deadline,
        budget,
        stack: RefCell::new(Vec::new()),
        mailbox: RefCell::new(rx),
        shutdown: Cell::new(false),
    });

    if let Err(e) = context.with(|ctx| host::install(&ctx, &shared)) {
        error!(uri = %script_uri, error = %e, "Failed to install host APIs");
        return;
    }

    // Evaluate the script body once; its function definitions become the
    // handler surface. An error here is an init failure surfaced on the
    // first invocation. The CPU budget applies to top-level code too.
    shared.deadline.arm(shared.budget);
    let eval_error: Option<String> = context.with(|ctx| {
        match ctx.eval::<(), _>(source.as_bytes().to_vec()).catch(&ctx) {
            Ok(()) => None,
            Err(caught) => {
                if shared.deadline.take_fired() {
                    Some(EngineError::Timeout.to_string())
                } else {
                    Some(caught_message(caught))
                }
            }
        }
    });
    shared.deadline.disarm();
    if let Some(e) = &eval_error {
        warn!(uri = %script_uri, error = %e, "Script evaluation failed");
    }

    debug!(uri = %script_uri, "Sandbox worker started");

    loop {
        let msg = {
            let shared = shared.clone();
            shared
                .handle
                .clone()
                .block_on(async { shared.mailbox.borrow_mut().recv().await })
        };
        match msg {
            None | Some(WorkerMsg::Shutdown) => break,
            Some(WorkerMsg::Invoke(request)) => {
                if let Some(e) = &eval_error {
                    let _ = request
                        .reply
                        .send(Err(EngineError::Script(format!("init failed: {e}"))));
                    continue;
                }
                context.with(|ctx| process_invocation(&ctx, &shared, request));
                if shared.shutdown.get() {
                    break;
                }
            }
        }
    }

    debug!(uri = %script_uri, "Sandbox worker stopped");
}

/// Answer every queued message with an error (degenerate worker startup).
fn drain_with_error(mut rx: mpsc::UnboundedReceiver<WorkerMsg>, message: &str) {
    while let Ok(msg) = rx.try_recv() {
        if let WorkerMsg::Invoke(request) = msg {
            let _ = request
                .reply
                .send(Err(EngineError::internal(message)));
        }
    }
}

/// Execute one invocation on the worker's context. Also used re-entrantly by
/// `host::block_on_processing` when a nested call targets this same sandbox.
pub(crate) fn process_invocation(ctx: &Ctx<'_>, shared: &Rc<WorkerShared>, request: InvocationRequest) {
    let InvocationRequest {
        handler,
        kind,
        payload,
        auth,
        depth,
        reply,
    } = request;

    shared
        .stack
        .borrow_mut()
        .push(InvocationState::new(kind, auth.clone(), depth));
    let outermost = shared.stack.borrow().len() == 1;
    if outermost {
        shared.deadline.arm(shared.budget);
    }

    let result = call_handler(ctx, shared, &handler, kind, &payload, &auth);

    // Close the transaction slot: auto-commit on success, rollback on error.
    let failed = result.is_err();
    let mut state = shared.stack.borrow_mut().pop().expect("invocation stack empty");
    if let Err(e) = shared.block_on(state.slot.finish(failed)) {
        error!(uri = %shared.script_uri, error = %e, "Transaction finish failed");
    }

    if outermost {
        shared.deadline.disarm();
    } else {
        // Restore the outer invocation's auth global.
        let outer_auth = shared.stack.borrow().last().map(|s| s.auth.clone());
        if let Some(auth) = outer_auth {
            let _ = host::set_auth_global(ctx, shared, &auth);
        }
    }

    let _ = reply.send(result);
}

fn call_handler(
    ctx: &Ctx<'_>,
    shared: &Rc<WorkerShared>,
    handler: &str,
    kind: InvocationKind,
    payload: &Json,
    auth: &UserContext,
) -> EngineResult<Json> {
    host::set_auth_global(ctx, shared, auth)
        .map_err(|e| EngineError::internal(format!("auth injection failed: {e}")))?;

    let func: Function = ctx
        .globals()
        .get(handler)
        .map_err(|_| EngineError::Script(format!("handler not found: {handler}")))?;

    // The context object the handler receives: payload fields plus kind and
    // the data view of auth.
    let mut context_obj = match payload {
        Json::Object(map) => map.clone(),
        Json::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("data".to_string(), other.clone());
            map
        }
    };
    context_obj.insert("kind".to_string(), Json::String(kind.as_str().to_string()));
    context_obj.insert(
        "auth".to_string(),
        serde_json::to_value(auth).unwrap_or(Json::Null),
    );

    let arg = marshal::json_to_js(ctx, &Json::Object(context_obj))
        .map_err(|e| EngineError::internal(format!("argument marshalling failed: {e}")))?;

    let outcome = func.call::<_, rquickjs::Value>((arg,)).catch(ctx);

    match outcome {
        Ok(value) => Ok(marshal::js_to_json(&value)),
        Err(caught) => {
            if shared.deadline.take_fired() {
                Err(EngineError::Timeout)
            } else {
                Err(map_caught(caught))
            }
        }
    }
}

/// Map a caught JS error. Host APIs throw exceptions whose messages carry an
/// engine error kind prefix; those are rehydrated so the pipeline's status
/// mapping sees the original kind.
fn map_caught(caught: CaughtError<'_>) -> EngineError {
    let message = caught_message(caught);
    rehydrate(&message).unwrap_or(EngineError::Script(message))
}

fn rehydrate(message: &str) -> Option<EngineError> {
    let first_line = message.lines().next().unwrap_or(message);
    let (kind, detail) = match first_line.split_once(": ") {
        Some((k, d)) => (k.trim(), d.to_string()),
        None => (first_line, String::new()),
    };
    match kind {
        "Timeout" => Some(EngineError::Timeout),
        "TransactionTimeout" => Some(EngineError::TransactionTimeout),
        "SecretNotFound" => Some(EngineError::SecretNotFound(detail)),
        "NetworkBlocked" => Some(EngineError::NetworkBlocked(detail)),
        "StreamNotRegistered" => Some(EngineError::StreamNotRegistered(detail)),
        "ScheduleBadTime" => Some(EngineError::ScheduleBadTime(detail)),
        "Conflict" => Some(EngineError::Conflict(detail)),
        "NotFound" => Some(EngineError::not_found("resource", detail)),
        "InvalidInput" => Some(EngineError::invalid("input", detail)),
        "CapabilityDenied" => {
            crate::capabilities::parse_capability(&detail).map(EngineError::CapabilityDenied)
        }
        _ => None,
    }
}

fn caught_message(caught: CaughtError<'_>) -> String {
    match caught {
        CaughtError::Exception(exception) => {
            let message = exception.message().unwrap_or_else(|| "unknown error".into());
            match exception.stack() {
                Some(stack) if !stack.is_empty() => format!("{message}\n{stack}"),
                _ => message,
            }
        }
        CaughtError::Value(value) => match marshal::js_to_json(&value) {
            Json::String(s) => s,
            other => other.to_string(),
        },
        CaughtError::Error(error) => error.to_string(),
    }
}
