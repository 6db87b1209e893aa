// src/runtime/instance.rs
//! One sandboxed isolate on its own OS thread
//!
//! V8 isolates are `!Send`, so every [`JsRuntime`] lives on a dedicated
//! thread with a current-thread tokio runtime for its event loop. The rest
//! of the engine talks to it through an [`Instance`] handle:
//!
//! ```text
//! Instance (Send)                         instance thread
//! ├─ commands ── crossbeam channel ──▶    loop { recv → execute → reset }
//! ├─ isolate  ── terminate_execution ─▶   interrupts running JS
//! └─ health   ◀── Arc<HealthRecord> ──    counters
//! ```
//!
//! Pooled instances run synchronous code and are reset after every
//! execution. One-shot instances get timers and are torn down after a
//! single async execution.

use crate::runtime::health::{HealthRecord, RecycleReason};
use crate::runtime::modules::{ModuleContext, ModuleRegistry};
use crate::runtime::ops::{sandbox_ext, EntryToken, InstanceTag, ScriptOutput};
use crate::runtime::sandbox::{SandboxStage, SecuritySandbox};
use crate::utils::errors::{EngineError, Result, ScriptError, ScriptErrorKind};
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// `{"ok":` + value + `}`
const OK_ENVELOPE_OVERHEAD: usize = 7;

/// Upper bound on waiting for an instance thread to exit
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique instance id
pub fn next_instance_id() -> u64 {
    NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Execution model of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceKind {
    /// Reused across synchronous executions
    Pooled,
    /// Single async execution, then discarded
    OneShot,
}

/// Everything needed to build an instance
#[derive(Clone)]
pub struct InstanceSpec {
    pub kind: InstanceKind,
    pub sandbox: SecuritySandbox,
    pub debug_logging: bool,
    pub max_heap_bytes: usize,
    pub max_result_bytes: usize,
}

impl InstanceSpec {
    pub fn new(kind: InstanceKind, registry: Arc<ModuleRegistry>) -> Self {
        Self {
            kind,
            sandbox: SecuritySandbox::new(registry),
            debug_logging: false,
            max_heap_bytes: 64 * 1024 * 1024,
            max_result_bytes: 1024 * 1024,
        }
    }
}

struct Job {
    code: String,
    input_json: String,
}

enum Command {
    Execute {
        job: Job,
        reply: oneshot::Sender<Outcome>,
    },
    Shutdown,
}

/// What the instance thread reports back for one execution
struct Outcome {
    result: Result<Value>,
    /// Why the instance can no longer be reused, if it can't
    discard: Option<RecycleReason>,
}

/// Handle to a sandboxed isolate
pub struct Instance {
    id: u64,
    kind: InstanceKind,
    commands: crossbeam_channel::Sender<Command>,
    isolate: v8::IsolateHandle,
    interrupted: Arc<AtomicBool>,
    health: Arc<HealthRecord>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Instance {
    /// Spawn the instance thread and wait until its sandbox is Ready
    pub async fn spawn(spec: InstanceSpec) -> Result<Self> {
        let id = next_instance_id();
        let kind = spec.kind;
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = oneshot::channel();
        let interrupted = Arc::new(AtomicBool::new(false));
        let thread_interrupted = interrupted.clone();

        let thread = std::thread::Builder::new()
            .name(format!("sandbox-{}", id))
            .spawn(move || instance_main(id, spec, command_rx, ready_tx, thread_interrupted))?;

        let isolate = match ready_rx.await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(EngineError::Internal(format!(
                    "instance {} exited during bootstrap",
                    id
                )));
            }
        };

        debug!(instance = id, ?kind, "instance ready");
        Ok(Self {
            id,
            kind,
            commands: command_tx,
            isolate,
            interrupted,
            health: Arc::new(HealthRecord::new(id)),
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> InstanceKind {
        self.kind
    }

    pub fn health(&self) -> &Arc<HealthRecord> {
        &self.health
    }

    /// Run `code` with `input` under a wall-clock `budget`
    ///
    /// On timeout the running script is terminated and the instance is
    /// flagged; it must not be reused.
    pub async fn execute(&self, code: &str, input_json: String, budget: Duration) -> Result<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            code: code.to_string(),
            input_json,
        };
        self.commands
            .send(Command::Execute {
                job,
                reply: reply_tx,
            })
            .map_err(|_| {
                self.health.mark_recycle(RecycleReason::Fault);
                EngineError::Internal(format!("instance {} is not accepting work", self.id))
            })?;

        let result = match tokio::time::timeout(budget, reply_rx).await {
            Ok(Ok(outcome)) => {
                if let Some(reason) = outcome.discard {
                    self.health.mark_recycle(reason);
                }
                outcome.result
            }
            Ok(Err(_)) => {
                self.health.mark_recycle(RecycleReason::Fault);
                Err(EngineError::Internal(format!(
                    "instance {} stopped mid-execution",
                    self.id
                )))
            }
            Err(_) => {
                warn!(instance = self.id, ?budget, "execution timed out, terminating");
                self.interrupt();
                self.health.mark_recycle(RecycleReason::Timeout);
                Err(EngineError::Timeout { budget })
            }
        };

        self.health.record_execution(result.is_err());
        result
    }

    /// Terminate whatever JS is running right now
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.isolate.terminate_execution();
    }

    /// Stop the thread and release the isolate
    pub async fn teardown(mut self) {
        self.isolate.terminate_execution();
        let _ = self.commands.send(Command::Shutdown);

        let Some(thread) = self.thread.take() else {
            return;
        };
        let id = self.id;
        let join = tokio::task::spawn_blocking(move || thread.join());
        match tokio::time::timeout(JOIN_TIMEOUT, join).await {
            Ok(Ok(Ok(()))) => debug!(instance = id, "instance torn down"),
            Ok(Ok(Err(_))) => error!(instance = id, "instance thread panicked"),
            Ok(Err(e)) => error!(instance = id, error = %e, "join task failed"),
            Err(_) => warn!(instance = id, "instance thread did not exit in time"),
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if self.thread.is_some() {
            // Not torn down explicitly: stop the thread without joining.
            self.isolate.terminate_execution();
            let _ = self.commands.send(Command::Shutdown);
        }
    }
}

/// Heap-limit callback state, owned by the instance thread
struct HeapGuard {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points at the boxed HeapGuard in `Host`, which is
    // declared after (and so dropped after) the runtime that calls this.
    let guard = unsafe { &*(data as *const HeapGuard) };
    if !guard.triggered.swap(true, Ordering::SeqCst) {
        guard.handle.terminate_execution();
    }
    // 1MB grace so the termination can unwind
    current_heap_limit + 1024 * 1024
}

/// Thread-side state: the runtime and its heap guard
struct Host {
    runtime: JsRuntime,
    heap: Box<HeapGuard>,
    entry: EntryToken,
    kind: InstanceKind,
    max_result_bytes: usize,
    interrupted: Arc<AtomicBool>,
}

impl Host {
    fn bootstrap(id: u64, spec: &InstanceSpec, interrupted: Arc<AtomicBool>) -> Result<Self> {
        let create_params = v8::CreateParams::default().heap_limits(0, spec.max_heap_bytes);
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![sandbox_ext::init()],
            create_params: Some(create_params),
            ..Default::default()
        });

        runtime.op_state().borrow_mut().put(InstanceTag {
            instance_id: id,
            debug_logging: spec.debug_logging,
        });

        let heap = Box::new(HeapGuard {
            handle: runtime.v8_isolate().thread_safe_handle(),
            triggered: AtomicBool::new(false),
        });
        runtime.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit_callback,
            &*heap as *const HeapGuard as *mut std::ffi::c_void,
        );

        let ctx = ModuleContext {
            instance_id: id,
            kind: spec.kind,
            debug_logging: spec.debug_logging,
        };
        spec.sandbox.bootstrap(&mut runtime, &ctx)?;
        let entry = runtime
            .op_state()
            .borrow_mut()
            .try_take::<EntryToken>()
            .ok_or_else(|| EngineError::setup(SandboxStage::Ready, "kernel entry token missing"))?;

        Ok(Self {
            runtime,
            heap,
            entry,
            kind: spec.kind,
            max_result_bytes: spec.max_result_bytes,
            interrupted,
        })
    }

    async fn execute(&mut self, job: Job) -> Outcome {
        self.runtime.op_state().borrow_mut().try_take::<ScriptOutput>();

        let script = match wrap_script(self.kind, &self.entry, &job.code, &job.input_json) {
            Ok(script) => script,
            Err(e) => {
                return Outcome {
                    result: Err(e),
                    discard: None,
                }
            }
        };

        let run_error = match self.runtime.execute_script("[sandbox:execute]", script) {
            Ok(_) => self
                .runtime
                .run_event_loop(PollEventLoopOptions::default())
                .await
                .err()
                .map(|e| e.to_string()),
            Err(e) => Some(e.to_string()),
        };

        if self.heap.triggered.load(Ordering::SeqCst) {
            return Outcome {
                result: Err(EngineError::Execution(ScriptError::new(
                    ScriptErrorKind::ResourceLimit,
                    "heap limit exceeded",
                ))),
                discard: Some(RecycleReason::HeapLimit),
            };
        }
        if self.interrupted.load(Ordering::SeqCst) {
            return Outcome {
                result: Err(EngineError::Internal("execution interrupted".into())),
                discard: Some(RecycleReason::Timeout),
            };
        }

        let output = self.runtime.op_state().borrow_mut().try_take::<ScriptOutput>();
        let result = decode_outcome(output, run_error, self.max_result_bytes);

        let discard = match self.kind {
            InstanceKind::OneShot => None,
            InstanceKind::Pooled => match SecuritySandbox::reset(&mut self.runtime) {
                Ok(()) => None,
                Err(e) => {
                    warn!(error = %e, "sandbox reset failed");
                    Some(RecycleReason::ResetFailed)
                }
            },
        };

        Outcome { result, discard }
    }
}

fn instance_main(
    id: u64,
    spec: InstanceSpec,
    commands: crossbeam_channel::Receiver<Command>,
    ready: oneshot::Sender<Result<v8::IsolateHandle>>,
    interrupted: Arc<AtomicBool>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };

    let mut host = match Host::bootstrap(id, &spec, interrupted) {
        Ok(host) => host,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if ready
        .send(Ok(host.runtime.v8_isolate().thread_safe_handle()))
        .is_err()
    {
        return;
    }

    while let Ok(command) = commands.recv() {
        match command {
            Command::Execute { job, reply } => {
                let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| {
                    rt.block_on(host.execute(job))
                })) {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        error!(instance = id, "panic while executing script");
                        Outcome {
                            result: Err(EngineError::Internal("instance panicked".into())),
                            discard: Some(RecycleReason::Fault),
                        }
                    }
                };
                let _ = reply.send(outcome);
            }
            Command::Shutdown => break,
        }
    }

    drop(host);
    debug!(instance = id, "instance thread exiting");
}

/// Build the entry script for one execution
///
/// Code and input both travel as JS string literals; the kernel compiles the
/// code as a strict function body taking `input`.
fn wrap_script(kind: InstanceKind, entry: &EntryToken, code: &str, input_json: &str) -> Result<String> {
    let token_literal = serde_json::to_string(&entry.0)?;
    let code_literal = serde_json::to_string(code)?;
    let input_literal = serde_json::to_string(input_json)?;
    let function = match kind {
        InstanceKind::Pooled => "run",
        InstanceKind::OneShot => "runAsync",
    };
    Ok(format!(
        "__sandbox.{}({}, {}, {});",
        function, token_literal, code_literal, input_literal
    ))
}

/// Turn the reported envelope (or the runtime error) into a result
fn decode_outcome(
    output: Option<ScriptOutput>,
    run_error: Option<String>,
    max_result_bytes: usize,
) -> Result<Value> {
    let Some(ScriptOutput(envelope)) = output else {
        return Err(EngineError::Execution(match run_error {
            Some(message) => parse_uncaught(&message),
            None => ScriptError::new(ScriptErrorKind::NoResult, "script did not report a result"),
        }));
    };

    let mut parsed: Value = serde_json::from_str(&envelope)?;
    if let Some(error) = parsed.get("error") {
        let name = error.get("name").and_then(Value::as_str).unwrap_or("Error");
        let message = error.get("message").and_then(Value::as_str).unwrap_or("");
        return Err(EngineError::Execution(ScriptError::thrown(name, message)));
    }

    // A stray rejection after the result was reported still fails the run.
    if let Some(message) = run_error {
        return Err(EngineError::Execution(parse_uncaught(&message)));
    }

    let size = envelope.len().saturating_sub(OK_ENVELOPE_OVERHEAD);
    if size > max_result_bytes {
        return Err(EngineError::Execution(ScriptError::new(
            ScriptErrorKind::ResultTooLarge,
            format!("result is {} bytes, limit is {}", size, max_result_bytes),
        )));
    }

    Ok(parsed
        .as_object_mut()
        .and_then(|o| o.remove("ok"))
        .unwrap_or(Value::Null))
}

/// Best-effort split of a runtime error such as
/// `Uncaught (in promise) SecurityError: capability disabled: eval`
fn parse_uncaught(text: &str) -> ScriptError {
    let first_line = text.lines().next().unwrap_or(text);
    let stripped = first_line
        .trim_start_matches("Uncaught ")
        .trim_start_matches("(in promise) ");
    match stripped.split_once(": ") {
        Some((name, message))
            if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') =>
        {
            ScriptError::thrown(name, message)
        }
        _ => ScriptError::thrown("Error", stripped),
    }
}
