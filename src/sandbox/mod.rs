//! Restricted script sandbox.
//!
//! Plugin code is written in a small Python-flavoured language and executed
//! by a tree-walking interpreter that only knows a fixed allow-list of pure
//! builtins. Nothing in the interpreter can touch the filesystem, network or
//! process; `local` trust adds a read-only clock and environment lookup.
//!
//! ```text
//!   source ──▶ lexer ──▶ parser ──▶ Program (Arc<ast::Module>, Send + Sync)
//!                                      │
//!          worker thread ◀─────────────┘  run_async / run_blocking
//!               │
//!               ▼
//!          Instance::load ──▶ Instance::call ──▶ ReturnValue
//!          (step budget, recursion cap, size cap, deadline)
//! ```
//!
//! A [`Program`] is compiled once and shared; every execution instantiates a
//! fresh [`Instance`] on a dedicated worker thread, so module-level state
//! never leaks between invocations.

pub mod ast;
mod builtins;
mod format;
mod interpreter;
mod lexer;
mod methods;
mod parser;
mod value;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use parser::parse_module;

use interpreter::Interpreter;
use value::Value;

/// Stack size for sandbox worker threads. Deeply nested script calls recurse
/// through the interpreter.
const WORKER_STACK_BYTES: usize = 32 * 1024 * 1024;

/// Extra time the host waits past the script deadline before abandoning a
/// worker that has not reported back.
const WORKER_GRACE: Duration = Duration::from_millis(250);

/// One frame of a script traceback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub line: usize,
    pub function: String,
}

/// An exception raised inside a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    pub kind: String,
    pub message: String,
    /// Innermost frame first.
    pub trace: Vec<TraceFrame>,
}

impl Exception {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: Vec::new(),
        }
    }

    /// Whether an `except <handler>` clause catches this exception.
    pub fn is_instance_of(&self, handler: &str) -> bool {
        exception_matches(&self.kind, handler)
    }

    /// Python-style traceback text, most recent call last.
    pub fn traceback(&self) -> String {
        let mut out = String::from("Traceback (most recent call last):\n");
        for frame in self.trace.iter().rev() {
            out.push_str(&format!("  line {}, in {}\n", frame.line, frame.function));
        }
        out.push_str(&self.to_string());
        out
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

/// Exception names scripts can raise and catch.
pub(crate) const EXCEPTION_KINDS: &[&str] = &[
    "BaseException",
    "Exception",
    "ArithmeticError",
    "AssertionError",
    "AttributeError",
    "ImportError",
    "IndexError",
    "KeyError",
    "LookupError",
    "MemoryError",
    "NameError",
    "NotImplementedError",
    "OverflowError",
    "RecursionError",
    "RuntimeError",
    "StopIteration",
    "TypeError",
    "ValueError",
    "ZeroDivisionError",
];

fn exception_parent(kind: &str) -> Option<&'static str> {
    match kind {
        "BaseException" => None,
        "Exception" => Some("BaseException"),
        "ZeroDivisionError" | "OverflowError" => Some("ArithmeticError"),
        "KeyError" | "IndexError" => Some("LookupError"),
        "RecursionError" | "NotImplementedError" => Some("RuntimeError"),
        _ => Some("Exception"),
    }
}

fn exception_matches(kind: &str, handler: &str) -> bool {
    let mut current = Some(kind);
    while let Some(name) = current {
        if name == handler {
            return true;
        }
        current = exception_parent(name);
    }
    false
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScriptError {
    #[error("Syntax error: {message} (line {line})")]
    Syntax { line: usize, message: String },

    #[error("{0}")]
    Raised(Exception),

    #[error("execution exceeded its time limit")]
    Timeout,

    #[error("execution exceeded its step budget of {0}")]
    StepLimit(u64),

    #[error("sandbox worker failed: {0}")]
    Worker(String),
}

impl ScriptError {
    pub(crate) fn raise(kind: &str, message: impl Into<String>) -> Self {
        ScriptError::Raised(Exception::new(kind, message))
    }

    /// Timeouts and budget exhaustion cannot be caught by `except`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScriptError::Timeout | ScriptError::StepLimit(_))
    }

    pub fn traceback(&self) -> Option<String> {
        match self {
            ScriptError::Raised(exc) => Some(exc.traceback()),
            _ => None,
        }
    }
}

/// Host capabilities granted to an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostAccess {
    /// `time.time()` / `time.monotonic()`.
    pub clock: bool,
    /// `os.getenv()`.
    pub env: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Statement/call budget per instance. `None` leaves only the deadline.
    pub max_steps: Option<u64>,
    pub max_call_depth: usize,
    pub max_collection_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_steps: Some(5_000_000),
            max_call_depth: 64,
            max_collection_len: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SandboxPolicy {
    pub limits: Limits,
    pub host: HostAccess,
}

impl SandboxPolicy {
    /// Policy for generated code: pure builtins only, bounded steps.
    pub fn sandboxed(max_steps: u64) -> Self {
        Self {
            limits: Limits {
                max_steps: Some(max_steps),
                ..Limits::default()
            },
            host: HostAccess::default(),
        }
    }

    /// Policy for operator-installed code: clock and env access, deadline only.
    pub fn local() -> Self {
        Self {
            limits: Limits {
                max_steps: None,
                ..Limits::default()
            },
            host: HostAccess {
                clock: true,
                env: true,
            },
        }
    }
}

/// Parsed source, shareable across threads.
///
/// Helper modules run ahead of the main module in the same namespace, so
/// the main module sees their definitions and may override them.
#[derive(Debug, Clone)]
pub struct Program {
    module: Arc<ast::Module>,
    helpers: Vec<Arc<ast::Module>>,
}

impl Program {
    pub fn compile(source: &str) -> Result<Self, ScriptError> {
        Ok(Self {
            module: Arc::new(parse_module(source)?),
            helpers: Vec::new(),
        })
    }

    /// Run `helper`'s top level (and its own helpers) before this module.
    pub fn with_helper(mut self, helper: &Program) -> Self {
        self.helpers.extend(helper.helpers.iter().cloned());
        self.helpers.push(Arc::clone(&helper.module));
        self
    }

    pub fn module(&self) -> &ast::Module {
        &self.module
    }

    /// Whether `name` is defined by a top-level `def` here or in a helper.
    pub fn defines(&self, name: &str) -> bool {
        std::iter::once(&self.module)
            .chain(&self.helpers)
            .any(|module| module.top_level_functions().contains(&name))
    }
}

/// Result of a script call, converted for the host.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnValue {
    /// `str(result)`.
    pub text: String,
    pub json: serde_json::Value,
    pub is_none: bool,
}

impl ReturnValue {
    fn from_value(value: &Value) -> Self {
        Self {
            text: value.py_str(),
            json: value.to_json(),
            is_none: matches!(value, Value::None),
        }
    }
}

/// A loaded program bound to one worker thread.
///
/// Not `Send`: create it inside the job passed to [`run_async`] or
/// [`run_blocking`].
pub struct Instance {
    interp: Interpreter,
}

impl Instance {
    /// Execute the program's top level and return the populated instance.
    pub fn load(
        program: &Program,
        policy: &SandboxPolicy,
        deadline: Instant,
    ) -> Result<Self, ScriptError> {
        let mut interp = Interpreter::new(*policy, deadline);
        for helper in &program.helpers {
            interp.run_module(helper)?;
        }
        interp.run_module(&program.module)?;
        Ok(Self { interp })
    }

    pub fn set_deadline(&mut self, deadline: Instant) {
        self.interp.set_deadline(deadline);
    }

    /// Whether a callable global named `name` exists.
    pub fn has_function(&self, name: &str) -> bool {
        self.interp.has_callable(name)
    }

    /// Call `name(**kwargs)`.
    pub fn call(
        &mut self,
        name: &str,
        kwargs: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<ReturnValue, ScriptError> {
        let keywords = kwargs
            .iter()
            .map(|(key, value)| (key.clone(), Value::from_json(value)))
            .collect();
        let value = self.interp.call_global(name, Vec::new(), keywords)?;
        Ok(ReturnValue::from_value(&value))
    }

    /// Call `name(*args)`.
    pub fn call_positional(
        &mut self,
        name: &str,
        args: &[serde_json::Value],
    ) -> Result<ReturnValue, ScriptError> {
        let positional = args.iter().map(Value::from_json).collect();
        let value = self.interp.call_global(name, positional, Vec::new())?;
        Ok(ReturnValue::from_value(&value))
    }
}

fn spawn_worker<F>(job: F) -> Result<(), ScriptError>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name("toolforge-sandbox".to_string())
        .stack_size(WORKER_STACK_BYTES)
        .spawn(job)
        .map(|_| ())
        .map_err(|e| ScriptError::Worker(e.to_string()))
}

/// Run `job` on a sandbox worker thread and await its result.
///
/// The job receives the deadline it must pass to [`Instance::load`]. If the
/// worker has not answered `timeout` plus a short grace period later, it is
/// abandoned and [`ScriptError::Timeout`] is returned.
pub async fn run_async<T, F>(timeout: Duration, job: F) -> Result<T, ScriptError>
where
    T: Send + 'static,
    F: FnOnce(Instant) -> Result<T, ScriptError> + Send + 'static,
{
    let deadline = Instant::now() + timeout;
    let (tx, rx) = tokio::sync::oneshot::channel();
    spawn_worker(move || {
        let _ = tx.send(job(deadline));
    })?;
    match tokio::time::timeout(timeout + WORKER_GRACE, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(ScriptError::Worker(
            "worker exited without reporting a result".to_string(),
        )),
        Err(_) => Err(ScriptError::Timeout),
    }
}

/// Blocking counterpart of [`run_async`] for synchronous callers such as
/// hook dispatch.
pub fn run_blocking<T, F>(timeout: Duration, job: F) -> Result<T, ScriptError>
where
    T: Send + 'static,
    F: FnOnce(Instant) -> Result<T, ScriptError> + Send + 'static,
{
    let deadline = Instant::now() + timeout;
    let (tx, rx) = std::sync::mpsc::sync_channel(1);
    spawn_worker(move || {
        let _ = tx.send(job(deadline));
    })?;
    match rx.recv_timeout(timeout + WORKER_GRACE) {
        Ok(result) => result,
        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Err(ScriptError::Timeout),
        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(ScriptError::Worker(
            "worker exited without reporting a result".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn load(source: &str) -> Instance {
        let program = Program::compile(source).expect("compiles");
        Instance::load(
            &program,
            &SandboxPolicy::sandboxed(100_000),
            Instant::now() + Duration::from_secs(5),
        )
        .expect("loads")
    }

    #[test]
    fn test_exception_hierarchy() {
        assert!(exception_matches("KeyError", "LookupError"));
        assert!(exception_matches("ZeroDivisionError", "Exception"));
        assert!(!exception_matches("ValueError", "TypeError"));
        assert!(!exception_matches("BaseException", "Exception"));
    }

    #[test]
    fn test_call_with_keyword_arguments() {
        let mut instance = load("def reverse_text(text):\n    return text[::-1]\n");
        assert!(instance.has_function("reverse_text"));
        assert!(!instance.has_function("missing"));
        let mut kwargs = serde_json::Map::new();
        kwargs.insert("text".to_string(), json!("hello"));
        let result = instance.call("reverse_text", &kwargs).unwrap();
        assert_eq!(result.text, "olleh");
        assert_eq!(result.json, json!("olleh"));
    }

    #[test]
    fn test_helpers_load_before_main_module() {
        let helper = Program::compile("SUFFIX = '!'\n\ndef shout(text):\n    return text.upper() + SUFFIX\n\ndef greet():\n    return 'helper'\n").unwrap();
        let program = Program::compile("def greet():\n    return shout('hi')\n")
            .unwrap()
            .with_helper(&helper);
        assert!(program.defines("shout"));
        assert!(!Program::compile("x = 1\n").unwrap().defines("shout"));

        let mut instance = Instance::load(
            &program,
            &SandboxPolicy::sandboxed(100_000),
            Instant::now() + Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(instance.call_positional("greet", &[]).unwrap().text, "HI!");
    }

    #[test]
    fn test_traceback_names_frames() {
        let mut instance = load("def inner():\n    raise ValueError('bad')\n\ndef outer():\n    return inner()\n");
        let err = instance.call_positional("outer", &[]).unwrap_err();
        let trace = err.traceback().unwrap();
        assert!(trace.contains("in outer"));
        assert!(trace.contains("line 2, in inner"));
        assert!(trace.ends_with("ValueError: bad"));
    }

    #[test]
    fn test_program_defines() {
        let program = Program::compile("x = 1\ndef f():\n    pass\n").unwrap();
        assert!(program.defines("f"));
        assert!(!program.defines("x"));
    }

    #[tokio::test]
    async fn test_run_async_stops_runaway_loop() {
        let program = Program::compile("def spin():\n    while True:\n        pass\n").unwrap();
        let started = Instant::now();
        let result = run_async(Duration::from_millis(200), move |deadline| {
            let mut instance = Instance::load(&program, &SandboxPolicy::local(), deadline)?;
            instance.call_positional("spin", &[])
        })
        .await;
        assert_eq!(result.unwrap_err(), ScriptError::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_run_blocking_returns_value() {
        let program = Program::compile("def add(a, b=2):\n    return a + b\n").unwrap();
        let value = run_blocking(Duration::from_secs(2), move |deadline| {
            let mut instance =
                Instance::load(&program, &SandboxPolicy::sandboxed(10_000), deadline)?;
            instance.call_positional("add", &[json!(40)])
        })
        .unwrap();
        assert_eq!(value.json, json!(42));
    }
}
