// src/runtime/modules.rs
//! Builtin capability modules and the registry that installs them
//!
//! A module is trusted host code that extends the sandbox. The sandbox calls
//! [`ModuleRegistry::install`] twice per instance: once for
//! [`ModuleStage::Base`] modules while the global graph is still in default
//! shape, and once for [`ModuleStage::Locked`] modules after escape
//! primitives are gone and constructors are trapped.
//!
//! Base modules reach host ops through `Deno.core.ops`; locked modules get
//! the same op table as `__sandboxOps`, which is deleted once they are done.

use crate::runtime::instance::InstanceKind;
use anyhow::{anyhow, Context};
use deno_core::{JsRuntime, RuntimeOptions};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// When a module is installed relative to lock-down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStage {
    /// Before escape primitives are removed
    Base,
    /// After constructors are trapped
    Locked,
}

/// What a module may know about the instance it is installed into
#[derive(Debug, Clone)]
pub struct ModuleContext {
    pub instance_id: u64,
    pub kind: InstanceKind,
    pub debug_logging: bool,
}

/// Contract for builtin capabilities
///
/// `setup` runs on the instance's own thread, once, strictly before tenant
/// code. `precompile` runs once at process start; a failure aborts startup.
pub trait SandboxModule: Send + Sync {
    fn name(&self) -> &'static str;

    fn stage(&self) -> ModuleStage;

    /// Whether this module is installed into instances of `kind`
    fn applies_to(&self, _kind: InstanceKind) -> bool {
        true
    }

    fn setup(&self, runtime: &mut JsRuntime, ctx: &ModuleContext) -> anyhow::Result<()>;

    fn precompile(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ordered set of modules shared by every instance
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn SandboxModule>>,
}

impl ModuleRegistry {
    /// Empty registry (sandbox core only)
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `console`, `timers` and `encoding`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.modules.push(Arc::new(ConsoleModule));
        registry.modules.push(Arc::new(TimersModule));
        registry.modules.push(Arc::new(EncodingModule));
        registry
    }

    /// Register a module; names must be unique
    pub fn register(&mut self, module: Arc<dyn SandboxModule>) -> anyhow::Result<()> {
        if self.modules.iter().any(|m| m.name() == module.name()) {
            return Err(anyhow!("module '{}' is already registered", module.name()));
        }
        self.modules.push(module);
        Ok(())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Install every module of `stage` that applies to this instance
    pub fn install(
        &self,
        stage: ModuleStage,
        runtime: &mut JsRuntime,
        ctx: &ModuleContext,
    ) -> anyhow::Result<()> {
        for module in self
            .modules
            .iter()
            .filter(|m| m.stage() == stage && m.applies_to(ctx.kind))
        {
            debug!(instance = ctx.instance_id, module = module.name(), "installing module");
            module
                .setup(runtime, ctx)
                .with_context(|| format!("module '{}' setup failed", module.name()))?;
        }
        Ok(())
    }

    /// Validate every module's embedded assets before accepting traffic
    pub fn precompile_all(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for module in &self.modules {
            if !seen.insert(module.name()) {
                return Err(anyhow!("duplicate module name '{}'", module.name()));
            }
            module
                .precompile()
                .with_context(|| format!("module '{}' failed to precompile", module.name()))?;
        }
        info!(modules = ?self.names(), "sandbox modules precompiled");
        Ok(())
    }
}

/// Run a trusted script, discarding its completion value
pub fn run_script(runtime: &mut JsRuntime, name: &'static str, source: String) -> anyhow::Result<()> {
    runtime
        .execute_script(name, source)
        .map(|_| ())
        .map_err(|e| anyhow!("{}: {}", name, e))
}

/// Parse `source` in a scratch isolate without running it
///
/// The body is wrapped in an uncalled function expression, so only early
/// (syntax) errors surface.
pub fn check_syntax(name: &'static str, source: &str) -> anyhow::Result<()> {
    let mut scratch = JsRuntime::new(RuntimeOptions::default());
    let wrapped = format!("(function () {{\n{}\n}});", source);
    run_script(&mut scratch, name, wrapped)
}

// Builtin modules

const CONSOLE_JS: &str = r#"
((ops, enabled) => {
  const format = (args) => args.map((value) => {
    if (typeof value === 'string') return value;
    try { return JSON.stringify(value); } catch (_) { return String(value); }
  }).join(' ');
  const disabled = () => {
    const err = new Error('capability disabled: console');
    err.name = 'SecurityError';
    throw err;
  };
  const make = (level) => enabled
    ? (...args) => { ops.op_sandbox_log(level, format(args)); }
    : disabled;
  Object.defineProperty(globalThis, 'console', {
    value: Object.freeze({
      log: make('info'),
      info: make('info'),
      warn: make('warn'),
      error: make('error'),
      debug: make('debug'),
    }),
    writable: false,
    configurable: false,
    enumerable: false,
  });
})(Deno.core.ops, __ENABLED__);
"#;

/// `console.*`: forwarded to the host log, or a capability-disabled error
pub struct ConsoleModule;

impl SandboxModule for ConsoleModule {
    fn name(&self) -> &'static str {
        "console"
    }

    fn stage(&self) -> ModuleStage {
        ModuleStage::Base
    }

    fn setup(&self, runtime: &mut JsRuntime, ctx: &ModuleContext) -> anyhow::Result<()> {
        let source = CONSOLE_JS.replace("__ENABLED__", if ctx.debug_logging { "true" } else { "false" });
        run_script(runtime, "[sandbox:console]", source)
    }

    fn precompile(&self) -> anyhow::Result<()> {
        check_syntax("[sandbox:console:check]", &CONSOLE_JS.replace("__ENABLED__", "false"))
    }
}

const TIMERS_JS: &str = r#"
((ops) => {
  const sleep = ops.op_sandbox_timer_sleep;
  const cancel = ops.op_sandbox_timer_clear;
  const active = new Set();
  let nextId = 1;
  const clamp = (ms) => {
    const n = Number(ms);
    return Number.isFinite(n) && n > 0 ? Math.min(Math.floor(n), 60000) : 0;
  };
  const schedule = (callback, delay, args, repeat) => {
    if (typeof callback !== 'function') {
      throw new TypeError('timer callback must be a function');
    }
    const id = nextId++;
    const ms = clamp(delay);
    active.add(id);
    const arm = () => {
      sleep(id, ms).then((fired) => {
        if (!fired || !active.has(id)) return;
        if (!repeat) active.delete(id);
        callback(...args);
        if (repeat && active.has(id)) arm();
      });
    };
    arm();
    return id;
  };
  const clear = (id) => {
    if (active.delete(id)) cancel(id);
  };
  const define = (name, value) => Object.defineProperty(globalThis, name, {
    value, writable: false, configurable: false, enumerable: false,
  });
  define('setTimeout', (callback, ms, ...args) => schedule(callback, ms, args, false));
  define('setInterval', (callback, ms, ...args) => schedule(callback, ms, args, true));
  define('setImmediate', (callback, ...args) => schedule(callback, 0, args, false));
  define('clearTimeout', clear);
  define('clearInterval', clear);
  define('clearImmediate', clear);
  const existing = Object.getOwnPropertyDescriptor(globalThis, 'queueMicrotask');
  if (existing === undefined || existing.configurable) {
    define('queueMicrotask', (callback) => {
      if (typeof callback !== 'function') {
        throw new TypeError('microtask callback must be a function');
      }
      Promise.resolve().then(() => callback());
    });
  }
})(Deno.core.ops);
"#;

/// Timer functions, only for one-shot async instances
pub struct TimersModule;

impl SandboxModule for TimersModule {
    fn name(&self) -> &'static str {
        "timers"
    }

    fn stage(&self) -> ModuleStage {
        ModuleStage::Base
    }

    fn applies_to(&self, kind: InstanceKind) -> bool {
        kind == InstanceKind::OneShot
    }

    fn setup(&self, runtime: &mut JsRuntime, _ctx: &ModuleContext) -> anyhow::Result<()> {
        run_script(runtime, "[sandbox:timers]", TIMERS_JS.to_string())
    }

    fn precompile(&self) -> anyhow::Result<()> {
        check_syntax("[sandbox:timers:check]", TIMERS_JS)
    }
}

const ENCODING_JS: &str = r#"
((ops) => {
  const hexOf = (bytes) => Array.from(bytes, (b) => (b < 16 ? '0' : '') + b.toString(16)).join('');
  const utf8Bytes = (text) => {
    const escaped = encodeURIComponent(String(text));
    const out = [];
    for (let i = 0; i < escaped.length; i++) {
      if (escaped[i] === '%') {
        out.push(parseInt(escaped.substr(i + 1, 2), 16));
        i += 2;
      } else {
        out.push(escaped.charCodeAt(i));
      }
    }
    return Uint8Array.from(out);
  };
  const fromUtf8 = (bytes) => decodeURIComponent(
    Array.from(bytes, (b) => '%' + (b < 16 ? '0' : '') + b.toString(16)).join('')
  );
  const hexBytes = (hex) => {
    const text = String(hex);
    if (!/^(?:[0-9a-fA-F]{2})*$/.test(text)) {
      throw new TypeError('invalid hex string');
    }
    const out = new Uint8Array(text.length / 2);
    for (let i = 0; i < out.length; i++) {
      out[i] = parseInt(text.substr(i * 2, 2), 16);
    }
    return out;
  };
  Object.defineProperty(globalThis, 'TextCodec', {
    value: Object.freeze({
      encodeHex: (text) => ops.op_sandbox_hex_encode(String(text)),
      decodeHex: (hex) => fromUtf8(hexBytes(hex)),
      utf8Length: (text) => ops.op_sandbox_utf8_length(String(text)),
      toBytes: utf8Bytes,
      fromBytes: fromUtf8,
    }),
    writable: false,
    configurable: false,
    enumerable: false,
  });
  if (typeof Uint8Array.prototype.toHex !== 'function') {
    Object.defineProperty(Uint8Array.prototype, 'toHex', {
      value: function toHex() { return hexOf(this); },
      writable: false,
      configurable: false,
      enumerable: false,
    });
  }
})(__sandboxOps);
"#;

/// Text/hex helpers; extends `Uint8Array.prototype` after lock-down
pub struct EncodingModule;

impl SandboxModule for EncodingModule {
    fn name(&self) -> &'static str {
        "encoding"
    }

    fn stage(&self) -> ModuleStage {
        ModuleStage::Locked
    }

    fn setup(&self, runtime: &mut JsRuntime, _ctx: &ModuleContext) -> anyhow::Result<()> {
        run_script(runtime, "[sandbox:encoding]", ENCODING_JS.to_string())
    }

    fn precompile(&self) -> anyhow::Result<()> {
        check_syntax("[sandbox:encoding:check]", ENCODING_JS)
    }
}
