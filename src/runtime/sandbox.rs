// src/runtime/sandbox.rs
//! Layered lock-down applied to every isolate before tenant code runs
//!
//! The bootstrap is a fixed sequence; each step closes a different class of
//! escape vector:
//!
//! ```text
//! Uninitialized
//!   → BaseCapabilitiesLoaded   kernel + Base modules (default object graph)
//!   → GloballyRestricted       eval/Function stubbed, aliases + reflection removed
//!   → ConstructorLocked        `constructor` trapped on every built-in prototype
//!   → ModulesAttached          Locked modules (may extend prototypes)
//!   → Ready                    reset baseline captured
//! ```
//!
//! Any failure is fatal for the instance: it is discarded and never reaches
//! the pool.

use crate::runtime::modules::{run_script, ModuleContext, ModuleRegistry, ModuleStage};
use crate::runtime::ops::EntryToken;
use crate::utils::errors::{EngineError, Result};
use deno_core::JsRuntime;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use ulid::Ulid;

/// Bootstrap progress of one isolate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum SandboxStage {
    Uninitialized,
    BaseCapabilitiesLoaded,
    GloballyRestricted,
    ConstructorLocked,
    ModulesAttached,
    Ready,
}

impl SandboxStage {
    /// The only stage reachable from this one
    pub fn next(self) -> Option<SandboxStage> {
        match self {
            Self::Uninitialized => Some(Self::BaseCapabilitiesLoaded),
            Self::BaseCapabilitiesLoaded => Some(Self::GloballyRestricted),
            Self::GloballyRestricted => Some(Self::ConstructorLocked),
            Self::ConstructorLocked => Some(Self::ModulesAttached),
            Self::ModulesAttached => Some(Self::Ready),
            Self::Ready => None,
        }
    }
}

/// Enforces one-step, forward-only transitions
#[derive(Debug)]
pub struct StageTracker {
    stage: SandboxStage,
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            stage: SandboxStage::Uninitialized,
        }
    }

    pub fn stage(&self) -> SandboxStage {
        self.stage
    }

    pub fn advance(&mut self, to: SandboxStage) -> Result<()> {
        if self.stage.next() != Some(to) {
            return Err(EngineError::setup(
                self.stage,
                format!("illegal transition {:?} -> {:?}", self.stage, to),
            ));
        }
        self.stage = to;
        Ok(())
    }
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Kernel installed first: captures primitives before they are removed and
/// exposes the execution wrapper plus the per-execution reset.
///
/// Tenant code arrives as a string and is compiled by the captured
/// `Function`/`AsyncFunction` constructors, so it can only ever be a function
/// body: it cannot close the wrapper and declare script-scope bindings.
const KERNEL_JS: &str = r#"
((ops) => {
  'use strict';
  const global = globalThis;
  const {
    defineProperty, getOwnPropertyDescriptor, getPrototypeOf, freeze, isExtensible,
  } = Object;
  const { ownKeys, deleteProperty, apply, setPrototypeOf } = Reflect;
  const { stringify, parse } = JSON;
  const objectIs = Object.is;
  const PromiseCtor = Promise;
  const promiseThen = Promise.prototype.then;
  const regexpExec = RegExp.prototype.exec;
  const ErrorCtor = Error;
  const FunctionCtor = Function;
  const AsyncFunctionCtor = getPrototypeOf(async function () {}).constructor;
  const setResult = ops.op_sandbox_set_result;
  const entryToken = '__ENTRY_TOKEN__';

  // Intrinsics only reachable through instances, never through a property
  // of the global graph.
  const hiddenIntrinsics = [
    getPrototypeOf([][Symbol.iterator]()),
    getPrototypeOf(new Map()[Symbol.iterator]()),
    getPrototypeOf(new Set()[Symbol.iterator]()),
    getPrototypeOf(''[Symbol.iterator]()),
    getPrototypeOf(/(?:)/g[Symbol.matchAll]('')),
    getPrototypeOf(function* () {}),
    getPrototypeOf(async function () {}),
    getPrototypeOf(async function* () {}),
  ];
  if (typeof Iterator === 'function' && typeof Iterator.prototype.map === 'function') {
    hiddenIntrinsics.push(getPrototypeOf([].values().map((x) => x)));
  }

  const fail = (message) => {
    const err = new ErrorCtor(message);
    err.name = 'SecurityError';
    return err;
  };

  const isObject = (v) => v !== null && (typeof v === 'object' || typeof v === 'function');

  const deepFreeze = (value) => {
    if (isObject(value)) {
      for (const key of ownKeys(value)) deepFreeze(value[key]);
      freeze(value);
    }
    return value;
  };

  const encodeOk = (value) => stringify({ ok: value === undefined ? null : value });
  const encodeErr = (err) => {
    let name = 'Error';
    let message = '';
    try {
      if (isObject(err)) {
        name = err.name === undefined ? 'Error' : String(err.name);
        message = err.message === undefined ? '' : String(err.message);
      } else {
        message = String(err);
      }
    } catch (_) {
      message = 'unreadable error';
    }
    return stringify({ error: { name, message } });
  };
  const settle = (value) => {
    let envelope;
    try { envelope = encodeOk(value); } catch (err) { envelope = encodeErr(err); }
    setResult(envelope);
  };
  const reject = (err) => { setResult(encodeErr(err)); };

  let baseline = null;
  const sameDescriptor = (a, b) =>
    objectIs(a.value, b.value) && a.get === b.get && a.set === b.set &&
    a.writable === b.writable && a.enumerable === b.enumerable &&
    a.configurable === b.configurable;

  const capture = () => {
    if (baseline !== null) throw fail('sandbox baseline already captured');
    const seen = new Set();
    const entries = [];
    const pending = [global, ...hiddenIntrinsics];
    while (pending.length > 0) {
      const target = pending.pop();
      if (!isObject(target) || seen.has(target)) continue;
      seen.add(target);
      const props = new Map();
      for (const key of ownKeys(target)) {
        const desc = getOwnPropertyDescriptor(target, key);
        props.set(key, desc);
        if ('value' in desc) pending.push(desc.value);
        if (desc.get) pending.push(desc.get);
        if (desc.set) pending.push(desc.set);
      }
      const proto = getPrototypeOf(target);
      pending.push(proto);
      entries.push({ target, props, proto, extensible: isExtensible(target) });
    }
    baseline = entries;
    return entries.length;
  };

  const reset = () => {
    if (baseline === null) throw fail('sandbox baseline not captured');
    for (const { target, props, proto, extensible } of baseline) {
      if (isExtensible(target) !== extensible) throw fail('extensibility changed');
      if (getPrototypeOf(target) !== proto && !setPrototypeOf(target, proto)) {
        throw fail('cannot restore prototype');
      }
      for (const key of ownKeys(target)) {
        if (!props.has(key) && !deleteProperty(target, key)) {
          throw fail('cannot remove tenant property');
        }
      }
      for (const [key, desc] of props) {
        const current = getOwnPropertyDescriptor(target, key);
        if (current === undefined || !sameDescriptor(current, desc)) {
          defineProperty(target, key, desc);
        }
      }
    }
    apply(regexpExec, /(?:)/, ['']);
    return true;
  };

  const strictBody = (body) => '"use strict";\n' + body;
  const admit = (token) => {
    if (token !== entryToken) throw fail('capability disabled: sandbox entry');
  };

  const run = (token, body, inputJson) => {
    admit(token);
    try {
      const fn = FunctionCtor('input', strictBody(body));
      settle(apply(fn, undefined, [deepFreeze(parse(inputJson))]));
    } catch (err) {
      reject(err);
    }
  };

  const runAsync = (token, body, inputJson) => {
    admit(token);
    let fn;
    let input;
    try {
      fn = AsyncFunctionCtor('input', strictBody(body));
      input = deepFreeze(parse(inputJson));
    } catch (err) {
      reject(err);
      return;
    }
    const pending = apply(promiseThen, PromiseCtor.resolve(), [() => apply(fn, undefined, [input])]);
    apply(promiseThen, pending, [settle, reject]);
  };

  defineProperty(global, '__sandbox', {
    value: freeze({ fail, run, runAsync, capture, reset }),
    writable: false,
    configurable: false,
    enumerable: false,
  });
})(Deno.core.ops);
"#;

/// Step 2: neutralize dynamic code evaluation, global aliases and
/// reflection primitives. The op table is parked as `__sandboxOps` for
/// Locked modules.
const RESTRICT_JS: &str = r#"
((kernel, ops) => {
  'use strict';
  const global = globalThis;
  const { defineProperty, getPrototypeOf } = Object;
  const disabled = (name) => function () {
    throw kernel.fail('capability disabled: ' + name);
  };

  const functionPrototype = getPrototypeOf(function () {});
  const functionStub = disabled('Function');
  defineProperty(functionStub, 'prototype', {
    value: functionPrototype, writable: false, enumerable: false, configurable: false,
  });
  for (const [name, stub] of [['eval', disabled('eval')], ['Function', functionStub]]) {
    defineProperty(global, name, {
      value: stub, writable: false, enumerable: false, configurable: false,
    });
  }

  defineProperty(global.Error, 'prepareStackTrace', {
    value: undefined, writable: false, enumerable: false, configurable: false,
  });

  defineProperty(global, '__sandboxOps', {
    value: ops, writable: false, enumerable: false, configurable: true,
  });

  const removed = [
    'Reflect', 'Proxy', 'WebAssembly', 'SharedArrayBuffer', 'Atomics',
    'WeakRef', 'FinalizationRegistry', 'Deno', '__bootstrap',
    'self', 'window', 'global', 'globalThis',
  ];
  for (const name of removed) {
    if (!delete global[name]) throw kernel.fail('could not remove ' + name);
  }
})(__sandbox, Deno.core.ops);
"#;

/// Step 3: trap `constructor` on every built-in prototype without freezing
/// the prototypes themselves.
const LOCK_CONSTRUCTORS_JS: &str = r#"
((kernel) => {
  'use strict';
  const { defineProperty, getOwnPropertyDescriptor, getPrototypeOf } = Object;

  const functionFamily = [
    getPrototypeOf(function () {}),
    getPrototypeOf(async function () {}),
    getPrototypeOf(function* () {}),
    getPrototypeOf(async function* () {}),
  ];
  for (const proto of functionFamily) {
    defineProperty(proto, 'constructor', {
      get() { throw kernel.fail('capability disabled: Function constructor'); },
      set(_) { throw kernel.fail('capability disabled: Function constructor'); },
      enumerable: false,
      configurable: false,
    });
  }

  const lock = (proto, fallback) => {
    const desc = getOwnPropertyDescriptor(proto, 'constructor');
    if (desc === undefined || !desc.configurable) return;
    const value = 'value' in desc ? desc.value : fallback;
    defineProperty(proto, 'constructor', {
      get() { return value; },
      set(next) {
        if (this === proto) throw kernel.fail('cannot replace built-in constructor');
        defineProperty(this, 'constructor', {
          value: next, writable: true, enumerable: true, configurable: true,
        });
      },
      enumerable: false,
      configurable: false,
    });
  };

  const builtins = [
    Object, Array, String, Number, Boolean, Symbol, BigInt, Date, RegExp,
    Error, TypeError, RangeError, SyntaxError, ReferenceError, EvalError, URIError,
    AggregateError, Map, Set, WeakMap, WeakSet, Promise, ArrayBuffer, DataView,
    Int8Array, Uint8Array, Uint8ClampedArray, Int16Array, Uint16Array,
    Int32Array, Uint32Array, Float32Array, Float64Array, BigInt64Array, BigUint64Array,
    getPrototypeOf(Int8Array),
  ];
  for (const ctor of builtins) lock(ctor.prototype, ctor);

  const iteratorProto = getPrototypeOf(getPrototypeOf([][Symbol.iterator]()));
  lock(iteratorProto, undefined);
  lock(getPrototypeOf(function* () {}).prototype, undefined);
  lock(getPrototypeOf(async function* () {}).prototype, undefined);
})(__sandbox);
"#;

/// Step 4 tail: hide the op table once Locked modules are attached.
const DETACH_OPS_JS: &str = r#"
(() => {
  'use strict';
  if (!delete this.__sandboxOps) {
    throw __sandbox.fail('could not detach host ops');
  }
}).call(this);
"#;

/// Step 5: freeze the reset baseline.
const CAPTURE_BASELINE_JS: &str = "__sandbox.capture();";

/// Applies the bootstrap sequence to fresh isolates
#[derive(Clone)]
pub struct SecuritySandbox {
    registry: Arc<ModuleRegistry>,
}

impl SecuritySandbox {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// Run the full sequence; returns the reached stage (always `Ready`)
    ///
    /// The kernel's entry points only accept the per-instance token left in
    /// the op state as [`EntryToken`].
    pub fn bootstrap(&self, runtime: &mut JsRuntime, ctx: &ModuleContext) -> Result<SandboxStage> {
        let mut tracker = StageTracker::new();

        let token = Ulid::new().to_string();
        let kernel = KERNEL_JS.replace("__ENTRY_TOKEN__", &token);
        self.step(runtime, &tracker, "[sandbox:kernel]", &kernel)?;
        runtime.op_state().borrow_mut().put(EntryToken(token));
        self.registry
            .install(ModuleStage::Base, runtime, ctx)
            .map_err(|e| EngineError::setup(tracker.stage(), format!("{:#}", e)))?;
        tracker.advance(SandboxStage::BaseCapabilitiesLoaded)?;

        self.step(runtime, &tracker, "[sandbox:restrict]", RESTRICT_JS)?;
        tracker.advance(SandboxStage::GloballyRestricted)?;

        self.step(runtime, &tracker, "[sandbox:constructors]", LOCK_CONSTRUCTORS_JS)?;
        tracker.advance(SandboxStage::ConstructorLocked)?;

        self.registry
            .install(ModuleStage::Locked, runtime, ctx)
            .map_err(|e| EngineError::setup(tracker.stage(), format!("{:#}", e)))?;
        self.step(runtime, &tracker, "[sandbox:detach]", DETACH_OPS_JS)?;
        tracker.advance(SandboxStage::ModulesAttached)?;

        self.step(runtime, &tracker, "[sandbox:baseline]", CAPTURE_BASELINE_JS)?;
        tracker.advance(SandboxStage::Ready)?;

        debug!(instance = ctx.instance_id, kind = ?ctx.kind, "sandbox ready");
        Ok(tracker.stage())
    }

    /// Restore the Ready baseline after a pooled execution
    pub fn reset(runtime: &mut JsRuntime) -> Result<()> {
        run_script(runtime, "[sandbox:reset]", "__sandbox.reset();".to_string())
            .map_err(|e| EngineError::setup(SandboxStage::Ready, format!("reset failed: {:#}", e)))
    }

    fn step(
        &self,
        runtime: &mut JsRuntime,
        tracker: &StageTracker,
        name: &'static str,
        source: &str,
    ) -> Result<()> {
        run_script(runtime, name, source.to_string())
            .map_err(|e| EngineError::setup(tracker.stage(), format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::instance::InstanceKind;
    use crate::runtime::modules::{SandboxModule, TimersModule};
    use crate::runtime::ops::sandbox_ext;
    use deno_core::RuntimeOptions;

    fn fresh_runtime() -> JsRuntime {
        JsRuntime::new(RuntimeOptions {
            extensions: vec![sandbox_ext::init()],
            ..Default::default()
        })
    }

    fn ctx(kind: InstanceKind) -> ModuleContext {
        ModuleContext {
            instance_id: 1,
            kind,
            debug_logging: false,
        }
    }

    fn eval_bool(runtime: &mut JsRuntime, expr: &str) -> bool {
        // Check through a throwing statement so no handle scope is needed.
        let source = format!("if (!({})) throw new Error('check failed');", expr);
        runtime.execute_script("[check]", source).is_ok()
    }

    #[test]
    fn test_stage_transitions_are_forward_only() {
        let mut tracker = StageTracker::new();
        assert!(tracker.advance(SandboxStage::GloballyRestricted).is_err());
        tracker.advance(SandboxStage::BaseCapabilitiesLoaded).unwrap();
        tracker.advance(SandboxStage::GloballyRestricted).unwrap();
        assert!(tracker.advance(SandboxStage::BaseCapabilitiesLoaded).is_err());
        assert_eq!(tracker.stage(), SandboxStage::GloballyRestricted);
        assert_eq!(SandboxStage::Ready.next(), None);
    }

    #[test]
    fn test_bootstrap_reaches_ready() {
        let mut runtime = fresh_runtime();
        let sandbox = SecuritySandbox::new(Arc::new(ModuleRegistry::with_builtins()));
        let stage = sandbox.bootstrap(&mut runtime, &ctx(InstanceKind::Pooled)).unwrap();
        assert_eq!(stage, SandboxStage::Ready);
    }

    #[test]
    fn test_escape_primitives_removed() {
        let mut runtime = fresh_runtime();
        let sandbox = SecuritySandbox::new(Arc::new(ModuleRegistry::with_builtins()));
        sandbox.bootstrap(&mut runtime, &ctx(InstanceKind::Pooled)).unwrap();

        assert!(eval_bool(&mut runtime, "typeof Deno === 'undefined'"));
        assert!(eval_bool(&mut runtime, "typeof Reflect === 'undefined'"));
        assert!(eval_bool(&mut runtime, "typeof Proxy === 'undefined'"));
        assert!(eval_bool(&mut runtime, "typeof globalThis === 'undefined'"));
        assert!(eval_bool(&mut runtime, "typeof __sandboxOps === 'undefined'"));
        assert!(eval_bool(
            &mut runtime,
            "(() => { try { eval('1'); return false; } catch (e) { return e.name === 'SecurityError'; } })()"
        ));
        assert!(eval_bool(
            &mut runtime,
            "(() => { try { ({}).constructor.constructor('return 1'); return false; } catch (e) { return e.name === 'SecurityError'; } })()"
        ));
        assert!(eval_bool(
            &mut runtime,
            "(() => { try { __sandbox.run('', 'return 1;', '{}'); return false; } catch (e) { return e.name === 'SecurityError'; } })()"
        ));
        // species lookups still work
        assert!(eval_bool(&mut runtime, "[1, 2, 3].map((x) => x * 2)[2] === 6"));
        assert!(eval_bool(&mut runtime, "({}).constructor === Object"));
    }

    #[test]
    fn test_pooled_instances_have_no_timers() {
        let mut runtime = fresh_runtime();
        let sandbox = SecuritySandbox::new(Arc::new(ModuleRegistry::with_builtins()));
        sandbox.bootstrap(&mut runtime, &ctx(InstanceKind::Pooled)).unwrap();
        assert!(eval_bool(&mut runtime, "typeof setTimeout === 'undefined'"));
        assert!(TimersModule.applies_to(InstanceKind::OneShot));
    }

    #[test]
    fn test_reset_removes_tenant_globals_and_prototype_pollution() {
        let mut runtime = fresh_runtime();
        let sandbox = SecuritySandbox::new(Arc::new(ModuleRegistry::with_builtins()));
        sandbox.bootstrap(&mut runtime, &ctx(InstanceKind::Pooled)).unwrap();

        runtime
            .execute_script(
                "[tenant]",
                "this.leaked = 42; Array.prototype.evil = 1; Math.max = () => 0;".to_string(),
            )
            .unwrap();
        SecuritySandbox::reset(&mut runtime).unwrap();

        assert!(eval_bool(&mut runtime, "typeof leaked === 'undefined'"));
        assert!(eval_bool(&mut runtime, "[].evil === undefined"));
        assert!(eval_bool(&mut runtime, "Math.max(1, 2) === 2"));
    }

    #[test]
    fn test_reset_restores_swapped_prototypes() {
        let mut runtime = fresh_runtime();
        let sandbox = SecuritySandbox::new(Arc::new(ModuleRegistry::with_builtins()));
        sandbox.bootstrap(&mut runtime, &ctx(InstanceKind::Pooled)).unwrap();

        runtime
            .execute_script(
                "[tenant]",
                "Object.setPrototypeOf(JSON, { leak: 'secret-A' }); Object.setPrototypeOf(Math, null);"
                    .to_string(),
            )
            .unwrap();
        SecuritySandbox::reset(&mut runtime).unwrap();

        assert!(eval_bool(&mut runtime, "JSON.leak === undefined"));
        assert!(eval_bool(&mut runtime, "Object.getPrototypeOf(JSON) === Object.prototype"));
        assert!(eval_bool(&mut runtime, "Object.getPrototypeOf(Math) === Object.prototype"));
    }

    #[test]
    fn test_reset_covers_intrinsics_reachable_only_through_instances() {
        let mut runtime = fresh_runtime();
        let sandbox = SecuritySandbox::new(Arc::new(ModuleRegistry::with_builtins()));
        sandbox.bootstrap(&mut runtime, &ctx(InstanceKind::Pooled)).unwrap();

        let intrinsics = [
            "Object.getPrototypeOf([][Symbol.iterator]())",
            "Object.getPrototypeOf(new Map()[Symbol.iterator]())",
            "Object.getPrototypeOf(new Set()[Symbol.iterator]())",
            "Object.getPrototypeOf(''[Symbol.iterator]())",
            "Object.getPrototypeOf(/a/g[Symbol.matchAll](''))",
            "Object.getPrototypeOf(function* () {})",
            "Object.getPrototypeOf(async function () {})",
            "Object.getPrototypeOf(async function* () {})",
        ];
        for intrinsic in intrinsics {
            runtime
                .execute_script("[tenant]", format!("({}).leak = 'secret-A';", intrinsic))
                .unwrap();
            SecuritySandbox::reset(&mut runtime).unwrap();
            assert!(
                eval_bool(&mut runtime, &format!("({}).leak === undefined", intrinsic)),
                "{} kept a tenant property",
                intrinsic
            );
        }
    }

    #[test]
    fn test_reset_fails_when_prototype_frozen() {
        let mut runtime = fresh_runtime();
        let sandbox = SecuritySandbox::new(Arc::new(ModuleRegistry::with_builtins()));
        sandbox.bootstrap(&mut runtime, &ctx(InstanceKind::Pooled)).unwrap();

        runtime
            .execute_script("[tenant]", "Object.freeze(Array.prototype);".to_string())
            .unwrap();
        assert!(SecuritySandbox::reset(&mut runtime).is_err());
    }

    #[test]
    fn test_baseline_capture_is_one_shot() {
        let mut runtime = fresh_runtime();
        let sandbox = SecuritySandbox::new(Arc::new(ModuleRegistry::with_builtins()));
        sandbox.bootstrap(&mut runtime, &ctx(InstanceKind::Pooled)).unwrap();
        assert!(runtime
            .execute_script("[tenant]", "__sandbox.capture();".to_string())
            .is_err());
    }
}
