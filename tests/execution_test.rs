// tests/execution_test.rs
//! End-to-end behavior of the execution core through `ExecutionRouter`

use sandbox_engine::{
    EngineConfig, EngineError, ErrorKind, ExecutionPath, ExecutionRouter, ModuleRegistry,
    ScriptErrorKind,
};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn input(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn config(min: usize, max: usize, max_concurrent: usize) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.pool.min_size = min;
    config.pool.max_size = max;
    config.pool.acquire_timeout_ms = 10_000;
    config.limits.max_concurrent = max_concurrent;
    config.limits.gate_timeout_ms = 10_000;
    config.limits.execution_timeout_ms = 10_000;
    config
}

async fn start(config: &EngineConfig) -> Arc<ExecutionRouter> {
    Arc::new(
        ExecutionRouter::start(config, ModuleRegistry::with_builtins())
            .await
            .unwrap(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_within_limit_all_complete() {
    let router = start(&config(2, 4, 8)).await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .execute("return input.i * input.i;", input(json!({ "i": i })))
                    .await
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.value, json!(i * i));
    }
    assert_eq!(router.stats().failures.concurrency, 0);
    router.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_excess_requests_fail_with_concurrency_class() {
    let mut config = config(1, 2, 2);
    config.limits.gate_timeout_ms = 50;
    let router = start(&config).await;

    // each holds its permit well past the gate timeout
    let slow = "let s = 0; for (let i = 0; i < 3e8; i++) { s += i; } return s > 0;";
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let router = router.clone();
            tokio::spawn(async move { router.execute(slow, Map::new()).await })
        })
        .collect();

    let mut ok = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(result) => {
                assert_eq!(result.value, json!(true));
                ok += 1;
            }
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::Concurrency, "unexpected error: {}", e);
                assert!(e.is_retryable());
                rejected += 1;
            }
        }
    }
    assert!(ok >= 1);
    assert!(rejected >= 1);
    router.shutdown().await;
}

#[tokio::test]
async fn test_globals_do_not_leak_between_executions() {
    let router = start(&config(1, 1, 4)).await;

    router
        .execute(
            "Object.prototype.secret = input.token; Array.prototype.evil = 1; Math.pow = () => 0; return true;",
            input(json!({ "token": "tenant-a" })),
        )
        .await
        .unwrap();

    let observed = router
        .execute(
            "return [({}).secret === undefined, [].evil === undefined, Math.pow(2, 3)];",
            Map::new(),
        )
        .await
        .unwrap();
    assert_eq!(observed.value, json!([true, true, 8]));
    assert_eq!(router.pool().snapshot().checkouts, 2);
    router.shutdown().await;
}

#[tokio::test]
async fn test_code_cannot_leave_its_function_body() {
    let router = start(&config(1, 1, 4)).await;

    // closing the wrapper early would leave a script-scope binding behind
    let breakout = "return 1;\n}, \"{}\");\nlet leaked = \"secret-A\";\n__sandbox.run(function (input) {";
    let err = router.execute(breakout, Map::new()).await.unwrap_err();
    let script = err.script_error().unwrap();
    assert_eq!(script.kind, ScriptErrorKind::Thrown);
    assert_eq!(script.name, "SyntaxError");

    let this_alias = "return 1; }); (function () { return this; })().stash = 'secret-A'; (function () {";
    let err = router.execute(this_alias, Map::new()).await.unwrap_err();
    assert_eq!(err.script_error().unwrap().name, "SyntaxError");

    let observed = router
        .execute(
            "return [typeof leaked === 'string' ? leaked : 'clean', typeof stash];",
            Map::new(),
        )
        .await
        .unwrap();
    assert_eq!(observed.value, json!(["clean", "undefined"]));

    // a later tenant may declare the same name
    let ok = router
        .execute("let leaked = 'mine'; return leaked;", Map::new())
        .await
        .unwrap();
    assert_eq!(ok.value, json!("mine"));
    assert_eq!(router.pool().snapshot().checkouts, 4);
    router.shutdown().await;
}

#[tokio::test]
async fn test_prototype_swaps_do_not_leak_between_executions() {
    let router = start(&config(1, 1, 4)).await;

    router
        .execute(
            "Object.setPrototypeOf(JSON, { leak: input.token }); Object.getPrototypeOf([][Symbol.iterator]()).leak = input.token; return true;",
            input(json!({ "token": "secret-A" })),
        )
        .await
        .unwrap();

    let observed = router
        .execute(
            "return [JSON.leak === undefined, Object.getPrototypeOf([][Symbol.iterator]()).leak === undefined];",
            Map::new(),
        )
        .await
        .unwrap();
    assert_eq!(observed.value, json!([true, true]));
    router.shutdown().await;
}

#[tokio::test]
async fn test_escape_attempts_are_security_errors() {
    let router = start(&config(1, 2, 4)).await;

    for code in [
        "return ({}).constructor.constructor('return this')();",
        "return (function () {}).constructor('return 1')();",
        "return Function('return 1')();",
        "return eval('1 + 1');",
        "return Object.getPrototypeOf(function* () {}).constructor('yield 1');",
        "console.log('hi'); return 1;",
        "return __sandbox.run('', 'return 1;', '{}');",
    ] {
        let err = router.execute(code, Map::new()).await.unwrap_err();
        let script = err.script_error().unwrap_or_else(|| panic!("{}: {}", code, err));
        assert_eq!(script.kind, ScriptErrorKind::Security, "{}: {}", code, err);
    }

    // removed globals are simply gone
    let observed = router
        .execute(
            "return [typeof Reflect, typeof Proxy, typeof globalThis, typeof Deno, typeof WebAssembly];",
            Map::new(),
        )
        .await
        .unwrap();
    assert_eq!(observed.value, json!(["undefined", "undefined", "undefined", "undefined", "undefined"]));

    // species lookups and user classes still work
    let ok = router
        .execute(
            "class A { constructor(v) { this.v = v; } } return [new A(3).v, [1, 2].map((x) => x + 1), new A(1).constructor === A];",
            Map::new(),
        )
        .await
        .unwrap();
    assert_eq!(ok.value, json!([3, [2, 3], true]));
    router.shutdown().await;
}

#[tokio::test]
async fn test_timeout_yields_fresh_instance() {
    let mut config = config(1, 1, 4);
    config.limits.execution_timeout_ms = 200;
    let router = start(&config).await;

    let before = {
        let lease = router.pool().acquire().await.unwrap();
        lease.instance_id()
    };

    let err = router.execute("while (true) {}", Map::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Timeout { .. }));

    let mut after = before;
    for _ in 0..100 {
        if let Ok(lease) = router.pool().acquire().await {
            after = lease.instance_id();
            if after != before {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_ne!(after, before);

    let result = router.execute("return 'alive';", Map::new()).await.unwrap();
    assert_eq!(result.value, json!("alive"));
    router.shutdown().await;
}

#[tokio::test]
async fn test_script_errors_are_typed() {
    let router = start(&config(1, 2, 4)).await;

    let err = router
        .execute("throw new TypeError('nope');", Map::new())
        .await
        .unwrap_err();
    let script = err.script_error().unwrap();
    assert_eq!(script.kind, ScriptErrorKind::Thrown);
    assert_eq!(script.name, "TypeError");
    assert_eq!(script.message, "nope");

    let err = router.execute("return ;;; )(", Map::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);

    // the instance survives both
    let ok = router.execute("return null;", Map::new()).await.unwrap();
    assert_eq!(ok.value, Value::Null);
    router.shutdown().await;
}

#[tokio::test]
async fn test_result_size_limit() {
    let mut config = config(1, 1, 4);
    config.limits.max_result_bytes = 32;
    let router = start(&config).await;

    let err = router
        .execute("return 'x'.repeat(100);", Map::new())
        .await
        .unwrap_err();
    assert_eq!(err.script_error().unwrap().kind, ScriptErrorKind::ResultTooLarge);

    let ok = router.execute("return 'x'.repeat(10);", Map::new()).await.unwrap();
    assert_eq!(ok.value, json!("x".repeat(10)));
    router.shutdown().await;
}

#[tokio::test]
async fn test_heap_limit_is_contained() {
    let mut config = config(1, 1, 4);
    config.limits.max_heap_mb = 16;
    config.limits.execution_timeout_ms = 30_000;
    let router = start(&config).await;

    let err = router
        .execute(
            "const arr = []; while (true) { arr.push(new Array(100000).fill('x')); }",
            Map::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution, "unexpected: {}", err);

    let ok = router.execute("return 1;", Map::new()).await.unwrap();
    assert_eq!(ok.value, json!(1));
    router.shutdown().await;
}

#[tokio::test]
async fn test_builtin_modules_available() {
    let router = start(&config(1, 1, 4)).await;
    let result = router
        .execute(
            "return [TextCodec.encodeHex('hi'), TextCodec.decodeHex('6869'), TextCodec.utf8Length('é'), new Uint8Array([1, 255]).toHex(), TextCodec.encodeHex('é')];",
            Map::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.value, json!(["6869", "hi", 2, "01ff", "c3a9"]));
    router.shutdown().await;
}

#[tokio::test]
async fn test_debug_logging_enables_console() {
    let mut config = config(1, 1, 4);
    config.sandbox.debug_logging = true;
    let router = start(&config).await;
    let result = router
        .execute("console.log('from tenant', input.n); return input.n;", input(json!({ "n": 5 })))
        .await
        .unwrap();
    assert_eq!(result.value, json!(5));
    router.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_mixed_workload_end_to_end() {
    let config = config(2, 4, 20);
    let router = start(&config).await;

    let mut handles = Vec::new();
    for i in 0..50 {
        let router = router.clone();
        handles.push(tokio::spawn(async move {
            router
                .execute("return input.i + 1;", input(json!({ "i": i })))
                .await
        }));
    }
    for i in 0..50 {
        let router = router.clone();
        handles.push(tokio::spawn(async move {
            router
                .execute(
                    "return await new Promise((resolve) => setTimeout(() => resolve(input.i * 2), 5));",
                    input(json!({ "i": i })),
                )
                .await
        }));
    }

    let mut ids = HashSet::new();
    let mut sync = 0;
    let mut deferred = 0;
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert!(ids.insert(result.id.clone()));
        match result.path {
            ExecutionPath::Sync => sync += 1,
            ExecutionPath::Async => deferred += 1,
        }
    }
    assert_eq!(sync, 50);
    assert_eq!(deferred, 50);

    let stats = router.stats();
    assert_eq!(stats.succeeded, 100);
    // the async path never leases from the pool
    assert_eq!(stats.pool.checkouts, 50);
    assert!(stats.pool.live <= config.pool.max_size);
    assert!(stats.pool.live >= config.pool.min_size);
    assert_eq!(stats.in_flight, 0);
    router.shutdown().await;
}
