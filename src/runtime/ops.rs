// src/runtime/ops.rs
//! Host ops reachable from inside a sandboxed isolate
//!
//! Ops are only callable through closures installed during bootstrap; the
//! `Deno` bridge itself is deleted before tenant code runs.

use deno_core::{op2, OpState};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Write;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::Notify;

/// Serialized envelope reported by the execution wrapper
#[derive(Debug, Clone)]
pub struct ScriptOutput(pub String);

/// Secret the host passes to the kernel's entry points
#[derive(Debug, Clone)]
pub struct EntryToken(pub String);

/// Identity of the instance an op runs in, used for log context
#[derive(Debug, Clone)]
pub struct InstanceTag {
    pub instance_id: u64,
    pub debug_logging: bool,
}

/// Longest single timer delay accepted from tenant code
pub const MAX_TIMER_DELAY_MS: u32 = 60_000;

/// Pending timers, keyed by the id handed to tenant code
#[derive(Default)]
pub struct TimerTable {
    pending: HashMap<u32, Rc<Notify>>,
}

impl TimerTable {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

deno_core::extension!(
    sandbox_ext,
    ops = [
        op_sandbox_set_result,
        op_sandbox_log,
        op_sandbox_timer_sleep,
        op_sandbox_timer_clear,
        op_sandbox_hex_encode,
        op_sandbox_utf8_length,
    ],
);

#[op2(fast)]
pub fn op_sandbox_set_result(state: &mut OpState, #[string] envelope: String) {
    state.put(ScriptOutput(envelope));
}

#[op2(fast)]
pub fn op_sandbox_log(state: &mut OpState, #[string] level: String, #[string] message: String) {
    let Some(tag) = state.try_borrow::<InstanceTag>() else {
        return;
    };
    if !tag.debug_logging {
        return;
    }
    let instance = tag.instance_id;
    match level.as_str() {
        "error" => tracing::error!(target: "sandbox::console", instance, "{}", message),
        "warn" => tracing::warn!(target: "sandbox::console", instance, "{}", message),
        "debug" => tracing::debug!(target: "sandbox::console", instance, "{}", message),
        _ => tracing::info!(target: "sandbox::console", instance, "{}", message),
    }
}

/// Resolves `true` once the delay elapses, `false` if the timer was cleared.
#[op2(async)]
pub async fn op_sandbox_timer_sleep(
    state: Rc<RefCell<OpState>>,
    #[smi] id: u32,
    #[smi] millis: u32,
) -> bool {
    let cancel = Rc::new(Notify::new());
    {
        let mut state = state.borrow_mut();
        if !state.has::<TimerTable>() {
            state.put(TimerTable::default());
        }
        state
            .borrow_mut::<TimerTable>()
            .pending
            .insert(id, cancel.clone());
    }

    let delay = Duration::from_millis(millis.min(MAX_TIMER_DELAY_MS) as u64);
    let fired = tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.notified() => false,
    };

    if let Some(table) = state.borrow_mut().try_borrow_mut::<TimerTable>() {
        table.pending.remove(&id);
    }
    fired
}

#[op2(fast)]
pub fn op_sandbox_timer_clear(state: &mut OpState, #[smi] id: u32) {
    if let Some(table) = state.try_borrow_mut::<TimerTable>() {
        if let Some(cancel) = table.pending.remove(&id) {
            cancel.notify_one();
        }
    }
}

/// Lowercase hex of the UTF-8 bytes of `text`
#[op2]
#[string]
pub fn op_sandbox_hex_encode(#[string] text: &str) -> String {
    hex_encode(text.as_bytes())
}

#[op2(fast)]
pub fn op_sandbox_utf8_length(#[string] text: &str) -> u32 {
    text.len() as u32
}

pub fn hex_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
            let _ = write!(out, "{:02x}", byte);
            out
        })
}
