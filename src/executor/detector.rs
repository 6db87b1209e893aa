// src/executor/detector.rs
//! Static check deciding which execution path a script takes

use once_cell::sync::Lazy;
use regex::Regex;

/// Constructs that need an event loop (timers, promises, async functions)
static ASYNC_CONSTRUCTS: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"\b(?:setTimeout|setInterval|setImmediate|queueMicrotask|Promise|async|await)\b|\.then\s*\(",
    )
    .ok()
});

/// Conservative detector: a false positive only costs a one-shot instance
pub struct AsyncDetector;

impl AsyncDetector {
    /// Whether `code` must run on the async (one-shot) path
    pub fn requires_async(code: &str) -> bool {
        match ASYNC_CONSTRUCTS.as_ref() {
            Some(pattern) => pattern.is_match(code),
            // unreachable with a valid pattern; the async path runs anything
            None => true,
        }
    }
}
