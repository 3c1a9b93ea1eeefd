//! The hook bus: registration and dispatch.
//!
//! Each hook point owns an `Arc<Vec<..>>` snapshot kept sorted by
//! (priority, registration sequence). Mutations build a new vector and swap
//! it in under the write lock; dispatch clones the `Arc` and releases the
//! lock before any callback runs, so a callback may itself register or
//! unregister hooks without deadlocking.
//!
//! Every callback runs inside `catch_unwind`. Errors and panics are logged
//! and the callback is treated as a no-op.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::HookError;
use crate::hooks::hook::{HookCallback, HookInfo, HookPoint, HookRegistration, HookResult};

#[derive(Debug)]
struct Entry {
    seq: u64,
    registration: HookRegistration,
}

type Snapshot = Arc<Vec<Arc<Entry>>>;

#[derive(Debug, Default)]
struct Inner {
    points: [Snapshot; 10],
    next_seq: u64,
}

/// In-process, multi-point, priority-ordered event bus.
///
/// Dispatch is synchronous: `run_*` returns once every callback at the
/// point has run, and script-backed callbacks may block the calling thread
/// for up to their hook timeout. Async callers go through the blocking pool
/// (see [`ToolRegistry::invoke_with_hooks`](crate::tools::ToolRegistry::invoke_with_hooks)).
#[derive(Debug, Default)]
pub struct HookBus {
    inner: RwLock<Inner>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook. A registration with the same name is replaced,
    /// whichever point it was bound to.
    pub fn register(&self, registration: HookRegistration) {
        let point = registration.point();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let replaced = remove_named(&mut inner, &registration.name);
        if replaced {
            tracing::debug!(hook = %registration.name, "Replacing existing hook registration");
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;

        tracing::debug!(
            hook = %registration.name,
            point = %point,
            priority = registration.priority,
            source = %registration.source,
            "Registered hook"
        );

        let slot = &mut inner.points[point.index()];
        let mut entries: Vec<Arc<Entry>> = slot.as_ref().clone();
        entries.push(Arc::new(Entry { seq, registration }));
        entries.sort_by_key(|e| (e.registration.priority, e.seq));
        *slot = Arc::new(entries);
    }

    /// Remove a hook by name. Returns whether anything was removed.
    pub fn unregister(&self, name: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        remove_named(&mut inner, name)
    }

    /// Remove every hook carrying `source`. Returns how many were removed.
    pub fn unregister_by_source(&self, source: &str) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for slot in inner.points.iter_mut() {
            let before = slot.len();
            if slot.iter().any(|e| e.registration.source == source) {
                let kept: Vec<Arc<Entry>> = slot
                    .iter()
                    .filter(|e| e.registration.source != source)
                    .cloned()
                    .collect();
                removed += before - kept.len();
                *slot = Arc::new(kept);
            }
        }
        if removed > 0 {
            tracing::debug!(source = %source, removed, "Unregistered hooks by source");
        }
        removed
    }

    /// All registrations, grouped by point in declaration order, each group
    /// in dispatch order.
    pub fn list(&self) -> Vec<HookInfo> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .points
            .iter()
            .flat_map(|slot| slot.iter().map(|e| e.registration.info()))
            .collect()
    }

    /// Number of hooks bound to `point`.
    pub fn count(&self, point: HookPoint) -> usize {
        self.snapshot(point).len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for slot in inner.points.iter_mut() {
            *slot = Snapshot::default();
        }
    }

    fn snapshot(&self, point: HookPoint) -> Snapshot {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&inner.points[point.index()])
    }

    // ── blocking pre-hooks ──────────────────────────────────────────────

    pub fn run_pre_tool_call(&self, tool_name: &str, arguments: &serde_json::Value) -> HookResult {
        self.first_block(HookPoint::PreToolCall, tool_name, |cb| match cb {
            HookCallback::PreToolCall(f) => Some(f(tool_name, arguments)),
            _ => None,
        })
    }

    pub fn run_pre_agent_run(&self, message: &str, conversation_id: Option<&str>) -> HookResult {
        self.first_block(HookPoint::PreAgentRun, "agent run", |cb| match cb {
            HookCallback::PreAgentRun(f) => Some(f(message, conversation_id)),
            _ => None,
        })
    }

    pub fn run_pre_memory_store(&self, content: &str, source: &str) -> HookResult {
        self.first_block(HookPoint::PreMemoryStore, "memory store", |cb| match cb {
            HookCallback::PreMemoryStore(f) => Some(f(content, source)),
            _ => None,
        })
    }

    pub fn run_pre_heartbeat(&self, event_count: usize) -> HookResult {
        self.first_block(HookPoint::PreHeartbeat, "heartbeat", |cb| match cb {
            HookCallback::PreHeartbeat(f) => Some(f(event_count)),
            _ => None,
        })
    }

    fn first_block(
        &self,
        point: HookPoint,
        subject: &str,
        call: impl Fn(&HookCallback) -> Option<Result<HookResult, HookError>>,
    ) -> HookResult {
        for entry in self.snapshot(point).iter() {
            let registration = &entry.registration;
            let Some(result) = guarded(registration, point, || {
                call(&registration.callback).unwrap_or_else(|| Ok(HookResult::allow()))
            }) else {
                continue;
            };
            if result.blocked {
                tracing::info!(
                    hook = %registration.name,
                    point = %point,
                    "Hook blocked {}: {}",
                    subject,
                    result.message
                );
                return result;
            }
        }
        HookResult::allow()
    }

    // ── observing post-hooks ────────────────────────────────────────────

    pub fn run_post_tool_call(
        &self,
        tool_name: &str,
        arguments: &serde_json::Value,
        result: &str,
        success: bool,
    ) {
        for entry in self.snapshot(HookPoint::PostToolCall).iter() {
            let registration = &entry.registration;
            if let HookCallback::PostToolCall(f) = &registration.callback {
                guarded(registration, HookPoint::PostToolCall, || {
                    f(tool_name, arguments, result, success)
                });
            }
        }
    }

    pub fn run_post_heartbeat(&self, event_count: usize, success: bool, error: Option<&str>) {
        for entry in self.snapshot(HookPoint::PostHeartbeat).iter() {
            let registration = &entry.registration;
            if let HookCallback::PostHeartbeat(f) = &registration.callback {
                guarded(registration, HookPoint::PostHeartbeat, || {
                    f(event_count, success, error)
                });
            }
        }
    }

    // ── chaining transforms ─────────────────────────────────────────────

    /// Each hook sees the previous hook's output; `None` keeps the list.
    pub fn run_filter_tools(&self, tools: Vec<serde_json::Value>) -> Vec<serde_json::Value> {
        let mut tools = tools;
        for entry in self.snapshot(HookPoint::FilterTools).iter() {
            let registration = &entry.registration;
            if let HookCallback::FilterTools(f) = &registration.callback
                && let Some(Some(filtered)) =
                    guarded(registration, HookPoint::FilterTools, || f(&tools))
            {
                tools = filtered;
            }
        }
        tools
    }

    pub fn run_post_agent_run(
        &self,
        message: &str,
        response: String,
        conversation_id: Option<&str>,
    ) -> String {
        let mut response = response;
        for entry in self.snapshot(HookPoint::PostAgentRun).iter() {
            let registration = &entry.registration;
            if let HookCallback::PostAgentRun(f) = &registration.callback
                && let Some(Some(replaced)) = guarded(registration, HookPoint::PostAgentRun, || {
                    f(message, &response, conversation_id)
                })
            {
                response = replaced;
            }
        }
        response
    }

    pub fn run_post_memory_search(
        &self,
        query: &str,
        results: Vec<serde_json::Value>,
    ) -> Vec<serde_json::Value> {
        let mut results = results;
        for entry in self.snapshot(HookPoint::PostMemorySearch).iter() {
            let registration = &entry.registration;
            if let HookCallback::PostMemorySearch(f) = &registration.callback
                && let Some(Some(filtered)) =
                    guarded(registration, HookPoint::PostMemorySearch, || {
                        f(query, &results)
                    })
            {
                results = filtered;
            }
        }
        results
    }

    // ── collecting ──────────────────────────────────────────────────────

    /// Concatenate every hook's contribution in priority order.
    pub fn run_heartbeat_collect(&self) -> Vec<serde_json::Value> {
        let mut events = Vec::new();
        for entry in self.snapshot(HookPoint::HeartbeatCollect).iter() {
            let registration = &entry.registration;
            if let HookCallback::HeartbeatCollect(f) = &registration.callback
                && let Some(contributed) = guarded(registration, HookPoint::HeartbeatCollect, || f())
            {
                events.extend(contributed);
            }
        }
        events
    }
}

fn remove_named(inner: &mut Inner, name: &str) -> bool {
    let mut removed = false;
    for slot in inner.points.iter_mut() {
        if slot.iter().any(|e| e.registration.name == name) {
            let kept: Vec<Arc<Entry>> = slot
                .iter()
                .filter(|e| e.registration.name != name)
                .cloned()
                .collect();
            *slot = Arc::new(kept);
            removed = true;
        }
    }
    removed
}

/// Run one callback, containing errors and panics.
fn guarded<T>(
    registration: &HookRegistration,
    point: HookPoint,
    f: impl FnOnce() -> Result<T, HookError>,
) -> Option<T> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::warn!(
                hook = %registration.name,
                point = %point,
                error = %e,
                "Hook raised an error (skipping)"
            );
            None
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::warn!(
                hook = %registration.name,
                point = %point,
                reason = %reason,
                "Hook panicked (skipping)"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn recording_pre(name: &str, log: &Arc<Mutex<Vec<String>>>) -> HookCallback {
        let log = Arc::clone(log);
        let name = name.to_string();
        HookCallback::pre_tool_call(move |_, _| {
            log.lock().unwrap().push(name.clone());
            Ok(HookResult::allow())
        })
    }

    // ── ordering ──

    #[test]
    fn test_dispatch_follows_priority() {
        let bus = HookBus::new();
        let log = recorder();
        bus.register(HookRegistration::new("p30", recording_pre("p30", &log)).with_priority(30));
        bus.register(HookRegistration::new("p10", recording_pre("p10", &log)).with_priority(10));
        bus.register(HookRegistration::new("p20", recording_pre("p20", &log)).with_priority(20));

        bus.run_pre_tool_call("exec", &json!({}));

        assert_eq!(*log.lock().unwrap(), vec!["p10", "p20", "p30"]);
        let names: Vec<String> = bus.list().into_iter().map(|h| h.name).collect();
        assert_eq!(names, vec!["p10", "p20", "p30"]);
    }

    #[test]
    fn test_equal_priority_keeps_registration_order() {
        let bus = HookBus::new();
        let log = recorder();
        for name in ["a", "b", "c"] {
            bus.register(HookRegistration::new(name, recording_pre(name, &log)));
        }
        bus.run_pre_tool_call("exec", &json!({}));
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_register_same_name_replaces() {
        let bus = HookBus::new();
        let log = recorder();
        bus.register(HookRegistration::new("dup", recording_pre("first", &log)));
        bus.register(HookRegistration::new("dup", recording_pre("second", &log)));

        bus.run_pre_tool_call("exec", &json!({}));

        assert_eq!(*log.lock().unwrap(), vec!["second"]);
        assert_eq!(bus.list().len(), 1);
    }

    // ── blocking ──

    #[test]
    fn test_first_block_short_circuits() {
        let bus = HookBus::new();
        let log = recorder();
        bus.register(
            HookRegistration::new(
                "blocker",
                HookCallback::pre_tool_call(|name, _| Ok(HookResult::block(format!("no {name}")))),
            )
            .with_priority(10),
        );
        bus.register(HookRegistration::new("after", recording_pre("after", &log)).with_priority(20));

        let result = bus.run_pre_tool_call("exec", &json!({}));

        assert!(result.blocked);
        assert_eq!(result.message, "no exec");
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_errors_and_panics_are_skipped() {
        let bus = HookBus::new();
        let log = recorder();
        bus.register(
            HookRegistration::new(
                "fails",
                HookCallback::pre_tool_call(|_, _| Err(HookError::Failed("boom".into()))),
            )
            .with_priority(1),
        );
        bus.register(
            HookRegistration::new(
                "panics",
                HookCallback::pre_tool_call(|_, _| panic!("hook exploded")),
            )
            .with_priority(2),
        );
        bus.register(HookRegistration::new("ok", recording_pre("ok", &log)).with_priority(3));

        let result = bus.run_pre_tool_call("exec", &json!({}));

        assert!(!result.blocked);
        assert_eq!(*log.lock().unwrap(), vec!["ok"]);
    }

    #[test]
    fn test_other_pre_points() {
        let bus = HookBus::new();
        bus.register(HookRegistration::new(
            "agent",
            HookCallback::pre_agent_run(|msg, _| {
                Ok(if msg.contains("secret") {
                    HookResult::block("no secrets")
                } else {
                    HookResult::allow()
                })
            }),
        ));
        bus.register(HookRegistration::new(
            "memory",
            HookCallback::pre_memory_store(|_, source| {
                Ok(if source == "untrusted" {
                    HookResult::block("untrusted source")
                } else {
                    HookResult::allow()
                })
            }),
        ));
        bus.register(HookRegistration::new(
            "beat",
            HookCallback::pre_heartbeat(|n| {
                Ok(if n > 10 {
                    HookResult::block("too many")
                } else {
                    HookResult::allow()
                })
            }),
        ));

        assert!(bus.run_pre_agent_run("tell me the secret", None).blocked);
        assert!(!bus.run_pre_agent_run("hello", Some("c1")).blocked);
        assert!(bus.run_pre_memory_store("x", "untrusted").blocked);
        assert!(!bus.run_pre_memory_store("x", "user").blocked);
        assert!(bus.run_pre_heartbeat(11).blocked);
        assert!(!bus.run_pre_heartbeat(3).blocked);
    }

    // ── observing ──

    #[test]
    fn test_post_hooks_all_run_despite_errors() {
        let bus = HookBus::new();
        let log = recorder();
        bus.register(
            HookRegistration::new(
                "bad",
                HookCallback::post_tool_call(|_, _, _, _| Err(HookError::Failed("x".into()))),
            )
            .with_priority(1),
        );
        let seen = Arc::clone(&log);
        bus.register(
            HookRegistration::new(
                "good",
                HookCallback::post_tool_call(move |name, _, result, success| {
                    seen.lock().unwrap().push(format!("{name}:{result}:{success}"));
                    Ok(())
                }),
            )
            .with_priority(2),
        );
        let seen = Arc::clone(&log);
        bus.register(HookRegistration::new(
            "beat",
            HookCallback::post_heartbeat(move |n, ok, err| {
                seen.lock().unwrap().push(format!("{n}:{ok}:{}", err.unwrap_or("-")));
                Ok(())
            }),
        ));

        bus.run_post_tool_call("exec", &json!({}), "done", true);
        bus.run_post_heartbeat(2, false, Some("down"));

        assert_eq!(*log.lock().unwrap(), vec!["exec:done:true", "2:false:down"]);
    }

    // ── chaining ──

    #[test]
    fn test_filter_tools_chains_and_none_keeps_previous() {
        let bus = HookBus::new();
        bus.register(
            HookRegistration::new(
                "drop_exec",
                HookCallback::filter_tools(|tools| {
                    Ok(Some(
                        tools
                            .iter()
                            .filter(|t| t["function"]["name"] != "exec")
                            .cloned()
                            .collect(),
                    ))
                }),
            )
            .with_priority(1),
        );
        bus.register(
            HookRegistration::new("observer", HookCallback::filter_tools(|_| Ok(None)))
                .with_priority(2),
        );

        let tools = vec![
            json!({"function": {"name": "exec"}}),
            json!({"function": {"name": "read_file"}}),
        ];
        let filtered = bus.run_filter_tools(tools);
        assert_eq!(filtered, vec![json!({"function": {"name": "read_file"}})]);
    }

    #[test]
    fn test_post_agent_run_chains_replacements() {
        let bus = HookBus::new();
        bus.register(
            HookRegistration::new(
                "upper",
                HookCallback::post_agent_run(|_, resp, _| Ok(Some(resp.to_uppercase()))),
            )
            .with_priority(1),
        );
        bus.register(
            HookRegistration::new(
                "suffix",
                HookCallback::post_agent_run(|_, resp, _| Ok(Some(format!("{resp}!")))),
            )
            .with_priority(2),
        );
        bus.register(
            HookRegistration::new(
                "broken",
                HookCallback::post_agent_run(|_, _, _| Err(HookError::Failed("x".into()))),
            )
            .with_priority(3),
        );

        assert_eq!(bus.run_post_agent_run("hi", "hello".into(), None), "HELLO!");
    }

    #[test]
    fn test_post_memory_search_chains() {
        let bus = HookBus::new();
        bus.register(HookRegistration::new(
            "first_only",
            HookCallback::post_memory_search(|_, results| Ok(Some(results[..1].to_vec()))),
        ));
        let out = bus.run_post_memory_search("q", vec![json!({"content": "a"}), json!({"content": "b"})]);
        assert_eq!(out, vec![json!({"content": "a"})]);
    }

    // ── collecting ──

    #[test]
    fn test_heartbeat_collect_flattens_in_priority_order() {
        let bus = HookBus::new();
        bus.register(
            HookRegistration::new(
                "late",
                HookCallback::heartbeat_collect(|| Ok(vec![json!("c")])),
            )
            .with_priority(90),
        );
        bus.register(
            HookRegistration::new(
                "early",
                HookCallback::heartbeat_collect(|| Ok(vec![json!("a"), json!("b")])),
            )
            .with_priority(10),
        );
        bus.register(HookRegistration::new(
            "broken",
            HookCallback::heartbeat_collect(|| Err(HookError::Failed("x".into()))),
        ));

        assert_eq!(bus.run_heartbeat_collect(), vec![json!("a"), json!("b"), json!("c")]);
    }

    // ── removal ──

    #[test]
    fn test_unregister_by_source_leaves_plugins() {
        let bus = HookBus::new();
        let noop = || HookCallback::pre_heartbeat(|_| Ok(HookResult::allow()));
        bus.register(HookRegistration::new("c1", noop()));
        bus.register(HookRegistration::new("c2", HookCallback::filter_tools(|_| Ok(None))));
        bus.register(HookRegistration::new("p1", noop()).with_source("plugin:demo"));

        assert_eq!(bus.unregister_by_source("config"), 2);

        let remaining = bus.list();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].source, "plugin:demo");
        assert_eq!(bus.unregister_by_source("config"), 0);
    }

    #[test]
    fn test_unregister_and_clear() {
        let bus = HookBus::new();
        bus.register(HookRegistration::new("x", HookCallback::filter_tools(|_| Ok(None))));
        bus.register(HookRegistration::new("y", HookCallback::heartbeat_collect(|| Ok(vec![]))));

        assert!(bus.unregister("x"));
        assert!(!bus.unregister("x"));
        assert_eq!(bus.count(HookPoint::FilterTools), 0);
        assert_eq!(bus.count(HookPoint::HeartbeatCollect), 1);

        bus.clear();
        assert!(bus.list().is_empty());
    }

    #[test]
    fn test_callback_may_mutate_bus_during_dispatch() {
        let bus = Arc::new(HookBus::new());
        let handle = Arc::clone(&bus);
        bus.register(HookRegistration::new(
            "self_removing",
            HookCallback::pre_heartbeat(move |_| {
                handle.unregister("self_removing");
                Ok(HookResult::allow())
            }),
        ));

        assert!(!bus.run_pre_heartbeat(1).blocked);
        assert_eq!(bus.count(HookPoint::PreHeartbeat), 0);
    }
}
