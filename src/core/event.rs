//! Named events with pre/post handler phases and a synchronous,
//! ordered dispatch: pre-handlers before post-handlers, lowest `order`
//! first within each phase.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::message::Message;

pub type HandlerFn = Arc<dyn Fn(&str, Option<&Message>, &[String]) -> bool + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerPhase {
    Pre,
    Post,
}

#[derive(Clone)]
pub struct Handler {
    pub id: u64,
    pub names: Vec<String>,
    pub phase: HandlerPhase,
    pub order: i64,
    pub one_shot: bool,
    pub enabled: Arc<AtomicBool>,
    pub func: HandlerFn,
}

impl Handler {
    fn name_matches(&self, name: &str) -> bool {
        self.names
            .iter()
            .any(|n| n == "*" || n == "all" || n.eq_ignore_ascii_case(name))
    }
}

pub struct HandlerHandle {
    pub(crate) enabled: Arc<AtomicBool>,
}

impl HandlerHandle {
    pub fn set_enabled(&self, v: bool) {
        self.enabled.store(v, Ordering::Release);
    }
}

/// Normalises a short or namespaced event name: `SHORT` -> `bgpfix/pipe.SHORT`
/// (case-normalised upper), `pkg.NAME` -> `bgpfix/pkg.NAME`, `stage/NAME`
/// stays stage-local (lower-cased prefix). The wildcards `"*"` and `"all"`
/// (case-insensitive) are left untouched, since `Handler::name_matches`
/// needs to see them literally to match every event name.
pub fn canonical_event_name(name: &str) -> String {
    if name == "*" || name.eq_ignore_ascii_case("all") {
        return name.to_string();
    }
    if let Some((stage, rest)) = name.split_once('/') {
        if stage != "bgpfix" {
            return format!("{}/{}", stage.to_ascii_lowercase(), rest.to_ascii_uppercase());
        }
        return name.to_string();
    }
    if name.contains('.') {
        return format!("bgpfix/{name}");
    }
    format!("bgpfix/pipe.{}", name.to_ascii_uppercase())
}

/// Dispatches named events to pre- then post-phase handlers, lowest order
/// first within each phase.
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<Vec<Handler>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn on(
        &self,
        names: Vec<String>,
        phase: HandlerPhase,
        order: i64,
        one_shot: bool,
        func: HandlerFn,
    ) -> HandlerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let enabled = Arc::new(AtomicBool::new(true));
        let handler = Handler {
            id,
            names: names.into_iter().map(|n| canonical_event_name(&n)).collect(),
            phase,
            order,
            one_shot,
            enabled: enabled.clone(),
            func,
        };
        self.handlers.lock().unwrap().push(handler);
        HandlerHandle { enabled }
    }

    /// Dispatches `name`, returning whether any handler consumed it
    /// (returned `false` from its callback).
    pub fn emit(&self, name: &str, msg: Option<&Message>, args: &[String]) -> bool {
        let canonical = canonical_event_name(name);
        let mut snapshot: Vec<Handler> = {
            let guard = self.handlers.lock().unwrap();
            guard
                .iter()
                .filter(|h| h.enabled.load(Ordering::Acquire) && h.name_matches(&canonical))
                .cloned()
                .collect()
        };
        snapshot.sort_by(|a, b| a.order.cmp(&b.order).then(a.id.cmp(&b.id)));

        let mut consumed = false;
        let mut fired_ids = Vec::new();
        for phase in [HandlerPhase::Pre, HandlerPhase::Post] {
            for h in snapshot.iter().filter(|h| h.phase == phase) {
                let keep_going = (h.func)(&canonical, msg, args);
                fired_ids.push(h.id);
                if !keep_going {
                    consumed = true;
                }
            }
        }

        if !fired_ids.is_empty() {
            let mut guard = self.handlers.lock().unwrap();
            guard.retain(|h| {
                if fired_ids.contains(&h.id) && h.one_shot {
                    false
                } else {
                    true
                }
            });
        }
        consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn canonical_names() {
        assert_eq!(canonical_event_name("START"), "bgpfix/pipe.START");
        assert_eq!(canonical_event_name("start"), "bgpfix/pipe.START");
        assert_eq!(canonical_event_name("pkg.parse"), "bgpfix/pkg.parse");
        assert_eq!(canonical_event_name("stage/established"), "stage/ESTABLISHED");
    }

    #[test]
    fn pre_before_post_lowest_order_first() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        bus.on(vec!["X".into()], HandlerPhase::Post, 5, false, Arc::new(move |_, _, _| {
            o1.lock().unwrap().push("post-5");
            true
        }));
        let o2 = order.clone();
        bus.on(vec!["X".into()], HandlerPhase::Pre, 10, false, Arc::new(move |_, _, _| {
            o2.lock().unwrap().push("pre-10");
            true
        }));
        let o3 = order.clone();
        bus.on(vec!["X".into()], HandlerPhase::Pre, 1, false, Arc::new(move |_, _, _| {
            o3.lock().unwrap().push("pre-1");
            true
        }));

        bus.emit("X", None, &[]);
        assert_eq!(*order.lock().unwrap(), vec!["pre-1", "pre-10", "post-5"]);
    }

    #[test]
    fn one_shot_handler_fires_once() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.on(vec!["X".into()], HandlerPhase::Pre, 0, true, Arc::new(move |_, _, _| {
            c.fetch_add(1, Ordering::SeqCst);
            true
        }));
        bus.emit("X", None, &[]);
        bus.emit("X", None, &[]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_returning_false_marks_consumed() {
        let bus = EventBus::new();
        bus.on(vec!["Y".into()], HandlerPhase::Pre, 0, false, Arc::new(|_, _, _| false));
        assert!(bus.emit("Y", None, &[]));
        assert!(!bus.emit("Z", None, &[]));
    }

    #[test]
    fn wildcard_name_survives_canonicalisation() {
        assert_eq!(canonical_event_name("*"), "*");
        assert_eq!(canonical_event_name("all"), "all");
        assert_eq!(canonical_event_name("ALL"), "ALL");
    }

    #[test]
    fn all_handler_fires_for_arbitrary_event_name() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.on(
            vec!["all".into()],
            HandlerPhase::Pre,
            0,
            false,
            Arc::new(move |_, _, _| {
                c.fetch_add(1, Ordering::SeqCst);
                true
            }),
        );
        bus.emit("some/arbitrary.EVENT", None, &[]);
        bus.emit("start", None, &[]);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
