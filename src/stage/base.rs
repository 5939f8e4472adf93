//! Per-stage control block: the capability/lifecycle state the controller
//! needs to drive direction assignment, wait-group accounting, and the Run
//! wrapper state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::StageConfig;
use crate::core::message::StartAt;

/// A cooperative cancellation token forming a parent/child tree: cancelling
/// a parent cancels every descendant, but a child's own cancellation never
/// propagates upward.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    flag: AtomicBool,
    cause: std::sync::Mutex<Option<Arc<anyhow::Error>>>,
    notify: tokio::sync::Notify,
    parent: Option<CancelToken>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                cause: std::sync::Mutex::new(None),
                notify: tokio::sync::Notify::new(),
                parent: None,
            }),
        }
    }

    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                cause: std::sync::Mutex::new(None),
                notify: tokio::sync::Notify::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self, cause: anyhow::Error) {
        if !self.inner.flag.swap(true, Ordering::AcqRel) {
            *self.inner.cause.lock().unwrap() = Some(Arc::new(cause));
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
            || self.inner.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    pub fn cause(&self) -> Option<Arc<anyhow::Error>> {
        self.inner
            .cause
            .lock()
            .unwrap()
            .clone()
            .or_else(|| self.inner.parent.as_ref().and_then(|p| p.cause()))
    }

    /// Resolves once this token or any ancestor is cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        match &self.inner.parent {
            Some(parent) => {
                tokio::select! {
                    _ = self.inner.notify.notified() => {}
                    _ = Box::pin(parent.cancelled()) => {}
                }
            }
            None => self.inner.notify.notified().await,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub is_producer: bool,
    pub is_consumer: bool,
    pub is_raw_reader: bool,
    pub is_raw_writer: bool,
    pub is_stdin: bool,
    pub is_stdout: bool,
    pub allow_lr: bool,
}

pub struct StageBase {
    pub index: usize,
    pub command: String,
    pub name: String,
    pub config: StageConfig,
    pub cancel: CancelToken,

    pub started: AtomicBool,
    pub prepared: AtomicBool,
    pub stopped: AtomicBool,
    pub enabled: Arc<AtomicBool>,
    /// Wakes the Run wrapper's `wait_enabled` loop once `enabled` flips.
    /// Separate from `CancelToken`'s own `Notify` since enabling and
    /// cancelling are independent transitions.
    pub enable_notify: Arc<tokio::sync::Notify>,

    pub is_left: bool,
    pub is_right: bool,
    pub is_first: bool,
    pub is_last: bool,
    pub caps: Capabilities,
    pub start_at: StartAt,
    pub wait_events: Vec<String>,
    pub stop_events: Vec<String>,
}

impl StageBase {
    pub fn new(index: usize, command: String, config: StageConfig, parent: &CancelToken) -> Self {
        let name = config
            .flags
            .get("name")
            .cloned()
            .unwrap_or_else(|| command.clone());
        Self {
            index,
            command,
            name,
            config,
            cancel: parent.child(),
            started: AtomicBool::new(false),
            prepared: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            enabled: Arc::new(AtomicBool::new(false)),
            enable_notify: Arc::new(tokio::sync::Notify::new()),
            is_left: false,
            is_right: false,
            is_first: false,
            is_last: false,
            caps: Capabilities::default(),
            start_at: StartAt::First,
            wait_events: Vec::new(),
            stop_events: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, v: bool) {
        self.enabled.store(v, Ordering::Release);
        if v {
            self.enable_notify.notify_waiters();
        }
    }

    /// Blocks until `enabled` becomes true, or this stage's own cancel
    /// token fires first — returns `false` in the latter case. A stage
    /// whose `wait=` trigger never arrives (e.g. an auto-inserted `stdin`
    /// waiting on `ESTABLISHED` in a pipeline with no `speaker`) must not
    /// block forever once the controller has given up on it; the
    /// check-construct-check-await shape avoids the lost-wakeup race
    /// between the initial check and registering as a `Notify` waiter.
    pub async fn wait_enabled(&self) -> bool {
        loop {
            if self.is_enabled() {
                return true;
            }
            let notified = self.enable_notify.notified();
            if self.is_enabled() {
                return true;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.cancel.cancelled() => return false,
            }
        }
    }

    /// Invariant: raw readers/writers must sit at either end of the pipeline.
    pub fn check_raw_endpoint_invariant(&self) -> anyhow::Result<()> {
        if (self.caps.is_raw_reader || self.caps.is_raw_writer) && !(self.is_first || self.is_last) {
            anyhow::bail!(
                "stage '{}' (index {}) is a raw reader/writer but is neither first nor last",
                self.name,
                self.index
            );
        }
        Ok(())
    }

    /// Invariant: a stage assigned both L and R requires AllowLR.
    pub fn check_lr_invariant(&self) -> anyhow::Result<()> {
        if self.is_left && self.is_right && !self.caps.allow_lr {
            anyhow::bail!(
                "stage '{}' (index {}) is assigned both L and R without --allow-lr",
                self.name,
                self.index
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_propagates_to_child() {
        let root = CancelToken::new();
        let child = root.child();
        assert!(!child.is_cancelled());
        root.cancel(anyhow::anyhow!("shutdown"));
        assert!(child.is_cancelled());
    }

    #[test]
    fn cancelling_child_does_not_cancel_root() {
        let root = CancelToken::new();
        let child = root.child();
        child.cancel(anyhow::anyhow!("stage stopped"));
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves_on_parent_cancel() {
        let root = CancelToken::new();
        let child = root.child();
        let waiter = tokio::spawn({
            let child = child.clone();
            async move { child.cancelled().await }
        });
        root.cancel(anyhow::anyhow!("bye"));
        tokio::time::timeout(std::time::Duration::from_millis(100), waiter)
            .await
            .expect("cancelled() should resolve")
            .unwrap();
    }
}
