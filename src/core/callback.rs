//! Callbacks and event handlers, both gated by an enable-pointer pattern:
//! a shared atomic flag the owning stage flips, never structural list
//! manipulation, to enable/disable dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bgp::wire::MessageType;
use crate::core::message::{Message, MsgDirection, Side};

pub type CallbackFn = Arc<dyn Fn(&mut Message) -> bool + Send + Sync>;

/// A registered message callback.
#[derive(Clone)]
pub struct Callback {
    pub id: u64,
    pub func: CallbackFn,
    pub direction: MsgDirection,
    pub types: Vec<MessageType>,
    pub order: i64,
    pub stage_index: usize,
    pub enabled: Arc<AtomicBool>,
}

impl Callback {
    pub fn matches(&self, side: Side, typ: MessageType) -> bool {
        if !self.enabled.load(Ordering::Acquire) {
            return false;
        }
        let dir_ok = match self.direction {
            MsgDirection::Both | MsgDirection::None => true,
            MsgDirection::Side(s) => s == side,
        };
        if !dir_ok {
            return false;
        }
        self.types.is_empty() || self.types.contains(&typ)
    }
}

/// A handle returned by registration, allowing the caller to deregister.
///
/// Holds one enabled-flag per Direction the callback was registered on
/// (`MsgDirection::Both` registers on both L and R, sharing one handle).
pub struct CallbackHandle {
    pub(crate) enabled: Vec<Arc<AtomicBool>>,
}

impl CallbackHandle {
    pub fn drop_handle(&self) {
        self.set_enabled(false);
    }

    pub fn set_enabled(&self, v: bool) {
        for e in &self.enabled {
            e.store(v, Ordering::Release);
        }
    }
}
