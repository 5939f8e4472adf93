//! The pipeline's process-wide key/value store, used to publish connection
//! metadata under well-known keys (`L_LOCAL`, `L_REMOTE`, `R_LOCAL`,
//! `R_REMOTE`, and their `_ADDR`/`_PORT` variants): a name-keyed map behind
//! a single lock.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct KvStore {
    inner: Mutex<HashMap<String, String>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.lock().unwrap().insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    /// Publishes the four connection-metadata keys for one side at once,
    /// e.g. `set_conn("L", "LOCAL", "192.0.2.1:179")` populates `L_LOCAL`,
    /// `L_LOCAL_ADDR`, and `L_LOCAL_PORT`.
    pub fn set_conn(&self, side: &str, kind: &str, addr: &str) {
        let key = format!("{side}_{kind}");
        self.set(&key, addr);
        if let Some((ip, port)) = addr.rsplit_once(':') {
            self.set(format!("{key}_ADDR"), ip);
            self.set(format!("{key}_PORT"), port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_conn_publishes_addr_and_port() {
        let kv = KvStore::new();
        kv.set_conn("L", "REMOTE", "192.0.2.1:179");
        assert_eq!(kv.get("L_REMOTE").as_deref(), Some("192.0.2.1:179"));
        assert_eq!(kv.get("L_REMOTE_ADDR").as_deref(), Some("192.0.2.1"));
        assert_eq!(kv.get("L_REMOTE_PORT").as_deref(), Some("179"));
    }
}
