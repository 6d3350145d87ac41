//! High-level nl80211 operations
//!
//! Thin facade over [`Nl80211Proxy`] for callers that just want Wi-Fi
//! facts, not protocol plumbing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use threadpool::ThreadPool;
use tracing::info;

use crate::netlink::attr::NlAttr;
use crate::netlink::proxy::Nl80211Proxy;
use crate::netlink::structures::{NLM_F_DUMP, NL80211_ATTR_IFNAME, NL80211_CMD_GET_INTERFACE};
use crate::runner::EventRunner;

/// Entry point for nl80211-backed queries.
pub struct Nl80211Client {
    proxy: Arc<Nl80211Proxy>,
    initialized: AtomicBool,
}

impl Nl80211Client {
    pub fn new(control_runner: Arc<EventRunner>) -> Self {
        Self::with_proxy(Arc::new(Nl80211Proxy::new(control_runner)))
    }

    pub fn with_proxy(proxy: Arc<Nl80211Proxy>) -> Self {
        Self {
            proxy,
            initialized: AtomicBool::new(false),
        }
    }

    /// Initialize the underlying proxy. Safe to call repeatedly.
    pub fn initialize(&self, background_pool: &ThreadPool) -> bool {
        if self.initialized.load(Ordering::SeqCst) {
            return true;
        }
        let ok = self.proxy.initialize(background_pool);
        self.initialized.store(ok, Ordering::SeqCst);
        info!(initialized = ok, "nl80211 client initialization");
        ok
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Names of all wireless interfaces on this device, or `None` if the
    /// query could not be made.
    pub fn interface_names(&self) -> Option<Vec<String>> {
        if !self.is_initialized() {
            return None;
        }
        let mut request = self
            .proxy
            .create_request(NL80211_CMD_GET_INTERFACE, NLM_F_DUMP)?;
        let responses = self.proxy.send_message_and_receive_responses(&mut request)?;
        Some(
            responses
                .iter()
                .filter_map(|msg| {
                    msg.get_attribute(NL80211_ATTR_IFNAME)
                        .and_then(NlAttr::as_string)
                })
                .collect(),
        )
    }
}
