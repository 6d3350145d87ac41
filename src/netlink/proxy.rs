//! nl80211 protocol proxy
//!
//! Orchestrates the session: resolves the nl80211 family id and multicast
//! group table from the generic netlink controller, starts the broadcast
//! monitor bound to the resolved groups, and exposes the synchronous and
//! asynchronous request APIs plus broadcast callback registration. All
//! session state lives behind one lock; initialization is idempotent and a
//! failed attempt leaves the proxy cleanly retryable.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use threadpool::ThreadPool;
use tracing::{error, info, warn};

use crate::netlink::attr::NlAttr;
use crate::netlink::message::GenericNetlinkMsg;
use crate::netlink::monitor::{BroadcastCallback, BroadcastMonitor};
use crate::netlink::socket::{NetlinkIoFactory, SystemNetlinkFactory};
use crate::netlink::structures::{
    CTRL_ATTR_FAMILY_ID, CTRL_ATTR_FAMILY_NAME, CTRL_ATTR_MCAST_GROUPS,
    CTRL_ATTR_MCAST_GRP_ID, CTRL_ATTR_MCAST_GRP_NAME, CTRL_CMD_GETFAMILY, GENL_CTRL_VERSION,
    GENL_ID_CTRL, NLM_F_REQUEST, NL80211_GENL_NAME, NL80211_MULTICAST_GROUP_MLME,
    NL80211_MULTICAST_GROUP_REG, NL80211_MULTICAST_GROUP_SCAN, NL80211_VERSION,
};
use crate::netlink::transport::{NetlinkTransport, ResponseListener};
use crate::runner::EventRunner;

/// Multicast groups the broadcast monitor subscribes to.
const REQUIRED_MULTICAST_GROUPS: [&str; 3] = [
    NL80211_MULTICAST_GROUP_SCAN,
    NL80211_MULTICAST_GROUP_REG,
    NL80211_MULTICAST_GROUP_MLME,
];

#[derive(Default)]
struct ProxyInner {
    initialized: bool,
    family_id: u16,
    multicast_groups: HashMap<String, u32>,
    transport: Option<Arc<NetlinkTransport>>,
    monitor: Option<Arc<BroadcastMonitor>>,
}

/// Session proxy for the nl80211 generic netlink family.
pub struct Nl80211Proxy {
    control_runner: Arc<EventRunner>,
    factory: Arc<dyn NetlinkIoFactory>,
    inner: Mutex<ProxyInner>,
}

impl Nl80211Proxy {
    pub fn new(control_runner: Arc<EventRunner>) -> Self {
        Self::with_factory(Arc::new(SystemNetlinkFactory), control_runner)
    }

    /// Build a proxy over a custom socket factory (the seam the unit tests
    /// script against).
    pub fn with_factory(
        factory: Arc<dyn NetlinkIoFactory>,
        control_runner: Arc<EventRunner>,
    ) -> Self {
        Self {
            control_runner,
            factory,
            inner: Mutex::new(ProxyInner::default()),
        }
    }

    /// Resolve the family, build the transport, and start the broadcast
    /// monitor on `background_pool`. Returns true once the proxy is usable.
    /// Calling again after success is a no-op; calling again after failure
    /// retries from scratch.
    pub fn initialize(&self, background_pool: &ThreadPool) -> bool {
        let mut inner = self.inner.lock();
        if inner.initialized {
            return true;
        }

        let Some(io) = self.factory.create() else {
            error!("initialization failed: no netlink socket");
            return false;
        };
        let transport = Arc::new(NetlinkTransport::new(io));

        let mut request =
            GenericNetlinkMsg::new(CTRL_CMD_GETFAMILY, GENL_CTRL_VERSION, GENL_ID_CTRL, NLM_F_REQUEST);
        request.add_attribute(NlAttr::new_string(CTRL_ATTR_FAMILY_NAME, NL80211_GENL_NAME));
        let responses = match transport.send_and_receive(&mut request) {
            Ok(responses) => responses,
            Err(e) => {
                error!("family resolution failed: {e}");
                return false;
            }
        };
        let Some(response) = responses.first() else {
            error!("family resolution returned no messages");
            return false;
        };

        let Some(family_id) = response
            .get_attribute(CTRL_ATTR_FAMILY_ID)
            .and_then(NlAttr::as_u16)
        else {
            error!("family response carries no family id");
            return false;
        };
        let Some(groups_attr) = response.get_attribute(CTRL_ATTR_MCAST_GROUPS) else {
            error!("family response carries no multicast groups");
            return false;
        };
        let multicast_groups = Self::parse_multicast_groups_attribute(groups_attr);

        let mut group_ids = Vec::with_capacity(REQUIRED_MULTICAST_GROUPS.len());
        for name in REQUIRED_MULTICAST_GROUPS {
            match multicast_groups.get(name) {
                Some(&id) => group_ids.push(id),
                None => {
                    error!(group = name, "required multicast group not advertised");
                    return false;
                }
            }
        }

        let monitor = BroadcastMonitor::new(
            Arc::clone(&self.control_runner),
            Arc::clone(&self.factory),
            group_ids,
        );
        if !monitor.create_fd() {
            error!("initialization failed: broadcast monitor has no socket");
            return false;
        }
        if !Arc::clone(&monitor).start(background_pool) {
            error!("initialization failed: broadcast monitor did not start");
            return false;
        }

        info!(family_id, "nl80211 proxy initialized");
        inner.family_id = family_id;
        inner.multicast_groups = multicast_groups;
        inner.transport = Some(transport);
        inner.monitor = Some(monitor);
        inner.initialized = true;
        true
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().initialized
    }

    /// Numeric id of a multicast group advertised by the kernel, if the
    /// proxy is initialized and the group exists.
    pub fn multicast_group_id(&self, name: &str) -> Option<u32> {
        self.inner.lock().multicast_groups.get(name).copied()
    }

    /// Decode the controller's nested multicast group table into a
    /// name-to-id map. Entries missing a name or id are skipped.
    pub fn parse_multicast_groups_attribute(attr: &NlAttr) -> HashMap<String, u32> {
        let mut groups = HashMap::new();
        let Ok(entries) = attr.as_nested() else {
            warn!("multicast groups attribute is not a container");
            return groups;
        };
        for entry in entries {
            let Ok(fields) = entry.as_nested() else {
                continue;
            };
            let mut name = None;
            let mut id = None;
            for field in fields {
                match field.nla_type() {
                    CTRL_ATTR_MCAST_GRP_NAME => name = field.as_string(),
                    CTRL_ATTR_MCAST_GRP_ID => id = field.as_u32(),
                    _ => {}
                }
            }
            if let (Some(name), Some(id)) = (name, id) {
                groups.insert(name, id);
            }
        }
        groups
    }

    /// New request addressed to the resolved nl80211 family. `None` before
    /// initialization, since the family id is required to type the message.
    pub fn create_request(&self, command: u8, flags: u16) -> Option<GenericNetlinkMsg> {
        let inner = self.inner.lock();
        if !inner.initialized {
            warn!("request creation before initialization");
            return None;
        }
        Some(GenericNetlinkMsg::new(
            command,
            NL80211_VERSION,
            inner.family_id,
            NLM_F_REQUEST | flags,
        ))
    }

    /// Synchronous exchange. `None` covers both transport failure and an
    /// uninitialized proxy; details are logged.
    pub fn send_message_and_receive_responses(
        &self,
        msg: &mut GenericNetlinkMsg,
    ) -> Option<Vec<GenericNetlinkMsg>> {
        let transport = self.inner.lock().transport.clone()?;
        match transport.send_and_receive(msg) {
            Ok(responses) => Some(responses),
            Err(e) => {
                warn!("request failed: {e}");
                None
            }
        }
    }

    /// Asynchronous exchange: the listener is invoked on `runner` once the
    /// response (or a failure) arrives. Receive passes run on the control
    /// runner until no request is outstanding.
    pub fn send_message_and_receive_responses_async(
        &self,
        msg: &mut GenericNetlinkMsg,
        runner: Arc<EventRunner>,
        listener: Arc<dyn ResponseListener>,
    ) -> bool {
        let Some(transport) = self.inner.lock().transport.clone() else {
            warn!("async request before initialization");
            return false;
        };
        if !transport.send_async(msg, runner, listener) {
            return false;
        }
        schedule_drain(Arc::clone(&self.control_runner), transport);
        true
    }

    /// Register a callback for a broadcast command. False before
    /// initialization.
    pub fn register_broadcast_callback(
        &self,
        command: u8,
        callback: Arc<dyn BroadcastCallback>,
    ) -> bool {
        let inner = self.inner.lock();
        let Some(monitor) = inner.monitor.as_ref() else {
            return false;
        };
        monitor.register_callback(command, callback);
        true
    }

    /// Unregister a previously registered broadcast callback. False before
    /// initialization.
    pub fn unregister_broadcast_callback(
        &self,
        command: u8,
        callback: &Arc<dyn BroadcastCallback>,
    ) -> bool {
        let inner = self.inner.lock();
        let Some(monitor) = inner.monitor.as_ref() else {
            return false;
        };
        monitor.unregister_callback(command, callback);
        true
    }

    /// Stop the broadcast monitor and drop the session. Initialization may
    /// run again afterwards.
    pub fn teardown(&self) {
        let mut inner = self.inner.lock();
        if let Some(monitor) = inner.monitor.take() {
            monitor.stop();
        }
        *inner = ProxyInner::default();
    }
}

/// Keep running receive passes on the control runner while any async
/// request is outstanding.
fn schedule_drain(control: Arc<EventRunner>, transport: Arc<NetlinkTransport>) {
    let control_for_next = Arc::clone(&control);
    control.post(move || {
        transport.drain_responses();
        if transport.has_pending() {
            schedule_drain(control_for_next, transport);
        }
    });
}
