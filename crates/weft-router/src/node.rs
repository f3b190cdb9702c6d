//! Per-process registry of node links.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use weft_core::types::NodeName;

use crate::node_link::NodeLink;

/// Callback invoked with the established link, or `None` on failure.
pub type EstablishLinkCallback = Box<dyn FnOnce(Option<Arc<NodeLink>>) + Send>;

/// Hook that introduces this node to one it has no link with. Introduction
/// itself lives outside the routing core; embedders (and the test harness)
/// install whatever brokerage they have.
pub type Introducer = Arc<dyn Fn(&Arc<Node>, NodeName, EstablishLinkCallback) + Send + Sync>;

/// One process's participation in the fabric: a name and the set of links
/// to other nodes.
pub struct Node {
    name: NodeName,
    links: Mutex<HashMap<NodeName, Arc<NodeLink>>>,
    introducer: Mutex<Option<Introducer>>,
}

impl Node {
    pub fn new() -> Arc<Self> {
        Self::with_name(NodeName::random())
    }

    pub fn with_name(name: NodeName) -> Arc<Self> {
        tracing::debug!(%name, "created node");
        Arc::new(Self {
            name,
            links: Mutex::new(HashMap::new()),
            introducer: Mutex::new(None),
        })
    }

    pub fn name(&self) -> NodeName {
        self.name
    }

    /// Register a link to a remote node. Fails if a link to that node
    /// already exists.
    pub fn add_link(&self, link: Arc<NodeLink>) -> bool {
        let mut links = lock(&self.links);
        let remote = link.remote_node_name();
        if links.contains_key(&remote) {
            return false;
        }
        tracing::debug!(local = %self.name, %remote, "node link registered");
        links.insert(remote, link);
        true
    }

    pub fn remove_link(&self, remote: NodeName) {
        lock(&self.links).remove(&remote);
    }

    pub fn get_link(&self, remote: NodeName) -> Option<Arc<NodeLink>> {
        lock(&self.links).get(&remote).cloned()
    }

    /// Install the introduction hook used when a bypass targets a node this
    /// node holds no link to.
    pub fn set_introducer(&self, introducer: Introducer) {
        *lock(&self.introducer) = Some(introducer);
    }

    /// Hand `callback` a link to `remote`, introducing the two nodes first
    /// if necessary. The callback may run synchronously.
    pub fn establish_link(self: &Arc<Self>, remote: NodeName, callback: EstablishLinkCallback) {
        if let Some(link) = self.get_link(remote) {
            callback(Some(link));
            return;
        }
        let introducer = lock(&self.introducer).clone();
        match introducer {
            Some(introducer) => introducer(self, remote, callback),
            None => {
                tracing::debug!(local = %self.name, %remote, "no route to node and no introducer");
                callback(None);
            }
        }
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
