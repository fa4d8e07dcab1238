use std::sync::RwLock;

/// A known peer, identified by its advertised `host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    addr: String,
}

impl Node {
    fn new(addr: String) -> Node {
        Node { addr }
    }

    pub fn get_addr(&self) -> String {
        self.addr.clone()
    }
}

/// Peer registry. Grows on version/addr messages, shrinks when a send fails.
pub struct Nodes {
    inner: RwLock<Vec<Node>>,
}

impl Default for Nodes {
    fn default() -> Self {
        Self::new()
    }
}

impl Nodes {
    pub fn new() -> Nodes {
        Nodes {
            inner: RwLock::new(vec![]),
        }
    }

    /// Adds `addr` unless it is already known; returns whether it was new
    pub fn add_node(&self, addr: String) -> bool {
        match self.inner.write() {
            Ok(mut inner) => {
                if inner.iter().any(|x| x.addr == addr) {
                    return false;
                }
                inner.push(Node::new(addr));
                true
            }
            Err(_) => {
                log::error!("Failed to acquire write lock on nodes");
                false
            }
        }
    }

    pub fn evict_node(&self, addr: &str) {
        match self.inner.write() {
            Ok(mut inner) => inner.retain(|x| x.addr != addr),
            Err(_) => log::error!("Failed to acquire write lock on nodes"),
        }
    }

    pub fn get_nodes(&self) -> Vec<Node> {
        match self.inner.read() {
            Ok(inner) => inner.to_vec(),
            Err(_) => {
                log::error!("Failed to acquire read lock on nodes");
                vec![]
            }
        }
    }

    pub fn len(&self) -> usize {
        self.get_nodes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node_is_known(&self, addr: &str) -> bool {
        match self.inner.read() {
            Ok(inner) => inner.iter().any(|x| x.addr == addr),
            Err(_) => {
                log::error!("Failed to acquire read lock on nodes");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_add_and_evict() {
        let nodes = Nodes::new();
        assert!(nodes.is_empty());

        assert!(nodes.add_node("127.0.0.1:3000".to_string()));
        assert!(!nodes.add_node("127.0.0.1:3000".to_string()));
        assert!(nodes.add_node("127.0.0.1:3001".to_string()));
        assert_eq!(nodes.len(), 2);
        assert!(nodes.node_is_known("127.0.0.1:3001"));

        nodes.evict_node("127.0.0.1:3000");
        assert!(!nodes.node_is_known("127.0.0.1:3000"));
        assert_eq!(nodes.get_nodes()[0].get_addr(), "127.0.0.1:3001");
    }
}
