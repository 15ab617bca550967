use std::collections::HashMap;

use crate::name::format_full_name;

/// A running process instance in the fleet, as seen through discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: i32,
    pub type_name: String,
    pub full_name: String,
    pub address: String,
    pub metadata: HashMap<String, String>,
}

impl Peer {
    #[must_use]
    pub fn new(type_name: &str, id: i32, address: &str) -> Self {
        Self {
            id,
            type_name: type_name.to_string(),
            full_name: format_full_name(type_name, id),
            address: address.to_string(),
            metadata: HashMap::new(),
        }
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.full_name, self.address)
    }
}

/// A string name held by exactly one peer at a time.
///
/// The owning peer is referenced by its full name; lookups resolve it through
/// the peer registry rather than holding a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceName {
    pub full_name: String,
    pub type_name: Option<String>,
    pub peer_full_name: String,
    pub is_self: bool,
    pub create_revision: i64,
}

/// A user owned by the local peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPlayer {
    pub user_id: String,
    pub login_time: i64,
    pub create_revision: i64,
}
