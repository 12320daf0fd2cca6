use std::collections::BTreeSet;

/// A node in the server's channel tree. All relationships are channel IDs
/// resolved through the owning [`ModelTree`](crate::model::ModelTree) table;
/// a `Channel` never owns another channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Channel {
    pub id: u32,
    pub parent: Option<u32>,
    pub children: Vec<u32>,
    pub links: BTreeSet<u32>,
    pub name: String,
    pub description: String,
    pub position: i32,
    pub temporary: bool,
    /// Permission bits reported for this channel, if queried.
    pub permissions: Option<u32>,
}

pub const ROOT_CHANNEL_ID: u32 = 0;

impl Channel {
    pub fn new(id: u32, parent: Option<u32>) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            links: BTreeSet::new(),
            name: String::new(),
            description: String::new(),
            position: 0,
            temporary: false,
            permissions: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_CHANNEL_ID
    }
}
