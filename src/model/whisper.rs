use mumble_protocol_2x::control::msgs;

/// Slot ids 1..=30 are assignable. 0 is ordinary talking and 31 is the
/// server loopback shout, so neither is ever handed out.
pub const MIN_TARGET_ID: u8 = 1;
pub const MAX_TARGET_ID: u8 = 30;

/// One shout destination, either a channel subtree or an explicit user set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WhisperTarget {
    Channel {
        channel_id: u32,
        include_links: bool,
        include_subchannels: bool,
        /// Restricts delivery to members of a named access group.
        group: Option<String>,
    },
    Users(Vec<u32>),
}

impl WhisperTarget {
    pub fn users(sessions: Vec<u32>) -> Self {
        WhisperTarget::Users(sessions)
    }

    pub fn channel(channel_id: u32) -> Self {
        WhisperTarget::Channel {
            channel_id,
            include_links: false,
            include_subchannels: false,
            group: None,
        }
    }

    /// The wire form of this target.
    pub fn wire_target(&self) -> msgs::voice_target::Target {
        let mut target = msgs::voice_target::Target::new();
        match self {
            WhisperTarget::Channel {
                channel_id,
                include_links,
                include_subchannels,
                group,
            } => {
                target.channel_id = Some(*channel_id);
                target.links = Some(*include_links);
                target.children = Some(*include_subchannels);
                target.group = group.clone();
            }
            WhisperTarget::Users(sessions) => {
                target.session = sessions.clone();
            }
        }
        target
    }
}

/// Client-side table of shout targets. Assignment never reuses a live id,
/// and a freed id becomes assignable again.
#[derive(Debug, Default)]
pub struct WhisperTargetRegistry {
    slots: [Option<WhisperTarget>; MAX_TARGET_ID as usize],
}

impl WhisperTargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `target` in the lowest free slot and returns its id, or
    /// `None` when all thirty slots are taken.
    pub fn append(&mut self, target: WhisperTarget) -> Option<u8> {
        let index = self.slots.iter().position(|slot| slot.is_none())?;
        self.slots[index] = Some(target);
        Some(index as u8 + MIN_TARGET_ID)
    }

    /// Panics when `id` is not a valid 5-bit target id.
    pub fn get(&self, id: u8) -> Option<&WhisperTarget> {
        assert!(id <= 31, "target id {id} out of range");
        if !(MIN_TARGET_ID..=MAX_TARGET_ID).contains(&id) {
            return None;
        }
        self.slots[(id - MIN_TARGET_ID) as usize].as_ref()
    }

    /// Releases `id` for reuse. Panics when `id` is not a valid 5-bit
    /// target id; freeing an empty or reserved slot is a no-op.
    pub fn free(&mut self, id: u8) {
        assert!(id <= 31, "target id {id} out of range");
        if (MIN_TARGET_ID..=MAX_TARGET_ID).contains(&id) {
            self.slots[(id - MIN_TARGET_ID) as usize] = None;
        }
    }

    pub fn clear(&mut self) {
        self.slots = Default::default();
    }

    pub fn space_remaining(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_none()).count()
    }
}
