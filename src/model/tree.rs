use std::collections::HashMap;

use crate::model::channel::{Channel, ROOT_CHANNEL_ID};
use crate::model::user::{TalkState, User};

/// One state-delta for a channel, mapped from the wire message by the
/// protocol handler. `None` fields leave the current value untouched.
#[derive(Clone, Debug, Default)]
pub struct ChannelStateDelta {
    pub id: u32,
    pub parent: Option<u32>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub position: Option<i32>,
    pub temporary: Option<bool>,
    /// Full replacement of the link set, when present.
    pub links: Option<Vec<u32>>,
    pub links_add: Vec<u32>,
    pub links_remove: Vec<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct UserStateDelta {
    pub session: u32,
    pub name: Option<String>,
    pub channel_id: Option<u32>,
    pub comment: Option<String>,
    pub user_id: Option<u32>,
    pub muted: Option<bool>,
    pub deafened: Option<bool>,
    pub suppressed: Option<bool>,
    pub self_muted: Option<bool>,
    pub self_deafened: Option<bool>,
    pub priority_speaker: Option<bool>,
}

/// One observable event per applied delta, in application order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelEvent {
    ChannelAdded(u32),
    ChannelUpdated(u32),
    ChannelRemoved(u32),
    ChannelPermissionsUpdated(u32),
    UserConnected(u32),
    UserUpdated(u32),
    UserTalkStateUpdated(u32),
    UserMoved { session: u32, from: u32, to: u32 },
    UserRemoved {
        session: u32,
        reason: Option<String>,
        ban: bool,
    },
}

/// The live channel/user graph for one connection. A fresh tree is created
/// per connection attempt and discarded wholesale on disconnect.
#[derive(Debug)]
pub struct ModelTree {
    channels: HashMap<u32, Channel>,
    users: HashMap<u32, User>,
    events: Vec<ModelEvent>,
    local_mute_history: Vec<u32>,
    local_ignore_history: Vec<u32>,
}

impl Default for ModelTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelTree {
    pub fn new() -> Self {
        Self::with_history(Vec::new(), Vec::new())
    }

    /// `mute_history`/`ignore_history` carry registered-user IDs that should
    /// be locally muted or ignored as soon as they appear in the tree.
    pub fn with_history(mute_history: Vec<u32>, ignore_history: Vec<u32>) -> Self {
        let mut channels = HashMap::new();
        channels.insert(ROOT_CHANNEL_ID, Channel::new(ROOT_CHANNEL_ID, None));
        Self {
            channels,
            users: HashMap::new(),
            events: Vec::new(),
            local_mute_history: mute_history,
            local_ignore_history: ignore_history,
        }
    }

    pub fn channel(&self, id: u32) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn user(&self, session: u32) -> Option<&User> {
        self.users.get(&session)
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels = self.channels.values().cloned().collect::<Vec<_>>();
        channels.sort_by_key(|channel| channel.id);
        channels
    }

    pub fn users(&self) -> Vec<User> {
        let mut users = self.users.values().cloned().collect::<Vec<_>>();
        users.sort_by_key(|user| user.session);
        users
    }

    /// Sessions of all users currently in `channel_id`.
    pub fn users_in_channel(&self, channel_id: u32) -> Vec<u32> {
        let mut sessions = self
            .users
            .values()
            .filter(|user| user.channel_id == channel_id)
            .map(|user| user.session)
            .collect::<Vec<_>>();
        sessions.sort_unstable();
        sessions
    }

    pub fn take_events(&mut self) -> Vec<ModelEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn apply_channel_state(&mut self, delta: ChannelStateDelta) {
        let added = !self.channels.contains_key(&delta.id);
        if added {
            // New non-root channels default to the root as parent until the
            // delta says otherwise.
            let parent = delta.parent.unwrap_or(ROOT_CHANNEL_ID);
            self.channels
                .insert(delta.id, Channel::new(delta.id, Some(parent)));
            self.attach_child(parent, delta.id);
        } else if let Some(new_parent) = delta.parent {
            self.reparent(delta.id, new_parent);
        }

        let channel = self
            .channels
            .get_mut(&delta.id)
            .expect("channel inserted above");
        if let Some(name) = delta.name {
            channel.name = name;
        }
        if let Some(description) = delta.description {
            channel.description = description;
        }
        if let Some(position) = delta.position {
            channel.position = position;
        }
        if let Some(temporary) = delta.temporary {
            channel.temporary = temporary;
        }
        if let Some(links) = delta.links {
            channel.links = links.into_iter().filter(|id| *id != delta.id).collect();
        }
        for link in delta.links_add {
            if link != delta.id {
                channel.links.insert(link);
            }
        }
        for link in delta.links_remove {
            channel.links.remove(&link);
        }

        self.events.push(if added {
            ModelEvent::ChannelAdded(delta.id)
        } else {
            ModelEvent::ChannelUpdated(delta.id)
        });
    }

    /// Removes a channel and its subtree. Users stranded in the removed
    /// subtree move to the root channel so no user ever references a dead
    /// channel. Removing the root is ignored.
    pub fn apply_channel_remove(&mut self, id: u32) {
        if id == ROOT_CHANNEL_ID || !self.channels.contains_key(&id) {
            return;
        }

        let removed = self.collect_subtree(id);
        if let Some(parent) = self.channels.get(&id).and_then(|channel| channel.parent) {
            if let Some(parent) = self.channels.get_mut(&parent) {
                parent.children.retain(|child| *child != id);
            }
        }

        for user in self.users.values_mut() {
            if removed.contains(&user.channel_id) {
                let from = user.channel_id;
                user.channel_id = ROOT_CHANNEL_ID;
                self.events.push(ModelEvent::UserMoved {
                    session: user.session,
                    from,
                    to: ROOT_CHANNEL_ID,
                });
            }
        }

        for dead in &removed {
            self.channels.remove(dead);
            self.events.push(ModelEvent::ChannelRemoved(*dead));
        }
        for channel in self.channels.values_mut() {
            for dead in &removed {
                channel.links.remove(dead);
            }
        }
    }

    pub fn apply_user_state(&mut self, delta: UserStateDelta) {
        let added = !self.users.contains_key(&delta.session);
        let user = self
            .users
            .entry(delta.session)
            .or_insert_with(|| User::new(delta.session, ROOT_CHANNEL_ID));
        let previous_channel = user.channel_id;

        if let Some(name) = delta.name {
            user.name = name;
        }
        if let Some(comment) = delta.comment {
            user.comment = comment;
        }
        if let Some(user_id) = delta.user_id {
            user.user_id = Some(user_id);
            if self.local_mute_history.contains(&user_id) {
                user.local_muted = true;
            }
            if self.local_ignore_history.contains(&user_id) {
                user.local_ignored = true;
            }
        }
        if let Some(muted) = delta.muted {
            user.muted = muted;
        }
        if let Some(deafened) = delta.deafened {
            user.deafened = deafened;
        }
        if let Some(suppressed) = delta.suppressed {
            user.suppressed = suppressed;
        }
        if let Some(self_muted) = delta.self_muted {
            user.self_muted = self_muted;
        }
        if let Some(self_deafened) = delta.self_deafened {
            user.self_deafened = self_deafened;
        }
        if let Some(priority) = delta.priority_speaker {
            user.priority_speaker = priority;
        }

        let mut moved = None;
        if let Some(channel_id) = delta.channel_id {
            // A move to an unknown channel is dropped; the channel delta
            // always precedes the user delta in the synchronization burst.
            if self.channels.contains_key(&channel_id) {
                let user = self.users.get_mut(&delta.session).expect("inserted above");
                if user.channel_id != channel_id {
                    user.channel_id = channel_id;
                    moved = Some((previous_channel, channel_id));
                }
            } else {
                log::warn!(
                    "user {} referenced unknown channel {channel_id}",
                    delta.session
                );
            }
        }

        if added {
            self.events.push(ModelEvent::UserConnected(delta.session));
        } else if let Some((from, to)) = moved {
            self.events.push(ModelEvent::UserMoved {
                session: delta.session,
                from,
                to,
            });
        } else {
            self.events.push(ModelEvent::UserUpdated(delta.session));
        }
    }

    pub fn apply_user_remove(&mut self, session: u32, reason: Option<String>, ban: bool) {
        if self.users.remove(&session).is_some() {
            self.events.push(ModelEvent::UserRemoved {
                session,
                reason,
                ban,
            });
        }
    }

    pub fn set_channel_permissions(&mut self, id: u32, permissions: u32, flush: bool) {
        if flush {
            for channel in self.channels.values_mut() {
                channel.permissions = None;
            }
        }
        if let Some(channel) = self.channels.get_mut(&id) {
            channel.permissions = Some(permissions);
            self.events.push(ModelEvent::ChannelPermissionsUpdated(id));
        }
    }

    pub fn set_talk_state(&mut self, session: u32, state: TalkState) {
        if let Some(user) = self.users.get_mut(&session) {
            if user.talk_state != state {
                user.talk_state = state;
                self.events.push(ModelEvent::UserTalkStateUpdated(session));
            }
        }
    }

    pub fn set_local_mute(&mut self, session: u32, muted: bool) {
        if let Some(user) = self.users.get_mut(&session) {
            user.local_muted = muted;
            self.events.push(ModelEvent::UserUpdated(session));
        }
    }

    pub fn set_local_ignore(&mut self, session: u32, ignored: bool) {
        if let Some(user) = self.users.get_mut(&session) {
            user.local_ignored = ignored;
            self.events.push(ModelEvent::UserUpdated(session));
        }
    }

    fn attach_child(&mut self, parent: u32, child: u32) {
        if !self.channels.contains_key(&parent) {
            // Out-of-order burst: synthesize the parent under the root.
            log::warn!("channel {child} references unannounced parent {parent}, synthesizing it");
            self.channels
                .insert(parent, Channel::new(parent, Some(ROOT_CHANNEL_ID)));
            self.attach_child(ROOT_CHANNEL_ID, parent);
        }
        let parent = self.channels.get_mut(&parent).expect("inserted above");
        if !parent.children.contains(&child) {
            parent.children.push(child);
        }
    }

    /// Reparenting that would detach the root or create a cycle is ignored.
    fn reparent(&mut self, id: u32, new_parent: u32) {
        if id == ROOT_CHANNEL_ID || id == new_parent || self.would_cycle(id, new_parent) {
            return;
        }
        let old_parent = match self.channels.get_mut(&id) {
            Some(channel) => channel.parent.replace(new_parent),
            None => return,
        };
        if let Some(old_parent) = old_parent {
            if let Some(channel) = self.channels.get_mut(&old_parent) {
                channel.children.retain(|child| *child != id);
            }
        }
        self.attach_child(new_parent, id);
    }

    fn would_cycle(&self, id: u32, new_parent: u32) -> bool {
        let mut cursor = Some(new_parent);
        while let Some(current) = cursor {
            if current == id {
                return true;
            }
            cursor = self.channels.get(&current).and_then(|channel| channel.parent);
        }
        false
    }

    fn collect_subtree(&self, id: u32) -> Vec<u32> {
        let mut pending = vec![id];
        let mut collected = Vec::new();
        while let Some(current) = pending.pop() {
            collected.push(current);
            if let Some(channel) = self.channels.get(&current) {
                pending.extend(channel.children.iter().copied());
            }
        }
        collected
    }
}

#[cfg(test)]
mod tests {
    use super::{ChannelStateDelta, ModelEvent, ModelTree, UserStateDelta};
    use crate::model::channel::ROOT_CHANNEL_ID;
    use crate::model::user::TalkState;

    fn channel_delta(id: u32, parent: Option<u32>, name: &str) -> ChannelStateDelta {
        ChannelStateDelta {
            id,
            parent,
            name: Some(name.to_string()),
            ..ChannelStateDelta::default()
        }
    }

    fn user_delta(session: u32, channel_id: u32, name: &str) -> UserStateDelta {
        UserStateDelta {
            session,
            name: Some(name.to_string()),
            channel_id: Some(channel_id),
            ..UserStateDelta::default()
        }
    }

    /// Every non-root channel reaches the root with no cycles, and every
    /// user's channel resolves to a live channel.
    fn assert_invariants(tree: &ModelTree) {
        assert!(tree.channel(ROOT_CHANNEL_ID).is_some(), "root must resolve");
        for channel in tree.channels() {
            if channel.is_root() {
                assert!(channel.parent.is_none());
                continue;
            }
            let mut seen = vec![channel.id];
            let mut cursor = channel.parent;
            loop {
                let parent = cursor.expect("non-root channel must have a parent");
                assert!(!seen.contains(&parent), "parent cycle detected");
                seen.push(parent);
                let node = tree.channel(parent).expect("parent must be live");
                if node.is_root() {
                    break;
                }
                cursor = node.parent;
            }
        }
        for user in tree.users() {
            assert!(
                tree.channel(user.channel_id).is_some(),
                "user {} references dead channel {}",
                user.session,
                user.channel_id
            );
        }
    }

    /// The root channel exists from construction.
    #[test]
    fn root_resolves_from_construction() {
        // Arrange
        let tree = ModelTree::new();
        // Assert
        assert!(tree.channel(ROOT_CHANNEL_ID).is_some());
        assert!(tree.channel(5).is_none());
        assert!(tree.user(5).is_none());
    }

    /// Channel add and update emit distinct events and apply attributes.
    #[test]
    fn channel_state_adds_then_updates() {
        // Arrange
        let mut tree = ModelTree::new();

        // Act
        tree.apply_channel_state(channel_delta(1, Some(ROOT_CHANNEL_ID), "Lobby"));
        tree.apply_channel_state(channel_delta(1, None, "Main"));

        // Assert
        let channel = tree.channel(1).expect("channel missing");
        assert_eq!(channel.name, "Main");
        assert_eq!(channel.parent, Some(ROOT_CHANNEL_ID));
        assert_eq!(
            tree.take_events(),
            vec![ModelEvent::ChannelAdded(1), ModelEvent::ChannelUpdated(1)]
        );
        assert_invariants(&tree);
    }

    /// A channel announced before its parent gets the parent synthesized
    /// under the root, keeping the tree connected.
    #[test]
    fn unannounced_parent_is_synthesized_under_root() {
        // Arrange
        let mut tree = ModelTree::new();

        // Act
        tree.apply_channel_state(channel_delta(5, Some(3), "Orphan"));

        // Assert
        let parent = tree.channel(3).expect("synthesized parent missing");
        assert_eq!(parent.parent, Some(ROOT_CHANNEL_ID));
        assert!(parent.children.contains(&5));
        assert_eq!(tree.channel(5).expect("child missing").parent, Some(3));
        assert_invariants(&tree);
    }

    /// Reparenting moves the child between parent child-lists.
    #[test]
    fn channel_reparent_updates_children() {
        // Arrange
        let mut tree = ModelTree::new();
        tree.apply_channel_state(channel_delta(1, Some(ROOT_CHANNEL_ID), "A"));
        tree.apply_channel_state(channel_delta(2, Some(ROOT_CHANNEL_ID), "B"));

        // Act
        tree.apply_channel_state(ChannelStateDelta {
            id: 2,
            parent: Some(1),
            ..ChannelStateDelta::default()
        });

        // Assert
        assert_eq!(tree.channel(2).expect("missing").parent, Some(1));
        assert!(tree.channel(1).expect("missing").children.contains(&2));
        assert!(!tree
            .channel(ROOT_CHANNEL_ID)
            .expect("missing")
            .children
            .contains(&2));
        assert_invariants(&tree);
    }

    /// A reparent that would create a cycle is ignored.
    #[test]
    fn channel_reparent_rejects_cycles() {
        // Arrange
        let mut tree = ModelTree::new();
        tree.apply_channel_state(channel_delta(1, Some(ROOT_CHANNEL_ID), "A"));
        tree.apply_channel_state(channel_delta(2, Some(1), "B"));

        // Act: 1 -> 2 would make 1 its own ancestor.
        tree.apply_channel_state(ChannelStateDelta {
            id: 1,
            parent: Some(2),
            ..ChannelStateDelta::default()
        });

        // Assert
        assert_eq!(tree.channel(1).expect("missing").parent, Some(ROOT_CHANNEL_ID));
        assert_invariants(&tree);
    }

    /// Links apply as set replacement plus add/remove deltas, never self.
    #[test]
    fn channel_links_apply() {
        // Arrange
        let mut tree = ModelTree::new();
        tree.apply_channel_state(channel_delta(1, Some(ROOT_CHANNEL_ID), "A"));
        tree.apply_channel_state(channel_delta(2, Some(ROOT_CHANNEL_ID), "B"));
        tree.apply_channel_state(channel_delta(3, Some(ROOT_CHANNEL_ID), "C"));

        // Act
        tree.apply_channel_state(ChannelStateDelta {
            id: 1,
            links: Some(vec![2, 3, 1]),
            ..ChannelStateDelta::default()
        });
        tree.apply_channel_state(ChannelStateDelta {
            id: 1,
            links_remove: vec![2],
            ..ChannelStateDelta::default()
        });

        // Assert
        let links = &tree.channel(1).expect("missing").links;
        assert!(links.contains(&3));
        assert!(!links.contains(&2));
        assert!(!links.contains(&1));
    }

    /// Removing a channel removes its subtree and moves stranded users to
    /// the root.
    #[test]
    fn channel_remove_strands_users_to_root() {
        // Arrange
        let mut tree = ModelTree::new();
        tree.apply_channel_state(channel_delta(1, Some(ROOT_CHANNEL_ID), "A"));
        tree.apply_channel_state(channel_delta(2, Some(1), "B"));
        tree.apply_user_state(user_delta(9, 2, "Eve"));
        tree.take_events();

        // Act
        tree.apply_channel_remove(1);

        // Assert
        assert!(tree.channel(1).is_none());
        assert!(tree.channel(2).is_none());
        assert_eq!(tree.user(9).expect("missing").channel_id, ROOT_CHANNEL_ID);
        let events = tree.take_events();
        assert!(events.contains(&ModelEvent::UserMoved {
            session: 9,
            from: 2,
            to: ROOT_CHANNEL_ID
        }));
        assert!(events.contains(&ModelEvent::ChannelRemoved(1)));
        assert!(events.contains(&ModelEvent::ChannelRemoved(2)));
        assert_invariants(&tree);
    }

    /// Removing the root is ignored.
    #[test]
    fn channel_remove_ignores_root() {
        // Arrange
        let mut tree = ModelTree::new();
        // Act
        tree.apply_channel_remove(ROOT_CHANNEL_ID);
        // Assert
        assert!(tree.channel(ROOT_CHANNEL_ID).is_some());
    }

    /// User connect, update and move emit distinct events.
    #[test]
    fn user_state_connects_updates_and_moves() {
        // Arrange
        let mut tree = ModelTree::new();
        tree.apply_channel_state(channel_delta(1, Some(ROOT_CHANNEL_ID), "A"));
        tree.take_events();

        // Act
        tree.apply_user_state(user_delta(7, ROOT_CHANNEL_ID, "Alice"));
        tree.apply_user_state(UserStateDelta {
            session: 7,
            self_muted: Some(true),
            ..UserStateDelta::default()
        });
        tree.apply_user_state(UserStateDelta {
            session: 7,
            channel_id: Some(1),
            ..UserStateDelta::default()
        });

        // Assert
        let user = tree.user(7).expect("missing");
        assert_eq!(user.name, "Alice");
        assert!(user.self_muted);
        assert_eq!(user.channel_id, 1);
        assert_eq!(
            tree.take_events(),
            vec![
                ModelEvent::UserConnected(7),
                ModelEvent::UserUpdated(7),
                ModelEvent::UserMoved {
                    session: 7,
                    from: ROOT_CHANNEL_ID,
                    to: 1
                },
            ]
        );
        assert_invariants(&tree);
    }

    /// A move to an unknown channel is dropped, keeping the reference live.
    #[test]
    fn user_move_to_unknown_channel_is_dropped() {
        // Arrange
        let mut tree = ModelTree::new();
        tree.apply_user_state(user_delta(7, ROOT_CHANNEL_ID, "Alice"));

        // Act
        tree.apply_user_state(UserStateDelta {
            session: 7,
            channel_id: Some(99),
            ..UserStateDelta::default()
        });

        // Assert
        assert_eq!(tree.user(7).expect("missing").channel_id, ROOT_CHANNEL_ID);
        assert_invariants(&tree);
    }

    /// Removing a user deletes the entry and reports reason and ban flag.
    #[test]
    fn user_remove_reports_reason() {
        // Arrange
        let mut tree = ModelTree::new();
        tree.apply_user_state(user_delta(7, ROOT_CHANNEL_ID, "Alice"));
        tree.take_events();

        // Act
        tree.apply_user_remove(7, Some("spam".to_string()), true);

        // Assert
        assert!(tree.user(7).is_none());
        assert_eq!(
            tree.take_events(),
            vec![ModelEvent::UserRemoved {
                session: 7,
                reason: Some("spam".to_string()),
                ban: true
            }]
        );
    }

    /// Local mute/ignore history applies when the registered id arrives.
    #[test]
    fn history_applies_on_registered_id() {
        // Arrange
        let mut tree = ModelTree::with_history(vec![50], vec![60]);
        tree.apply_user_state(user_delta(7, ROOT_CHANNEL_ID, "Alice"));
        tree.apply_user_state(user_delta(8, ROOT_CHANNEL_ID, "Bob"));

        // Act
        tree.apply_user_state(UserStateDelta {
            session: 7,
            user_id: Some(50),
            ..UserStateDelta::default()
        });
        tree.apply_user_state(UserStateDelta {
            session: 8,
            user_id: Some(60),
            ..UserStateDelta::default()
        });

        // Assert
        assert!(tree.user(7).expect("missing").local_muted);
        assert!(tree.user(8).expect("missing").local_ignored);
    }

    /// Permission flush clears all cached permissions before the update.
    #[test]
    fn permission_flush_clears_cache() {
        // Arrange
        let mut tree = ModelTree::new();
        tree.apply_channel_state(channel_delta(1, Some(ROOT_CHANNEL_ID), "A"));
        tree.set_channel_permissions(1, 0xf, false);

        // Act
        tree.set_channel_permissions(ROOT_CHANNEL_ID, 0x1, true);

        // Assert
        assert_eq!(tree.channel(1).expect("missing").permissions, None);
        assert_eq!(
            tree.channel(ROOT_CHANNEL_ID).expect("missing").permissions,
            Some(0x1)
        );
    }

    /// Talk-state changes emit events only on actual change.
    #[test]
    fn talk_state_emits_on_change_only() {
        // Arrange
        let mut tree = ModelTree::new();
        tree.apply_user_state(user_delta(7, ROOT_CHANNEL_ID, "Alice"));
        tree.take_events();

        // Act
        tree.set_talk_state(7, TalkState::Talking);
        tree.set_talk_state(7, TalkState::Talking);
        tree.set_talk_state(7, TalkState::Passive);

        // Assert
        assert_eq!(
            tree.take_events(),
            vec![
                ModelEvent::UserTalkStateUpdated(7),
                ModelEvent::UserTalkStateUpdated(7),
            ]
        );
    }

    /// An arbitrary interleaving of valid deltas preserves the invariants.
    #[test]
    fn invariants_hold_across_delta_sequences() {
        // Arrange
        let mut tree = ModelTree::new();

        // Act
        tree.apply_channel_state(channel_delta(1, Some(ROOT_CHANNEL_ID), "A"));
        tree.apply_channel_state(channel_delta(2, Some(1), "B"));
        tree.apply_channel_state(channel_delta(3, Some(2), "C"));
        tree.apply_user_state(user_delta(10, 3, "u10"));
        tree.apply_user_state(user_delta(11, 2, "u11"));
        tree.apply_channel_state(ChannelStateDelta {
            id: 3,
            parent: Some(1),
            ..ChannelStateDelta::default()
        });
        tree.apply_channel_remove(2);
        tree.apply_user_state(user_delta(12, 3, "u12"));
        tree.apply_user_remove(10, None, false);
        tree.apply_channel_remove(1);

        // Assert
        assert_invariants(&tree);
        assert_eq!(tree.user(11).expect("missing").channel_id, ROOT_CHANNEL_ID);
        assert_eq!(tree.user(12).expect("missing").channel_id, ROOT_CHANNEL_ID);
    }
}
