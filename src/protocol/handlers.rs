use std::cell::RefCell;
use std::rc::Rc;

use mumble_protocol_2x::control::{msgs, ControlPacket};
use mumble_protocol_2x::voice::Clientbound;

use crate::model::tree::{ChannelStateDelta, ModelTree, UserStateDelta};
use crate::protocol::dispatch::ControlHandler;

pub fn channel_delta_from(msg: &msgs::ChannelState) -> Option<ChannelStateDelta> {
    let id = msg.channel_id?;
    Some(ChannelStateDelta {
        id,
        parent: msg.parent,
        name: msg.name.clone(),
        description: msg.description.clone(),
        position: msg.position,
        temporary: msg.temporary,
        // Repeated fields carry no presence bit; an empty list means no
        // change and the add/remove deltas handle unlinking.
        links: if msg.links.is_empty() {
            None
        } else {
            Some(msg.links.clone())
        },
        links_add: msg.links_add.clone(),
        links_remove: msg.links_remove.clone(),
    })
}

pub fn user_delta_from(msg: &msgs::UserState) -> Option<UserStateDelta> {
    let session = msg.session?;
    Some(UserStateDelta {
        session,
        name: msg.name.clone(),
        channel_id: msg.channel_id,
        comment: msg.comment.clone(),
        user_id: msg.user_id,
        muted: msg.mute,
        deafened: msg.deaf,
        suppressed: msg.suppress,
        self_muted: msg.self_mute,
        self_deafened: msg.self_deaf,
        priority_speaker: msg.priority_speaker,
    })
}

/// Applies state packets to the tree as they arrive. Lifecycle packets
/// (handshake, rejection, crypt setup) are not its concern.
pub struct ModelUpdater {
    tree: Rc<RefCell<ModelTree>>,
}

impl ModelUpdater {
    pub fn new(tree: Rc<RefCell<ModelTree>>) -> Self {
        Self { tree }
    }
}

impl ControlHandler for ModelUpdater {
    fn handle_control(&mut self, packet: &ControlPacket<Clientbound>) -> Result<(), String> {
        match packet {
            ControlPacket::ChannelState(msg) => {
                let delta = channel_delta_from(msg)
                    .ok_or_else(|| "channel state without channel id".to_string())?;
                self.tree.borrow_mut().apply_channel_state(delta);
            }
            ControlPacket::ChannelRemove(msg) => {
                let id = msg
                    .channel_id
                    .ok_or_else(|| "channel remove without channel id".to_string())?;
                self.tree.borrow_mut().apply_channel_remove(id);
            }
            ControlPacket::UserState(msg) => {
                let delta = user_delta_from(msg)
                    .ok_or_else(|| "user state without session".to_string())?;
                self.tree.borrow_mut().apply_user_state(delta);
            }
            ControlPacket::UserRemove(msg) => {
                let session = msg
                    .session
                    .ok_or_else(|| "user remove without session".to_string())?;
                self.tree.borrow_mut().apply_user_remove(
                    session,
                    msg.reason.clone(),
                    msg.ban.unwrap_or(false),
                );
            }
            ControlPacket::PermissionQuery(msg) => {
                if let (Some(channel_id), Some(permissions)) = (msg.channel_id, msg.permissions) {
                    self.tree.borrow_mut().set_channel_permissions(
                        channel_id,
                        permissions,
                        msg.flush.unwrap_or(false),
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }
}
