/// The audible state of a user, derived from received voice packets for
/// remote users and from the encode path for the local user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TalkState {
    Passive,
    Talking,
    Shouting,
    Whispering,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    /// Ephemeral server-assigned session ID, unique while connected.
    pub session: u32,
    pub channel_id: u32,
    pub name: String,
    pub comment: String,
    /// Registered-user ID, if this user is registered on the server.
    pub user_id: Option<u32>,
    pub talk_state: TalkState,
    pub muted: bool,
    pub deafened: bool,
    pub suppressed: bool,
    pub self_muted: bool,
    pub self_deafened: bool,
    pub priority_speaker: bool,
    pub local_muted: bool,
    pub local_ignored: bool,
}

impl User {
    pub fn new(session: u32, channel_id: u32) -> Self {
        Self {
            session,
            channel_id,
            name: String::new(),
            comment: String::new(),
            user_id: None,
            talk_state: TalkState::Passive,
            muted: false,
            deafened: false,
            suppressed: false,
            self_muted: false,
            self_deafened: false,
            priority_speaker: false,
            local_muted: false,
            local_ignored: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{TalkState, User};

    /// New users are passive and carry no flags.
    #[test]
    fn new_user_defaults() {
        // Arrange
        // Act
        let user = User::new(9, 0);
        // Assert
        assert_eq!(user.session, 9);
        assert_eq!(user.channel_id, 0);
        assert_eq!(user.talk_state, TalkState::Passive);
        assert!(!user.self_muted);
        assert!(!user.local_muted);
        assert!(user.user_id.is_none());
    }
}
