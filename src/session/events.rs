use std::cell::RefCell;
use std::rc::Rc;

use crate::error::SessionError;
use crate::model::tree::ModelEvent;

/// Lifecycle of one session. `ConnectionLost` means a retry is pending;
/// a final loss goes straight to `Disconnected`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ConnectionLost,
}

/// How outgoing voice is being targeted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoiceTargetMode {
    Normal,
    Whisper,
    Server,
}

impl VoiceTargetMode {
    pub fn from_id(id: u8) -> Self {
        match id {
            0 => VoiceTargetMode::Normal,
            31 => VoiceTargetMode::Server,
            _ => VoiceTargetMode::Whisper,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub actor: Option<u32>,
    pub actor_name: Option<String>,
    pub target_sessions: Vec<u32>,
    pub target_channels: Vec<u32>,
    pub target_trees: Vec<u32>,
    pub body: String,
}

/// Everything observers can see, in the order it happened.
#[derive(Debug)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// Terminal for this connection. `None` for a local disconnect.
    Disconnected(Option<SessionError>),
    /// Certificate verification failed; carries the DER chain presented.
    TlsHandshakeFailed(Vec<Vec<u8>>),
    ChannelAdded(u32),
    ChannelUpdated(u32),
    ChannelRemoved(u32),
    ChannelPermissionsUpdated(u32),
    UserConnected(u32),
    UserUpdated(u32),
    UserTalkStateUpdated(u32),
    UserJoinedChannel { session: u32, from: u32, to: u32 },
    UserRemoved {
        session: u32,
        reason: Option<String>,
        ban: bool,
    },
    MessageLogged(ChatMessage),
    PermissionDenied(String),
    VoiceTargetChanged(VoiceTargetMode),
}

impl From<ModelEvent> for SessionEvent {
    fn from(event: ModelEvent) -> Self {
        match event {
            ModelEvent::ChannelAdded(id) => SessionEvent::ChannelAdded(id),
            ModelEvent::ChannelUpdated(id) => SessionEvent::ChannelUpdated(id),
            ModelEvent::ChannelRemoved(id) => SessionEvent::ChannelRemoved(id),
            ModelEvent::ChannelPermissionsUpdated(id) => {
                SessionEvent::ChannelPermissionsUpdated(id)
            }
            ModelEvent::UserConnected(session) => SessionEvent::UserConnected(session),
            ModelEvent::UserUpdated(session) => SessionEvent::UserUpdated(session),
            ModelEvent::UserTalkStateUpdated(session) => {
                SessionEvent::UserTalkStateUpdated(session)
            }
            ModelEvent::UserMoved { session, from, to } => {
                SessionEvent::UserJoinedChannel { session, from, to }
            }
            ModelEvent::UserRemoved {
                session,
                reason,
                ban,
            } => SessionEvent::UserRemoved {
                session,
                reason,
                ban,
            },
        }
    }
}

pub trait SessionObserver {
    fn on_event(&mut self, event: &SessionEvent);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObserverToken(u64);

/// Fan-out point for session events, delivered on the pump context in
/// registration order.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: Vec<(ObserverToken, Rc<RefCell<dyn SessionObserver>>)>,
    next_token: u64,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Rc<RefCell<dyn SessionObserver>>) -> ObserverToken {
        let token = ObserverToken(self.next_token);
        self.next_token += 1;
        self.observers.push((token, observer));
        token
    }

    pub fn unregister(&mut self, token: ObserverToken) {
        self.observers.retain(|(held, _)| *held != token);
    }

    pub fn emit(&self, event: &SessionEvent) {
        for (_, observer) in &self.observers {
            observer.borrow_mut().on_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ConnectionState, ObserverRegistry, SessionEvent, SessionObserver, VoiceTargetMode,
    };
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recorder {
        label: &'static str,
        seen: Rc<RefCell<Vec<&'static str>>>,
    }

    impl SessionObserver for Recorder {
        fn on_event(&mut self, _event: &SessionEvent) {
            self.seen.borrow_mut().push(self.label);
        }
    }

    /// Observers receive events in registration order until unregistered.
    #[test]
    fn registry_fans_out_in_order() {
        // Arrange
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut registry = ObserverRegistry::new();
        let first = registry.register(Rc::new(RefCell::new(Recorder {
            label: "first",
            seen: Rc::clone(&seen),
        })));
        registry.register(Rc::new(RefCell::new(Recorder {
            label: "second",
            seen: Rc::clone(&seen),
        })));

        // Act
        registry.emit(&SessionEvent::StateChanged(ConnectionState::Connecting));
        registry.unregister(first);
        registry.emit(&SessionEvent::StateChanged(ConnectionState::Connected));

        // Assert
        assert_eq!(*seen.borrow(), vec!["first", "second", "second"]);
    }

    /// Target ids map onto the three voice target modes.
    #[test]
    fn target_ids_map_to_modes() {
        assert_eq!(VoiceTargetMode::from_id(0), VoiceTargetMode::Normal);
        assert_eq!(VoiceTargetMode::from_id(1), VoiceTargetMode::Whisper);
        assert_eq!(VoiceTargetMode::from_id(30), VoiceTargetMode::Whisper);
        assert_eq!(VoiceTargetMode::from_id(31), VoiceTargetMode::Server);
    }
}
