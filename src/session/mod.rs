pub mod config;
pub mod events;
pub mod orchestrator;

pub use config::SessionConfig;
pub use events::{
    ChatMessage, ConnectionState, ObserverRegistry, ObserverToken, SessionEvent, SessionObserver,
    VoiceTargetMode,
};
pub use orchestrator::Session;
