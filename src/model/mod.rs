pub mod channel;
pub mod server;
pub mod tree;
pub mod user;
pub mod whisper;

pub use channel::{Channel, ROOT_CHANNEL_ID};
pub use server::{NoopSrvResolver, Server, SrvResolver, DEFAULT_PORT};
pub use tree::{ChannelStateDelta, ModelEvent, ModelTree, UserStateDelta};
pub use user::{TalkState, User};
pub use whisper::{WhisperTarget, WhisperTargetRegistry, MAX_TARGET_ID, MIN_TARGET_ID};
