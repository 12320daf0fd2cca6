pub mod dispatch;
pub mod handlers;

pub use dispatch::{ControlHandler, DatagramHandler, HandlerToken, MessageDispatcher};
pub use handlers::ModelUpdater;
