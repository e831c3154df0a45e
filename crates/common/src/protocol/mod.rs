mod body;
mod log;
mod message;
mod request;
mod response;

pub use body::Body;
pub use log::RequestLogEntry;
pub use message::{ErrorCode, Handshake, Message, Role};
pub use request::RequestFrame;
pub use response::ResponseFrame;
