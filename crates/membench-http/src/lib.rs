pub mod chat;
pub mod mem0;
pub mod protocol;
pub mod status;

pub use chat::ChatClient;
pub use mem0::Mem0Client;
pub use status::{classify, classify_status};
