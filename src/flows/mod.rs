pub mod crypto;
pub mod endpoint;

pub use crypto::FlowCipher;
pub use endpoint::{FlowEndpoint, FlowReply};
