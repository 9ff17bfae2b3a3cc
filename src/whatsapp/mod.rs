pub mod media;
pub mod outbound;
pub mod webhook;

pub use media::{GraphMediaClient, UnconfiguredMedia};
pub use outbound::{CloudApiMessenger, LogMessenger};
pub use webhook::{WebhookPayload, inbound_messages};
