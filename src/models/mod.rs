pub mod conversation;
pub mod enums;

pub use conversation::{DedupKey, Message};
pub use enums::{CrisisReason, DeliverySource, InvalidEnum, MessageRole};
