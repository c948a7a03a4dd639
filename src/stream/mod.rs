mod assembler;
mod decoder;

pub use assembler::{ConversationAssembler, OrphanDeltaPolicy};
pub use decoder::{ProtocolEvent, StreamDecoder};
