pub mod capture;
pub mod conversation;
pub mod encode;
pub mod playback;

pub use capture::{CaptureEvent, CaptureSession, CaptureState};
pub use conversation::{Connector, ConversationHandle, ConversationSession, SessionState};
pub use encode::EncodeBridge;
pub use playback::PlaybackBuffer;
