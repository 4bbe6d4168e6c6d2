pub mod capture;
pub mod frame;
pub mod resample;
pub mod wav;

pub use capture::MicrophoneSource;
pub use frame::{AudioFrame, SlidingWindow};
