pub mod detector;
pub mod scorer;

pub use detector::{DetectorConfig, SpeechActivityDetector, SpeechSegment, VadEvent};
pub use scorer::{WebrtcWindowScorer, WindowScorer};
