pub mod classify;
pub mod debounce;
pub mod gray;

pub use classify::{classify, threshold, MotionSample, ThresholdMask};
pub use debounce::DebounceGate;
pub use gray::{difference, to_gray, DiffMap, GrayFrame};
