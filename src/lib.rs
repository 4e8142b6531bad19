#![allow(clippy::new_ret_no_self)]
pub mod chirp;
pub use chirp::ChirpTable;
pub mod dechirp;
pub use dechirp::{DechirpDirection, Dechirper};
pub mod lora_detector;
pub use lora_detector::{
    DetectorConfig, DetectorMethod, LoraDetector, DEMOD_HISTORY, MAX_DISTANCE,
    MIN_PREAMBLE_CHIRPS, PREAMBLE_CHIRPS,
};
pub mod peak_history;
pub use peak_history::PeakHistory;
pub mod utilities;
pub use utilities::*;
