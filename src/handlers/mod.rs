pub mod asr;

pub use asr::transcribe;
