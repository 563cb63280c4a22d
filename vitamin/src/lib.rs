pub mod augment;
pub mod checkpoint;
pub mod circular;
pub mod config;
pub mod cvae;
pub mod decoder;
pub mod embedding;
pub mod encoder;
pub mod error;
pub mod heads;
pub mod normalization;
pub mod param_registry;
pub mod ramp;
pub mod waveform_loader;

pub use vitamin_nn;
pub use vitamin_nn::candle_core;
pub use vitamin_nn::candle_nn;
