mod types;

pub use types::{ConvoyConfig, EngineConfig, FeaturesConfig, SweepSettings};
