//! Model parameters, weights, per-session state and the decode pipeline

pub mod checkpoint;
pub mod config;
pub mod kv_cache;
pub mod state;
pub mod transformer;
pub mod weights;

pub use checkpoint::{save_checkpoint, write_checkpoint, Checkpoint};
pub use config::ModelParameters;
pub use kv_cache::KvCache;
pub use state::DecodeState;
pub use transformer::{Model, Transformer};
pub use weights::{checkpoint_layout, RawWeights, TensorSpec, WeightSet};
