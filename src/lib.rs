//! zeforge - single-token transformer decode on the CPU or a Level Zero GPU
//!
//! Loads a llama2-style float32 checkpoint and produces next-token logits one
//! position at a time. The CPU path runs every stage on a rayon pool; the
//! Level Zero path keeps activations in unified shared memory and offloads
//! the vocabulary projection to a precompiled `matMul` kernel.

#![cfg_attr(feature = "simd", feature(portable_simd))] // std::simd CPU kernels (nightly)

#![allow(clippy::too_many_arguments)] // FFI entry points and kernels take many args
#![allow(clippy::missing_safety_doc)] // FFI safety documented at module level
#![allow(clippy::needless_range_loop)] // Clearer for layer loops

pub mod backend;
pub mod error;
pub mod logging;
pub mod model;

pub use backend::{BackendConfig, BackendKind, ComputeBackend, CpuBackend, FloatBuffer, ZeBackend};
pub use error::{ErrorCategory, ForgeResult, ZeForgeError};
pub use model::{Checkpoint, Model, ModelParameters, RawWeights, Transformer};
