//! Buffer capability shared by host arrays and unified device memory
//!
//! The decode pipeline and the CPU kernels only ever see `&[f32]` /
//! `&mut [f32]` obtained through [`FloatBuffer`], so a buffer backed by a
//! `Vec<f32>` and one backed by a Level Zero shared allocation are
//! interchangeable.

use std::fmt;

/// Contiguous f32 storage readable and writable from the host.
pub trait FloatBuffer: Send + Sync {
    fn as_slice(&self) -> &[f32];

    fn as_mut_slice(&mut self) -> &mut [f32];

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> f32 {
        self.as_slice()[index]
    }

    fn set(&mut self, index: usize, value: f32) {
        self.as_mut_slice()[index] = value;
    }

    fn fill(&mut self, value: f32) {
        self.as_mut_slice().fill(value);
    }
}

/// Plain host-memory buffer used by the CPU backend.
#[derive(Clone, PartialEq, Default)]
pub struct HostBuffer {
    data: Vec<f32>,
}

impl HostBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self {
            data: vec![0.0; len],
        }
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

impl From<Vec<f32>> for HostBuffer {
    fn from(data: Vec<f32>) -> Self {
        Self { data }
    }
}

impl FloatBuffer for HostBuffer {
    fn as_slice(&self) -> &[f32] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}
