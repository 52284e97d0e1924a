/*! Root signatures, pipeline state objects and their caches.
 *
 * Both caches are keyed by a description of what is being built, never by
 * the objects themselves, so equal descriptions always resolve to the same
 * `Arc`. Creation happens under the cache's lock: it is rare compared to
 * lookups, and it keeps two threads from building the same object twice.
!*/

mod pso;
mod root_signature;

use std::sync::atomic::{AtomicU64, Ordering};

use hal::{InputElement, ShaderStage};
use thiserror::Error;

use crate::{device::DeviceError, resource::TrackerId};

pub use pso::{ComputePipeline, GraphicsPipeline, GraphicsPipelineDesc, PipelineStateCache};
pub use root_signature::{
    QuantizedBoundShaderState, RootSignature, RootSignatureCache, ShaderRegisterCounts,
};

#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum CreateRootSignatureError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Root signature costs {cost} root values, more than the limit of {limit}")]
    TooLarge { cost: u32, limit: u32 },
}

impl From<hal::DeviceError> for CreateRootSignatureError {
    fn from(error: hal::DeviceError) -> Self {
        Self::Device(error.into())
    }
}

#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum CreatePipelineError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    RootSignature(#[from] CreateRootSignatureError),
    #[error("{actual:?} shader bound to the {expected:?} stage")]
    StageMismatch {
        expected: ShaderStage,
        actual: ShaderStage,
    },
}

impl From<hal::DeviceError> for CreatePipelineError {
    fn from(error: hal::DeviceError) -> Self {
        Self::Device(error.into())
    }
}

/// Compiled shader bytecode and the registers it reads.
#[derive(Debug)]
pub struct Shader {
    id: TrackerId,
    stage: ShaderStage,
    bytecode: Vec<u8>,
    counts: ShaderRegisterCounts,
}

impl Shader {
    pub fn new(stage: ShaderStage, bytecode: Vec<u8>, counts: ShaderRegisterCounts) -> Self {
        Self {
            id: crate::resource::next_tracker_id(),
            stage,
            bytecode,
            counts,
        }
    }

    pub fn id(&self) -> TrackerId {
        self.id
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    pub fn counts(&self) -> ShaderRegisterCounts {
        self.counts
    }
}

/// The input layout of a vertex shader.
#[derive(Debug)]
pub struct VertexDeclaration {
    id: TrackerId,
    elements: Vec<InputElement>,
}

impl VertexDeclaration {
    pub fn new(elements: Vec<InputElement>) -> Self {
        Self {
            id: crate::resource::next_tracker_id(),
            elements,
        }
    }

    pub fn id(&self) -> TrackerId {
        self.id
    }

    pub fn elements(&self) -> &[InputElement] {
        &self.elements
    }
}

#[derive(Debug, Default)]
struct HitMiss {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HitMiss {
    fn record(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
