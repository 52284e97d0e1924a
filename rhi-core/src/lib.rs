/*! Resource management engine for descriptor-heap based GPU APIs.
 *
 * This crate sits on top of `rhi-hal` and implements the bookkeeping a
 * renderer needs to submit work safely and cheaply:
 *
 * - [`fence`]: fences and sync points, the only source of GPU progress.
 * - [`descriptor`]: offline (CPU-only) descriptor pages and shader-visible
 *   online heaps, both ring-allocated and sub-allocated from a global heap.
 * - [`command`]: pools of command allocators and command lists, batched
 *   submission and the barrier lists resolved at execution time.
 * - [`track`]: per-subresource state tracking and transition logic.
 * - [`pipeline`]: root signature and pipeline state caches.
 * - [`state_cache`]: deferred binding state flushed before each draw or
 *   dispatch.
 * - [`context`]: the recording entry points built on all of the above.
 *
 * Everything is generic over a [`hal_api::HalApi`] backend.
 */

#![allow(
    // It is much clearer to assert negative conditions with eq! false
    clippy::bool_assert_comparison,
    // We don't use syntax sugar where it's not necessary.
    clippy::match_like_matches_macro,
    // Explicit lifetimes are often easier to reason about.
    clippy::needless_lifetimes,
    // Need many arguments for some core functions to be able to re-use code in many situations.
    clippy::too_many_arguments,
    // It gets in the way a lot and does not prevent bugs in practice.
    clippy::pattern_type_mismatch,
)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unsafe_op_in_unsafe_fn,
    unused_extern_crates,
    unused_qualifications
)]

pub mod command;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod fence;
pub mod hal_api;
mod hash_utils;
pub mod pipeline;
pub mod resource;
pub mod state_cache;
pub mod track;

pub use hal::{api, FenceValue, Label};

pub(crate) use hash_utils::*;

pub use config::Settings;
pub use device::{Device, DeviceError};

#[cfg(feature = "api_log_info")]
macro_rules! api_log {
    ($($arg:tt)+) => (log::info!($($arg)+))
}
#[cfg(not(feature = "api_log_info"))]
macro_rules! api_log {
    ($($arg:tt)+) => (log::trace!($($arg)+))
}
pub(crate) use api_log;

#[cfg(feature = "resource_log_info")]
macro_rules! resource_log {
    ($($arg:tt)+) => (log::info!($($arg)+))
}
#[cfg(not(feature = "resource_log_info"))]
macro_rules! resource_log {
    ($($arg:tt)+) => (log::trace!($($arg)+))
}
pub(crate) use resource_log;

/// Logs a violated invariant and panics.
///
/// Violations are programming errors in the caller, never runtime
/// conditions, so they are not reported through `Result`.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        log::error!($($arg)+);
        panic!($($arg)+)
    }};
}
pub(crate) use fatal;
