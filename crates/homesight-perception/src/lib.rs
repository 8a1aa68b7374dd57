//! `homesight-perception` – from camera stream to scene description.
//!
//! # Modules
//!
//! - [`sampler`] – [`FrameSampler`][sampler::FrameSampler]: reads a camera
//!   stream, keeps only the freshest frame, emits at most one
//!   [`FrameSample`][homesight_types::FrameSample] per sampling period and
//!   tracks stream sub-epochs across reconnects.
//! - [`fingerprint`] – perceptual 64-bit gradient hash used to spot
//!   near-identical consecutive frames.
//! - [`parse`] – tolerant extraction of JSON from model replies.
//! - [`stage`] – [`PerceptionStage`][stage::PerceptionStage]: one vision
//!   call per sample through the inference gateway, with reuse of the
//!   previous scene for near-identical frames.

pub mod fingerprint;
pub mod parse;
pub mod sampler;
pub mod stage;

pub use fingerprint::Fingerprint;
pub use sampler::{FrameSampler, SamplerCore, SamplerEvent, SamplingPolicy};
pub use stage::{PerceptionConfig, PerceptionOutcome, PerceptionStage};
