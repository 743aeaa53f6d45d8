//! Client for the generative text API used by the analysis pipeline.

mod client;
mod types;

pub use client::GenerationClient;
pub use types::*;
