//! cq-tools: Reference capabilities for colloquy
//!
//! - Calculate: evaluate arithmetic expressions
//! - Web: fetch and extract webpage text
//! - Generation: submit and poll long-running video jobs

pub mod calculator;
pub mod generation;
pub mod web;

use std::sync::Arc;

use cq_core::{Capability, CapabilityRegistry, Error};

pub use calculator::{evaluate, CalcError, Calculator};
pub use generation::{
    poll_until_terminal, GenerateVideo, GenerationBackend, GenerationRequest,
    HttpGenerationBackend, JobStatus, PollOutcome, PollPolicy,
};
pub use web::{extract_page_text, FetchWebpage};

/// Which reference capabilities to create.
#[derive(Clone, Default)]
pub struct ToolOptions {
    pub calculate: bool,
    pub web: bool,
    /// Backend for `generate_video`; the capability is skipped without one.
    pub video_backend: Option<Arc<dyn GenerationBackend>>,
    pub video_policy: PollPolicy,
}

/// Create the enabled capabilities.
pub fn create_capabilities(options: &ToolOptions) -> Vec<Arc<dyn Capability>> {
    let mut capabilities: Vec<Arc<dyn Capability>> = Vec::new();
    if options.calculate {
        capabilities.push(Arc::new(Calculator::new()));
    }
    if options.web {
        capabilities.push(Arc::new(FetchWebpage::new()));
    }
    if let Some(backend) = &options.video_backend {
        capabilities.push(Arc::new(
            GenerateVideo::new(backend.clone()).with_policy(options.video_policy),
        ));
    }
    capabilities
}

/// Register the enabled capabilities into `registry`.
pub fn register_capabilities(registry: &mut CapabilityRegistry, options: &ToolOptions) -> Result<(), Error> {
    for capability in create_capabilities(options) {
        registry.register(capability)?;
    }
    Ok(())
}
