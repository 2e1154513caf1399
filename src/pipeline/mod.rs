//! Per-job execution pipeline.
//!
//! One dequeued `CampaignJob` moves through seven ordered stages:
//!
//! 1. Execution validation (budget, call ceiling, allowed campaigns)
//! 2. Context retrieval (tenant + customer, fetched concurrently)
//! 3. Consent check
//! 4. Script selection and rendering
//! 5. Call placement
//! 6. Execution logging (best effort, success and failure alike)
//! 7. Analytics update (best effort, successful placements only)
//!
//! Stages 1-5 abort the pipeline by raising a structured
//! `PipelineError`; stages 6 and 7 never do.

pub mod executor;

pub use executor::{CampaignPipeline, ValidationOutcome};
