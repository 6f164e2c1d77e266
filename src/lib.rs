//! # Storybook Illustrator
//!
//! Generates the illustrations of a personalised children's storybook from
//! hosted image synthesis models, with bounded retries, a lower-fidelity
//! fallback model and decode verification of every downloaded image.

pub mod fetcher;
pub mod illustration_config;
pub mod illustration_errors;
pub mod illustration_model;
pub mod pipeline;
pub mod providers;
pub mod retry_policy;
pub mod storybook;
pub mod verifier;
