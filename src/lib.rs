//! fhir-forge library crate
//!
//! A generate-validate-execute-inspect-repair engine: an LLM oracle writes
//! Python that produces FHIR R4B records, the engine statically validates it
//! against a safety policy, normalizes known model hallucinations, runs it in
//! an isolated subprocess, inspects the output, and feeds failures back to the
//! oracle for a bounded number of repair attempts.

pub mod candidate;
pub mod config;
pub mod inspect;
pub mod normalize;
pub mod oracle;
pub mod policy;
pub mod quality;
pub mod runner;
pub mod schema;
pub mod session;
pub mod writers;
