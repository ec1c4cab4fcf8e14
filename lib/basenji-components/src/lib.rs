//! Trace agent components.
//!
//! Every stage of the pipeline lives here: normalization and filtering of inbound traces, obfuscation, the stats
//! concentrator, the trace samplers, the pre-sampler and its watchdog, service metadata tracking, and the writers
//! submitting payloads to the intake.

#![deny(warnings)]
#![deny(missing_docs)]

pub mod concentrator;
pub mod filters;
pub mod normalizer;
pub mod obfuscation;
pub mod presampler;
pub mod sampler;
pub mod services;
pub mod sublayers;
pub mod watchdog;
pub mod writer;
