//! Trace and service signatures.
//!
//! A signature identifies the "shape" of a trace for scoring: two traces going through the same services and
//! operations, with the same root resource and the same error states, share a signature.

use std::fmt;

use basenji_core::{Span, Trace};

const OFFSET_32: u32 = 0x811c_9dc5;
const PRIME_32: u32 = 0x0100_0193;

fn write_hash(mut hash: u32, bytes: &[u8]) -> u32 {
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(PRIME_32);
    }
    hash
}

/// Hash identifying a trace (or service) shape.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Signature(pub u64);

/// Computes the signature of a trace.
///
/// The root span contributes its resource on top of the `(env, service, name, error)` tuple every span contributes.
/// Span hashes are deduplicated before being combined, so repeating a sub-call does not change the signature.
pub fn compute_signature_with_root_and_env(trace: &Trace, root_idx: usize, env: &str) -> Signature {
    let spans = trace.spans();
    let Some(root) = spans.get(root_idx) else {
        return Signature(0);
    };

    let root_hash = compute_span_hash(root, env, true);
    let mut span_hashes: Vec<u32> = spans.iter().map(|span| compute_span_hash(span, env, false)).collect();
    span_hashes.sort_unstable();
    span_hashes.dedup();

    let trace_hash = span_hashes.iter().fold(root_hash, |acc, h| acc ^ h);
    Signature(trace_hash as u64)
}

fn compute_span_hash(span: &Span, env: &str, with_resource: bool) -> u32 {
    let mut h = OFFSET_32;
    h = write_hash(h, env.as_bytes());
    h = write_hash(h, span.service().as_bytes());
    h = write_hash(h, span.name().as_bytes());
    h = write_hash(h, &[span.is_error() as u8]);
    if with_resource {
        h = write_hash(h, span.resource().as_bytes());
    }
    h
}

/// Coarse signature made of the root service and the trace environment.
///
/// Used by the priority engine: tracers decide client-side per `(service, env)`, so that is the granularity the
/// agent feeds rates back at.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ServiceSignature {
    service: String,
    env: String,
}

impl ServiceSignature {
    /// Creates a new `ServiceSignature`.
    pub fn new(service: impl Into<String>, env: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            env: env.into(),
        }
    }

    /// Returns the hashed signature.
    pub fn hash(&self) -> Signature {
        let mut h = write_hash(OFFSET_32, self.service.as_bytes());
        h = write_hash(h, self.env.as_bytes());
        Signature(h as u64)
    }
}

impl fmt::Display for ServiceSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service:{},env:{}", self.service, self.env)
    }
}
