//! Shared traits.

/// One-line description of an engine or model, for logs and reports.
pub trait Summarizable {
    fn summary(&self) -> String;
}
