//! `tracing` integration: spans become zones, events become messages.

mod layer;
mod tests;
mod visitor;

pub use layer::StreamtraceLayer;
