//! Public types for the Palisade API.

mod context;
mod generate;

pub use context::{CancelSignal, OperationContext, OperationKind};
pub use generate::{FallbackMetadata, GenerateOptions, GenerateRequest, GenerateResponse};
