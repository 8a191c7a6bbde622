//! Provider collaborators.
//!
//! Concrete vendor clients live outside this crate. They implement
//! [`Provider`] and are registered in a [`ProviderSet`], whose terminal
//! dispatches each call to the provider named in the call's context.

pub mod set;
pub mod traits;

pub use set::{ProviderSet, ProviderTerminal};
pub use traits::{CacheKey, Provider};
