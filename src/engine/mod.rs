//! The native engine's C contract and the built-in reference engine.
//!
//! - [`abi`] — `#[repr(C)]` layouts and the function-pointer contract
//! - [`registry`] — method/model registry loaded from configuration
//! - [`native`] — reference engine exported under the contract's symbols
pub mod abi;
pub mod native;
pub mod registry;

pub use abi::{EngineContract, Modality};
