//! # gembed — Native Memory Bridge & Embedding Exchange
//!
//! Lets a managed-runtime host hand byte and string buffers to a native
//! embedding engine and read back batches of `f32` vectors, without the host
//! ever touching raw pointers. Memory crosses the boundary as opaque handles.
//!
//! ## Architecture
//!
//! - **[`memory`]** — Handle arena: allocate, free, copy-in, integer and float reads
//! - **[`engine`]** — C contract of the embedding engine plus a reference implementation
//! - **[`embedder`]** — Deterministic embedding backends used by the reference engine
//! - **[`adapter`]** — Marshals host payloads into engine calls and registers batches
//! - **[`client`]** — Host-side wrapper with scoped cleanup of inputs and batches
//! - **[`ffi`]** — `extern "C"` exports consumed by the host
//! - **[`config`]** — JSON configuration loading and validation
//! - **[`error`]** — Bridge errors and the status codes returned across the ABI
//! - **[`logging`]** — `tracing` subscriber setup

pub mod adapter;
pub mod client;
pub mod config;
pub mod embedder;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod logging;
pub mod memory;
