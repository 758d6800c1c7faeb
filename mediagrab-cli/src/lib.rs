//! Library target for the `mediagrab` package.
//!
//! The primary deliverable of this package is the `mediagrab` CLI binary
//! (`src/main.rs`). This library exists so CI can run `cargo test -p mediagrab --doc`
//! for feature/doctype validation.

#[doc(hidden)]
pub use mediagrab_engine;
