//! Runtime glue shared by native (tokio) and browser (wasm) builds.

pub mod runtime;
