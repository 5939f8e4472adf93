//! Minimal BGP wire and MRT representations.
//!
//! The BGP wire codec, capability negotiation, and the BGP4MP/MRT codec are
//! treated as an external boundary the pipeline core merely depends on. These
//! modules model only the header/framing shape Extio needs to drive the
//! pipeline (message type, length, minimal body, capability bits), and
//! deliberately do not implement full attribute parsing, route selection,
//! or every MRT subtype. Kept intentionally thin rather than faked out with
//! a fuller codec this crate doesn't need.

pub mod mrt;
pub mod wire;
