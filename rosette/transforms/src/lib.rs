#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Coordinate-frame transform graph.

/// Frame graph with time-bounded direct and reverse lookups.
pub mod graph;
/// Quaternion and affine transform math.
pub mod transform;

pub use graph::{StampedTransform, TransformError, TransformGraph, DEFAULT_VALIDITY_WINDOW_MS};
pub use transform::{Quaternion, Transform, Vector3, IDENTITY_ROTATION};
