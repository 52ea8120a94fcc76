//! Animation wire formats
//!
//! Two serializations of the same exported motion:
//! - [`anim`] - the compact quantized binary clip format (`.anim`)
//! - [`bvh`] - the hierarchical text format (BVH)
//!
//! Both are written with explicit little-endian/ASCII byte emission; no
//! magic bytes, the consumer knows the format from context.

pub mod anim;
pub mod bvh;
