//! NVIDIA device discovery for the render pipeline.

pub mod collector;
