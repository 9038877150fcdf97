//! Local mapping: the background stage that maintains the map graph.
//!
//! Receives new keyframes from tracking over a bounded channel and keeps the
//! covisibility graph, spanning tree and place-recognition index current.

mod local_mapper;

pub use local_mapper::LocalMapper;
