//! Output helpers: trajectory text export.

pub mod trajectory;
