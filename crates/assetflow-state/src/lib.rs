//! Cursor persistence for assetflow sensors.
//!
//! Provides the [`CursorStore`] trait and a [`SqliteCursorStore`]
//! implementation for per-(sensor, partition) cursors, run-key claims and
//! asset run history.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod sqlite;

pub use backend::CursorStore;
pub use error::StateError;
pub use sqlite::SqliteCursorStore;
