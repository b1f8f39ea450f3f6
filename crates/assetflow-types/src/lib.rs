//! Shared assetflow data model.
//!
//! Pure types used by the state, engine and CLI crates: discovered
//! [`item::SourceItem`]s, cursor values, run requests and the structured
//! connector error model. Kept free of I/O so every layer can depend on it.

#![warn(clippy::pedantic)]

pub mod cursor;
pub mod error;
pub mod item;
pub mod run;
pub mod state;
