//! answerbank: versioned embedding storage and category-scoped retrieval
//! for support-triage knowledge bases.
//!
//! The crate is organized around three flows:
//! - `migrate`: diff the knowledge base against stored content hashes, embed
//!   what changed through a retrying provider client, and commit in batches
//! - `query`: load the current version into a [`cache::VectorCache`] and rank
//!   candidates in a category with [`rank::Ranker`]
//! - maintenance: integrity validation, version listing and cleanup

pub mod cache;
pub mod codec;
pub mod commands;
pub mod config;
pub mod embed;
pub mod error;
pub mod hash;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod rank;
pub mod source;
pub mod store;
pub mod version;
