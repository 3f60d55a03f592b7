//! Integration test entry point for crc-node.
//!
//! Run with: cargo test --test integration

mod chat;
mod lifecycle;
