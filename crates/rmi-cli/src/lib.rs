// SPDX-License-Identifier: MIT OR Apache-2.0
//! Library surface for the `rmi` operator CLI, split out from `main.rs` so
//! it can be exercised directly from integration tests.

pub mod commands;
pub mod config;
pub mod format;
