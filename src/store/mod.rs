// SPDX-License-Identifier: MIT

//! Storage capabilities consumed by the engine.

pub mod kv;

pub use kv::{KvStore, MemoryKv, RedisKv};
