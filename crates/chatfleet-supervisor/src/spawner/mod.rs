// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker process spawners.
//!
//! The [`WorkerSpawner`] trait abstracts over how worker processes are
//! launched and signaled. [`process::ProcessSpawner`] runs real OS
//! processes; [`mock::MockSpawner`] simulates them for tests.

pub mod mock;
pub mod process;
pub mod traits;

pub use mock::MockSpawner;
pub use process::ProcessSpawner;
pub use traits::{ChildEvent, SpawnError, SpawnOptions, WorkerHandle, WorkerSpawner};
