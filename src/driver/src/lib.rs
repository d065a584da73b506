// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The driver of an Alchemist matrix-computation cluster.
//!
//! The driver mediates between one client and a pool of compute workers. It
//! reads requests from the client, tracks the matrices that exist in the
//! cluster in a [`registry::Registry`], broadcasts a
//! [`Command`](alchemist_protocol::command::Command) to every worker for each
//! request that needs them, and acknowledges the request only after all
//! workers have passed a barrier.
//!
//! The driver holds no state other than the registry and the worker pool, and
//! it never recovers from errors: any protocol or invariant violation ends the
//! session. See [`coordinator::serve`] for the entry point.

pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod pool;
pub mod registry;

pub use crate::coordinator::{Config, serve};
pub use crate::error::DriverError;
