// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Protocols spoken by the Alchemist driver.
//!
//! The driver sits between two kinds of peers, and this crate holds the wire
//! formats for both:
//!
//!  * The **client protocol** ([`codec`], [`command::Opcode`]): a
//!    request/response protocol of big-endian integers and length-prefixed
//!    strings, spoken with a single client over a byte stream.
//!  * The **worker transport** ([`transport`]): framed, bincode-encoded
//!    messages carrying [`command::Command`]s from the driver to every worker
//!    and barrier arrivals from the workers back to the driver.

pub mod codec;
pub mod command;
pub mod transport;
