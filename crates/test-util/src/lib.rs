// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Useful test utilities for Restate crates. Import them with:
//!
//! ```rust
//! use restate_test_util::{assert, assert_eq, assert_ne, let_assert};
//! ```
//!
//! Note: You cannot import them with a glob import, as the compiler won't be able to distinguish our imports and the stdlib imports.

// A couple of useful re-exports
pub use assert2::{assert, let_assert};
pub use pretty_assertions::{assert_eq, assert_ne};

pub mod mock;
