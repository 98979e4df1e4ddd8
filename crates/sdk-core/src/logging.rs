// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Replay-aware handler logging.
//!
//! Handler code runs again on every attempt, so its log statements would repeat for each
//! replayed operation. [`ReplayFilter`] is a per-layer filter dropping events emitted by handler
//! code while the invocation replays its journal. Events of the engine itself always pass.
//!
//! ```ignore
//! tracing_subscriber::registry()
//!     .with(tracing_subscriber::fmt::layer().with_filter(ReplayFilter))
//!     .init();
//! ```

use std::future::Future;
use std::sync::Arc;

use tracing::Metadata;
use tracing::subscriber::Interest;
use tracing_subscriber::layer;

use crate::invocation::InvocationCore;

const ENGINE_TARGETS: [&str; 2] = ["restate_sdk_core", "restate_sdk_protocol"];

tokio::task_local! {
    // Invocation whose handler is polled by the current task
    static INVOCATION: Arc<InvocationCore>;
}

/// Runs `future` with `core` as the current invocation.
pub(crate) async fn scope<F: Future>(core: Arc<InvocationCore>, future: F) -> F::Output {
    INVOCATION.scope(core, future).await
}

/// True when called from handler code of an invocation which is replaying its journal.
/// Outside of a handler it is always false.
pub fn is_replaying() -> bool {
    INVOCATION
        .try_with(|core| core.is_replaying())
        .unwrap_or(false)
}

/// Drops handler events while the invocation is replaying.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayFilter;

impl ReplayFilter {
    fn is_engine(metadata: &Metadata<'_>) -> bool {
        ENGINE_TARGETS
            .iter()
            .any(|target| metadata.target().starts_with(target))
    }
}

impl<S> layer::Filter<S> for ReplayFilter {
    fn enabled(&self, metadata: &Metadata<'_>, _cx: &layer::Context<'_, S>) -> bool {
        // Engine events are checked first: they may be emitted with the journal lock held.
        !metadata.is_event() || Self::is_engine(metadata) || !is_replaying()
    }

    fn callsite_enabled(&self, _metadata: &'static Metadata<'static>) -> Interest {
        // the answer changes during the attempt
        Interest::sometimes()
    }
}
