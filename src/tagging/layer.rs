// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A [`tracing_subscriber::Layer`] that links tracing spans to profiling
//! samples: while a span is entered on a thread, that thread carries a
//! [`SPAN_ID_LABEL`] label holding the span id.

use tracing::{span, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::labels;

/// Label key under which the id of the entered span is recorded.
pub const SPAN_ID_LABEL: &str = "span_id";

#[derive(Debug, Default, Clone, Copy)]
pub struct ProfilingLayer;

impl ProfilingLayer {
    pub fn new() -> Self {
        ProfilingLayer
    }
}

fn format_span_id(id: &span::Id) -> String {
    format!("{:016x}", id.into_u64())
}

impl<S: Subscriber> Layer<S> for ProfilingLayer {
    fn on_enter(&self, id: &span::Id, _ctx: Context<'_, S>) {
        labels::push(SPAN_ID_LABEL, &format_span_id(id));
    }

    fn on_exit(&self, _id: &span::Id, _ctx: Context<'_, S>) {
        labels::pop_scoped(SPAN_ID_LABEL);
    }
}
