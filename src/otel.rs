// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! This module propagates trace context through message headers. Publishers
//! inject the current context into the outgoing header table and consumers
//! extract it to start a consumer span around every delivery.

use crate::broker::{HeaderTable, HeaderValue};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;

/// Writes trace context entries into a header table.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut HeaderTable,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut HeaderTable) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(key.to_lowercase(), HeaderValue::String(value));
    }
}

/// Reads trace context entries from a header table.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a HeaderTable,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a HeaderTable) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(HeaderValue::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Injects the current trace context into `headers`.
pub(crate) fn inject_context(headers: &mut HeaderTable) {
    let ctx = Context::current();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut HeaderInjector::new(headers))
    });
}

/// Tracer used for consumer spans.
pub(crate) fn consumer_tracer() -> BoxedTracer {
    global::tracer("amqp consumer")
}

/// Creates a consumer span for a delivery, parented to the context carried
/// by its headers.
pub(crate) fn new_span(headers: &HeaderTable, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
