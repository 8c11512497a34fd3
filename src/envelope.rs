//! Wire-level message envelope: header contract and delivery metadata.
//!
//! The header names here are shared between the publisher, the consumer
//! engine, and every other service on the bus. Changing one is a wire
//! protocol change.

use std::collections::BTreeMap;

use chrono::Utc;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::BasicProperties;

/// Header carrying the event type discriminator for dispatch.
pub const EVENT_TYPE_HEADER: &str = "event-type";
/// Header carrying the schema evolution marker.
pub const EVENT_VERSION_HEADER: &str = "event-version";
/// Header counting redeliveries; absent on first delivery.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
/// W3C trace context parent header.
pub const TRACEPARENT_HEADER: &str = "traceparent";
/// W3C trace context state header.
pub const TRACESTATE_HEADER: &str = "tracestate";

/// Schema version stamped on every published event.
pub const EVENT_SCHEMA_VERSION: &str = "1.0";
/// Content type of serialized event bodies.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Persistent delivery mode (survives broker restart).
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Metadata extracted from an inbound delivery without touching the body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryMeta {
    /// Event type discriminator; `None` when the producer omitted it.
    pub event_type: Option<String>,
    /// Schema version tag.
    pub event_version: Option<String>,
    /// Correlation identifier for log correlation.
    pub correlation_id: Option<String>,
    /// Number of retries already attempted; zero on first delivery.
    pub retry_count: u32,
    /// W3C traceparent, when the producer had an active trace.
    pub traceparent: Option<String>,
    /// W3C tracestate accompanying the traceparent.
    pub tracestate: Option<String>,
}

/// Build the properties for a freshly published event.
///
/// Persistent delivery, JSON content type, producer timestamp, discriminator
/// and schema version headers. Trace context is injected from the current
/// span when the `otel` feature is enabled.
pub fn publish_properties(event_type: &str, correlation_id: &str) -> BasicProperties {
    let mut headers: BTreeMap<ShortString, AMQPValue> = BTreeMap::new();
    headers.insert(
        EVENT_TYPE_HEADER.into(),
        AMQPValue::LongString(event_type.into()),
    );
    headers.insert(
        EVENT_VERSION_HEADER.into(),
        AMQPValue::LongString(EVENT_SCHEMA_VERSION.into()),
    );

    #[cfg(feature = "otel")]
    inject_trace_context(&mut headers);

    BasicProperties::default()
        .with_content_type(CONTENT_TYPE_JSON.into())
        .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
        .with_correlation_id(correlation_id.into())
        .with_timestamp(Utc::now().timestamp() as u64)
        .with_headers(FieldTable::from(headers))
}

/// Extract delivery metadata from inbound message properties.
pub fn extract_meta(properties: &BasicProperties) -> DeliveryMeta {
    let headers = properties.headers().as_ref();

    DeliveryMeta {
        event_type: headers.and_then(|t| header_string(t, EVENT_TYPE_HEADER)),
        event_version: headers.and_then(|t| header_string(t, EVENT_VERSION_HEADER)),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|s| s.to_string()),
        retry_count: headers
            .and_then(|t| header_u32(t, RETRY_COUNT_HEADER))
            .unwrap_or(0),
        traceparent: headers.and_then(|t| header_string(t, TRACEPARENT_HEADER)),
        tracestate: headers.and_then(|t| header_string(t, TRACESTATE_HEADER)),
    }
}

/// Build properties for re-stamping a message back onto its queue with an
/// incremented retry counter.
///
/// The broker does not carry a mutated header across nack-with-requeue, so
/// the consumer engine republishes with these properties instead. Everything
/// except the retry counter is preserved from the original delivery.
pub fn stamp_retry(original: &BasicProperties, next_retry: u32) -> BasicProperties {
    let mut headers = original
        .headers()
        .as_ref()
        .map(|t| t.inner().clone())
        .unwrap_or_default();
    headers.insert(
        RETRY_COUNT_HEADER.into(),
        AMQPValue::LongInt(next_retry as i32),
    );

    let mut properties = BasicProperties::default()
        .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
        .with_headers(FieldTable::from(headers));

    if let Some(content_type) = original.content_type().clone() {
        properties = properties.with_content_type(content_type);
    }
    if let Some(correlation_id) = original.correlation_id().clone() {
        properties = properties.with_correlation_id(correlation_id);
    }
    if let Some(timestamp) = *original.timestamp() {
        properties = properties.with_timestamp(timestamp);
    }

    properties
}

/// Read a string-valued header.
fn header_string(table: &FieldTable, key: &str) -> Option<String> {
    table.inner().get(key).and_then(|value| match value {
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).map(str::to_owned).ok(),
        AMQPValue::ShortString(s) => Some(s.to_string()),
        _ => None,
    })
}

/// Read an integer-valued header, tolerating the width the producer chose.
fn header_u32(table: &FieldTable, key: &str) -> Option<u32> {
    table.inner().get(key).and_then(|value| match value {
        AMQPValue::ShortShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        _ => None,
    })
}

// ============================================================================
// OTel Trace Context Propagation
// ============================================================================

/// Inject W3C trace context from the current span into outbound headers.
#[cfg(feature = "otel")]
fn inject_trace_context(headers: &mut BTreeMap<ShortString, AMQPValue>) {
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let cx = tracing::Span::current().context();

    opentelemetry::global::get_text_map_propagator(|propagator| {
        struct MapInjector<'a>(&'a mut BTreeMap<ShortString, AMQPValue>);
        impl opentelemetry::propagation::Injector for MapInjector<'_> {
            fn set(&mut self, key: &str, value: String) {
                self.0
                    .insert(key.into(), AMQPValue::LongString(value.into()));
            }
        }
        propagator.inject_context(&cx, &mut MapInjector(headers));
    });
}

/// Extract W3C trace context from inbound properties and set it as the
/// parent of the consume span.
#[cfg(feature = "otel")]
pub fn set_span_parent(properties: &BasicProperties, span: &tracing::Span) {
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    if let Some(headers) = properties.headers() {
        let parent_cx = opentelemetry::global::get_text_map_propagator(|propagator| {
            struct FieldTableExtractor<'a>(&'a FieldTable);
            impl opentelemetry::propagation::Extractor for FieldTableExtractor<'_> {
                fn get(&self, key: &str) -> Option<&str> {
                    self.0.inner().get(key).and_then(|v| match v {
                        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok(),
                        _ => None,
                    })
                }
                fn keys(&self) -> Vec<&str> {
                    self.0.inner().keys().map(|k| k.as_str()).collect()
                }
            }
            propagator.extract(&FieldTableExtractor(headers))
        });
        span.set_parent(parent_cx);
    }
}
