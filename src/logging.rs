//! Helper macros enforcing consistent queue log fields.
//!
//! These macros keep the `queue` field (and optionally `delivery_tag`) present on every log
//! emitted from the broker and consumer layers so downstream parsing can rely on them.

/// Log an event for a queue, optionally scoped to a single delivery, plus any extra fields.
#[macro_export]
macro_rules! queue_event {
    ($level:ident, $target:expr, $event:expr, queue = $queue:expr, delivery_tag = $tag:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target: $target,
            event = $event,
            queue = %$queue,
            delivery_tag = $tag,
            $($field = %$value,)*
        )
    };
    ($level:ident, $target:expr, $event:expr, queue = $queue:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target: $target,
            event = $event,
            queue = %$queue,
            $($field = %$value,)*
        )
    };
}
