// Replay-aware logging for coordinator code. Lines are dropped while the
// coordinator is re-reading recorded history so a resumed instance does not
// log its already-finished steps a second time.

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::info!(instance_id = %$ctx.instance_id(), step = $ctx.step(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::warn!(instance_id = %$ctx.instance_id(), step = $ctx.step(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::error!(instance_id = %$ctx.instance_id(), step = $ctx.step(), $($arg)+);
        }
    }};
}
