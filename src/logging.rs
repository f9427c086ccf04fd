// macros only; no direct imports needed

#[macro_export]
macro_rules! routine_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::info!(service = %$ctx.service(), intent_id = %$ctx.intent_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! routine_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::warn!(service = %$ctx.service(), intent_id = %$ctx.intent_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! routine_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::debug!(service = %$ctx.service(), intent_id = %$ctx.intent_id(), $($arg)+);
        }
    }};
}
