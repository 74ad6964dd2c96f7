//! Session-prefixed logging.
//!
//! Monitoring runs on tokio tasks that hop between worker threads, so the session id is passed
//! explicitly instead of being kept in a thread local.

#[macro_export]
macro_rules! session_debug {
    ($id: expr, $t: tt $(, $arg:expr)* $(,)?) => (
        ::log::debug!(std::concat!("session-{}: ", $t), $id $(, $arg)*)
    )
}

#[macro_export]
macro_rules! session_info {
    ($id: expr, $t: tt $(, $arg:expr)* $(,)?) => (
        ::log::info!(std::concat!("session-{}: ", $t), $id $(, $arg)*)
    )
}

#[macro_export]
macro_rules! session_warn {
    ($id: expr, $t: tt $(, $arg:expr)* $(,)?) => (
        ::log::warn!(std::concat!("session-{}: ", $t), $id $(, $arg)*)
    )
}
