//! Caller-supplied callback shapes and the guard that runs them.
//!
//! Callbacks run on the thread that drives the `Client`, so none of them
//! need to be `Send`. Every invocation goes through `guarded`, which turns a
//! panic into an error message instead of unwinding through the dispatcher.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::FetchError;
use crate::http::{HttpResponse, ResponseHead};
use crate::types::{Payload, Reply};

/// Error type callbacks may return to reject a reply or a chunk.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Success callback. An `Err` reroutes the call into the failure path.
pub type DoneCallback = Box<dyn FnOnce(&Reply) -> Result<(), CallbackError>>;

/// Failure callback.
pub type FailCallback = Box<dyn FnOnce(&FetchError)>;

/// Runs once after the done or fail callback.
pub type FinallyCallback = Box<dyn FnOnce()>;

/// Invoked for every chunk of body bytes as it arrives. An `Err` aborts the
/// exchange.
pub type StreamFilter = Box<dyn FnMut(&StreamChunk<'_>) -> Result<(), CallbackError>>;

/// Custom response decoder, replacing content-type inference.
pub type Decoder = Box<dyn Fn(&HttpResponse) -> Result<Payload, FetchError>>;

/// Newly arrived response data passed to a `StreamFilter`.
#[derive(Debug)]
pub struct StreamChunk<'a> {
    pub head: &'a ResponseHead,
    /// Bytes that arrived since the previous chunk.
    pub data: &'a [u8],
    /// Body bytes received so far, including `data`.
    pub received: usize,
}

/// The callbacks of one logical call. Each is taken at most once.
#[derive(Default)]
pub(crate) struct Hooks {
    pub done: Option<DoneCallback>,
    pub fail: Option<FailCallback>,
    pub finally: Option<FinallyCallback>,
    pub filter: Option<StreamFilter>,
    pub decoder: Option<Decoder>,
}

/// Run `f`, converting a panic into its message.
pub(crate) fn guarded<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "callback panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_passes_through_values() {
        assert_eq!(guarded(|| 7), Ok(7));
    }

    #[test]
    fn guarded_captures_panic_messages() {
        assert_eq!(guarded(|| panic!("static message")), Err::<(), _>("static message".to_string()));
        let n = 3;
        assert_eq!(guarded(|| panic!("formatted {n}")), Err::<(), _>("formatted 3".to_string()));
    }
}
