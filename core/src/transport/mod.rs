//! The contract between the dispatcher and a network backend.
//!
//! # Design
//! A transport starts one exchange per `execute` call and reports progress
//! through an `EventSink`: at most one `Head`, any number of `Data` chunks,
//! then exactly one terminal `End` or `Failed`. Events travel over a channel
//! to the thread that owns the `Client`, which turns them into callbacks.
//!
//! The sink, not the backend, enforces the delivery rules: after a terminal
//! event or a cancellation it drops everything, so a backend that keeps
//! reading after being cancelled can never reach a callback.
//!
//! Built-in backends follow redirects (up to `MAX_REDIRECTS` hops) and only
//! report the final response.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::error::FetchError;
use crate::http::{HttpRequest, ResponseHead};

pub mod socket;
pub mod subprocess;

pub use socket::SocketTransport;
pub use subprocess::CurlTransport;

/// Redirect hops a built-in backend follows before reporting the last `3xx`.
pub const MAX_REDIRECTS: u32 = 10;

/// Identifies one attempt of one call.
pub type ExchangeId = u64;

/// Progress of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Head(ResponseHead),
    Data(Vec<u8>),
    End,
    Failed(FetchError),
}

impl TransportEvent {
    fn is_terminal(&self) -> bool {
        matches!(self, TransportEvent::End | TransportEvent::Failed(_))
    }
}

/// Per-exchange settings passed to `Transport::execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExchangeOptions {
    pub timeout: Option<Duration>,
    /// The caller is blocked in a synchronous wait for this exchange.
    pub sync: bool,
}

/// Channel endpoint a transport reports one exchange through.
#[derive(Debug, Clone)]
pub struct EventSink {
    id: ExchangeId,
    tx: Sender<(ExchangeId, TransportEvent)>,
    closed: Arc<AtomicBool>,
}

impl EventSink {
    pub fn new(id: ExchangeId, tx: Sender<(ExchangeId, TransportEvent)>) -> Self {
        Self {
            id,
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> ExchangeId {
        self.id
    }

    /// Deliver `event`. Returns `false` once the exchange is closed, which
    /// tells the backend to stop producing.
    pub fn emit(&self, event: TransportEvent) -> bool {
        if event.is_terminal() {
            if self.closed.swap(true, Ordering::AcqRel) {
                return false;
            }
        } else if self.is_closed() {
            return false;
        }
        self.tx.send((self.id, event)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop delivery without a terminal event.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// A backend able to perform HTTP exchanges.
pub trait Transport: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Fails with `TransportUnavailable` when prerequisites are missing.
    fn check_available(&self) -> Result<(), FetchError> {
        Ok(())
    }

    /// Start an exchange. Progress is reported through `sink`; the returned
    /// handle lets the dispatcher cancel it or check that it is still running.
    fn execute(
        &self,
        request: &HttpRequest,
        options: &ExchangeOptions,
        sink: EventSink,
    ) -> Result<Box<dyn InFlight>, FetchError>;
}

/// A running exchange.
pub trait InFlight: Send + fmt::Debug {
    /// Abort the exchange. No event is delivered afterwards.
    fn cancel(&self);

    /// Whether the backend may still deliver events.
    fn is_alive(&self) -> bool;
}
