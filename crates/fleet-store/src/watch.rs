use tokio::sync::broadcast::{self, error::RecvError};

use crate::{Event, EventKind, StoreError};

/// Filtered, ordered subscription to store events.
///
/// Ends when dropped or [`cancel`](Self::cancel)led.
pub struct Watch {
    rx: broadcast::Receiver<Event>,
    kinds: Vec<EventKind>,
}

impl Watch {
    pub(crate) fn new(rx: broadcast::Receiver<Event>, kinds: &[EventKind]) -> Self {
        Self {
            rx,
            kinds: kinds.to_vec(),
        }
    }

    fn matches(&self, ev: &Event) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&ev.kind())
    }

    /// Waits for the next matching event.
    ///
    /// A watch that fell behind the ring buffer cannot be trusted to reflect the store and
    /// returns [`StoreError::WatchLagged`].
    pub async fn recv(&mut self) -> Result<Event, StoreError> {
        loop {
            match self.rx.recv().await {
                Ok(ev) if self.matches(&ev) => return Ok(ev),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => return Err(StoreError::WatchLagged(n)),
                Err(RecvError::Closed) => return Err(StoreError::Closed),
            }
        }
    }

    /// Returns the next matching event if one is already buffered.
    pub fn try_recv(&mut self) -> Result<Option<Event>, StoreError> {
        use broadcast::error::TryRecvError;
        loop {
            match self.rx.try_recv() {
                Ok(ev) if self.matches(&ev) => return Ok(Some(ev)),
                Ok(_) => continue,
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Lagged(n)) => return Err(StoreError::WatchLagged(n)),
                Err(TryRecvError::Closed) => return Err(StoreError::Closed),
            }
        }
    }

    /// Ends the subscription.
    pub fn cancel(self) {}
}
