use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state shared by the send path, the receive path and the
/// overall release cycle of a `ClientCommController`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    New = 0,
    Started = 1,
    /// The owning task's loop has exited
    Finished = 2,
    /// A stop request is in force
    Stopped = 3,
}

impl ConnectionState {
    /// Resolves a transition request against the legality table.
    ///
    /// Legal moves are NEW→STARTED, STARTED→FINISHED, STOPPED→FINISHED and
    /// FINISHED→NEW. Moving to STOPPED is always allowed and sticky. Any
    /// other request leaves the state unchanged.
    pub fn next(self, requested: ConnectionState) -> ConnectionState {
        use ConnectionState::*;
        match (self, requested) {
            (_, Stopped) => Stopped,
            (New, Started) | (Started, Finished) | (Stopped, Finished) | (Finished, New) => {
                requested
            }
            _ => self,
        }
    }

    fn from_u8(v: u8) -> ConnectionState {
        match v {
            0 => ConnectionState::New,
            1 => ConnectionState::Started,
            2 => ConnectionState::Finished,
            _ => ConnectionState::Stopped,
        }
    }
}

/// Lock-free cell holding one `ConnectionState`.
#[derive(Debug)]
pub struct AtomicConnectionState {
    cell: AtomicU8,
    #[cfg(test)]
    history: std::sync::Mutex<Vec<ConnectionState>>,
}

impl AtomicConnectionState {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            cell: AtomicU8::new(state as u8),
            #[cfg(test)]
            history: std::sync::Mutex::new(vec![state]),
        }
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.cell.load(Ordering::SeqCst))
    }

    /// Applies a transition request atomically; returns `(previous, current)`.
    pub fn transition(&self, requested: ConnectionState) -> (ConnectionState, ConnectionState) {
        let previous = match self.cell.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
            Some(ConnectionState::from_u8(cur).next(requested) as u8)
        }) {
            Ok(v) | Err(v) => ConnectionState::from_u8(v),
        };
        let current = previous.next(requested);
        if current != previous {
            self.record(current);
        }
        (previous, current)
    }

    #[cfg(test)]
    fn record(&self, state: ConnectionState) {
        super::lock(&self.history).push(state);
    }

    #[cfg(not(test))]
    fn record(&self, _state: ConnectionState) {}

    /// Every state this cell has held, oldest first.
    #[cfg(test)]
    pub(crate) fn history(&self) -> Vec<ConnectionState> {
        super::lock(&self.history).clone()
    }
}
