//! A shared pool of repack datastreams. Worker threads check streams
//! out, append repacked files to them, and check them back in; the pool
//! grows on demand and seals everything at completion.

use std::sync::Mutex;

use crate::datastream::DataStream;
use crate::error::Error;

const INITIAL_STREAMS: usize = 10;

/// Checkout token, returned to the pool together with the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSlot(usize);

#[derive(Default)]
struct PoolState {
    streams: Vec<Option<DataStream>>,
    checked_out: Vec<bool>,
}

/// The pool itself. Shared by reference between consumer threads.
pub struct RepackStreamer {
    state: Mutex<PoolState>,
}

impl Default for RepackStreamer {
    fn default() -> Self {
        Self::new()
    }
}

impl RepackStreamer {
    pub fn new() -> Self {
        let mut state = PoolState::default();
        state.streams.resize_with(INITIAL_STREAMS, || None);
        state.checked_out.resize(INITIAL_STREAMS, false);
        RepackStreamer {
            state: Mutex::new(state),
        }
    }

    /// Check out a stream slot. The contained stream may be `None` (a
    /// fresh slot) or a live CREATE stream left by a previous user.
    pub fn checkout(&self) -> (StreamSlot, Option<DataStream>) {
        let mut state = self.state.lock().unwrap();
        for idx in 0..state.streams.len() {
            if !state.checked_out[idx] {
                state.checked_out[idx] = true;
                let stream = state.streams[idx].take();
                return (StreamSlot(idx), stream);
            }
        }
        // every slot is busy: grow the pool
        let idx = state.streams.len();
        log::debug!("Expanding repack stream pool to {} slots", idx + 1);
        state.streams.push(None);
        state.checked_out.push(true);
        (StreamSlot(idx), None)
    }

    /// Return a previously checked-out slot.
    pub fn checkin(&self, slot: StreamSlot, stream: Option<DataStream>) {
        let mut state = self.state.lock().unwrap();
        state.streams[slot.0] = stream;
        state.checked_out[slot.0] = false;
    }

    /// Seal every pooled stream. Fails if any slot is still checked out
    /// or any stream fails to finalize.
    pub fn complete(self) -> crate::Result<()> {
        let mut state = self.state.into_inner().unwrap();
        if state.checked_out.iter().any(|c| *c) {
            return Err(Error::inval("repack streams are still checked out"));
        }
        let mut result = Ok(());
        for stream in state.streams.drain(..).flatten() {
            if let Err(e) = stream.close() {
                log::error!("Failed to finalize a repack stream: {}", e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Drop every pooled stream without finalizing.
    pub fn abort(self) {
        let mut state = self.state.into_inner().unwrap();
        for stream in state.streams.drain(..).flatten() {
            if let Err(e) = stream.release() {
                log::warn!("Failed to release a repack stream: {}", e);
            }
        }
    }
}
