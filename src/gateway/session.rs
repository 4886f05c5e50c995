use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::types::SessionId;

/// Resumability state of one logical gateway session.
///
/// Created from the READY dispatch and replaced, never revived, once the
/// server invalidates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    session_id: SessionId,
    sequence: u64,
    suspended: bool,
    invalid: bool,
}

impl SessionRecord {
    pub(crate) fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            sequence: 0,
            suspended: false,
            invalid: false,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    pub fn should_resume(&self) -> bool {
        self.suspended && !self.invalid
    }

    /// Advances the sequence; older or equal values are ignored.
    pub(crate) fn observe_sequence(&mut self, sequence: u64) -> bool {
        if sequence > self.sequence {
            self.sequence = sequence;
            true
        } else {
            false
        }
    }

    pub(crate) fn suspend(&mut self) {
        self.suspended = true;
    }

    pub(crate) fn resume(&mut self) {
        self.suspended = false;
    }

    pub(crate) fn invalidate(&mut self) {
        self.invalid = true;
    }
}

/// Synchronized slot holding the current session, shared between the read
/// loop and the heartbeat loop.
#[derive(Clone, Default)]
pub struct SessionHandle(Arc<Mutex<Option<SessionRecord>>>);

impl SessionHandle {
    pub fn snapshot(&self) -> Option<SessionRecord> {
        self.0.lock().clone()
    }

    /// Sequence to acknowledge in a heartbeat; 0 before the first session.
    pub fn heartbeat_sequence(&self) -> u64 {
        self.0.lock().as_ref().map_or(0, SessionRecord::sequence)
    }

    pub fn is_suspended(&self) -> bool {
        self.0.lock().as_ref().is_some_and(SessionRecord::is_suspended)
    }

    pub(crate) fn replace(&self, record: SessionRecord) {
        *self.0.lock() = Some(record);
    }

    pub(crate) fn observe_sequence(&self, sequence: u64) {
        if let Some(record) = self.0.lock().as_mut() {
            record.observe_sequence(sequence);
        }
    }

    pub(crate) fn suspend(&self) {
        if let Some(record) = self.0.lock().as_mut() {
            record.suspend();
        }
    }

    /// Lets heartbeats flow again while a fresh IDENTIFY replaces a dead
    /// session.
    pub(crate) fn clear_suspension(&self) {
        if let Some(record) = self.0.lock().as_mut() {
            record.resume();
        }
    }

    /// Marks the session as not resumable. Returns false if none exists.
    pub(crate) fn invalidate(&self) -> bool {
        match self.0.lock().as_mut() {
            Some(record) => {
                record.invalidate();
                true
            }
            None => false,
        }
    }

    /// If the session should be resumed, un-suspends it and returns the
    /// id and sequence to put in the RESUME frame.
    pub(crate) fn take_resume(&self) -> Option<(SessionId, u64)> {
        let mut guard = self.0.lock();
        let record = guard.as_mut().filter(|r| r.should_resume())?;
        record.resume();
        Some((record.session_id.clone(), record.sequence))
    }
}
