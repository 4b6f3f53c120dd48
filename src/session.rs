//! Thread session: the state owned by one mounted trip thread.
//!
//! Store, pending queue and read claims live behind a single lock so a poll
//! application (replace store + promote + reconcile reads) or a send
//! resolution (confirm + promote) is one step for every reader. The lock is
//! never held across an `.await`.

use crate::model::TripId;
use crate::pending::PendingQueue;
use crate::read_tracker::ReadTracker;
use crate::thread_store::Thread;
use parking_lot::Mutex;
use std::sync::Arc;

pub type SharedSession = Arc<Mutex<ThreadSession>>;

#[derive(Debug)]
pub struct ThreadSession {
    pub(crate) thread: Thread,
    pub(crate) pending: PendingQueue,
    pub(crate) reads: ReadTracker,
}

impl ThreadSession {
    pub fn new(trip_id: TripId) -> Self {
        Self {
            thread: Thread::new(trip_id),
            pending: PendingQueue::new(),
            reads: ReadTracker::new(),
        }
    }

    pub fn shared(trip_id: TripId) -> SharedSession {
        Arc::new(Mutex::new(Self::new(trip_id)))
    }
}
