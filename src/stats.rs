

//! A side-channel for runtime counters.
//!
//! The supervisor process can implement this trait to collect live
//! metrics about the sessions of a worker; the core only reports.

/// Receives notifications about session activity.
/// All methods default to doing nothing.
pub trait SessionStats {

    /// A channel was opened for an image.
    fn channel_opened(&self, _channel: &str, _target: &str) {}

    /// A channel was closed, deliberately or by a dying connection.
    fn channel_closed(&self, _channel: &str) {}

    /// One response chunk was handed to the transport.
    fn chunk_generated(&self, _bytes: usize) {}

    /// One response was completed.
    fn response_completed(&self, _total_bytes: u64) {}
}


/// Discards all notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStats;

impl SessionStats for NullStats {}
