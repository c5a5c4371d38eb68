//! Admission control: caps how many requests are in flight at once.
//!
//! Requests beyond the cap wait in a FIFO queue and are handed a slot as soon
//! as a running request finishes. When the queue is full they are rejected.

mod request_limit;

pub use request_limit::{AdmissionError, AdmissionPermit, RequestLimit};
