//! llmfn call recorder.
//!
//! Records every request and response exchanged with a model backend as a
//! tree: a [`CallRecord`] holds messages, and a tool result message holds the
//! nested calls made while the tool ran. Observers registered with
//! [`CallRecorder::notify`] receive a deep copy of all top-level calls after
//! every change, including calls still in flight.

pub mod record;
pub mod recorder;

pub use record::{CallRecord, RecordedMessage};
pub use recorder::{CallHandle, CallRecorder, MessageHandle, RecorderScope};
