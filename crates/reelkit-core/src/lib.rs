// crates/reelkit-core/src/lib.rs
//
// Pure data for the reelkit playback toolkit: time algebra, sequence
// paths, the EDL model, observables, and the shared error type. No I/O —
// that lives in reelkit-media and reelkit-timeline.

pub mod edl;
pub mod error;
pub mod path;
pub mod range;
pub mod signal;
pub mod time;

pub use error::IoError;
pub use path::SeqPath;
pub use range::TimeRange;
pub use signal::{Signal, SignalToken};
pub use time::{time_equals, RationalTime};
