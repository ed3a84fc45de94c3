pub mod correlator;
pub mod reader;

pub use correlator::{RfidCorrelator, RfidDetect, RfidMatch};
pub use reader::spawn_reader;

use catcierge_vision::Direction;

/// Which side of the door a reader sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderSide {
    Inner,
    Outer,
}

impl ReaderSide {
    pub fn name(&self) -> &'static str {
        match self {
            ReaderSide::Inner => "Inner",
            ReaderSide::Outer => "Outer",
        }
    }

    /// The travel direction implied by this side triggering second: the
    /// animal moved from the other reader toward this one.
    pub fn direction(&self) -> Direction {
        match self {
            ReaderSide::Inner => Direction::In,
            ReaderSide::Outer => Direction::Out,
        }
    }
}

/// One framed read off a serial reader, delivered to the main loop.
#[derive(Debug, Clone)]
pub struct TagRead {
    pub side: ReaderSide,
    pub complete: bool,
    pub data: String,
}
