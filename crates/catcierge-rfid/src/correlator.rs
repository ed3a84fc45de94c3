use catcierge_vision::Direction;
use tracing::{debug, info};

use crate::{ReaderSide, TagRead};

/// Last known tag state for one side of the door.
#[derive(Debug, Clone, Default)]
pub struct RfidMatch {
    pub triggered: bool,
    pub complete: bool,
    pub data: String,
    pub is_allowed: bool,
}

/// Snapshot handed to the `rfid_detect` event when a side triggers.
#[derive(Debug, Clone)]
pub struct RfidDetect {
    pub side: ReaderSide,
    pub data: String,
    pub complete: bool,
    pub is_allowed: bool,
    pub other_triggered: bool,
    pub direction: Direction,
}

/// Pairs the two asynchronous tag streams into one directional verdict.
pub struct RfidCorrelator {
    in_match: RfidMatch,
    out_match: RfidMatch,
    direction: Direction,
    allowed: Vec<String>,
}

impl RfidCorrelator {
    pub fn new(allowed: Vec<String>) -> Self {
        Self {
            in_match: RfidMatch::default(),
            out_match: RfidMatch::default(),
            direction: Direction::Unknown,
            allowed,
        }
    }

    /// Clear both sides, ready for the next passage.
    pub fn reset(&mut self) {
        self.in_match = RfidMatch::default();
        self.out_match = RfidMatch::default();
        self.direction = Direction::Unknown;
    }

    pub fn in_match(&self) -> &RfidMatch {
        &self.in_match
    }

    pub fn out_match(&self) -> &RfidMatch {
        &self.out_match
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn set_unknown_direction(&mut self) {
        self.direction = Direction::Unknown;
    }

    fn allowed(&self, tag: &str) -> bool {
        self.allowed.iter().any(|t| t == tag)
    }

    /// Feed one framed read in. Returns the detect snapshot when this read
    /// triggers its side; `None` when the side had already triggered (a
    /// longer complete read still supersedes the stored data in that case).
    pub fn handle(&mut self, read: &TagRead) -> Option<RfidDetect> {
        let is_allowed = self.allowed(&read.data);
        let (current, other) = match read.side {
            ReaderSide::Inner => (&mut self.in_match, &self.out_match),
            ReaderSide::Outer => (&mut self.out_match, &self.in_match),
        };

        debug!(
            "{} RFID: {}{} (stored {} bytes, incoming {} bytes)",
            read.side.name(),
            read.data,
            if read.complete { "" } else { " (incomplete)" },
            current.data.len(),
            read.data.len()
        );

        // A late complete read longer than what this side holds supersedes
        // an earlier truncation.
        if read.complete && read.data.len() > current.data.len() {
            current.data = read.data.clone();
            current.complete = true;
        }

        // First read wins for triggering.
        if current.triggered {
            debug!("{} RFID: already triggered", read.side.name());
            return None;
        }

        // The other side triggered first, so the travel direction is known:
        // from there toward here.
        let other_triggered = other.triggered;
        if other_triggered {
            self.direction = read.side.direction();
            info!("{} RFID: direction {}", read.side.name(), self.direction);
        }

        let current = match read.side {
            ReaderSide::Inner => &mut self.in_match,
            ReaderSide::Outer => &mut self.out_match,
        };
        current.triggered = true;
        current.complete = read.complete;
        current.data = read.data.clone();
        current.is_allowed = is_allowed;

        Some(RfidDetect {
            side: read.side,
            data: current.data.clone(),
            complete: current.complete,
            is_allowed,
            other_triggered,
            direction: self.direction,
        })
    }
}
