use chrono::{DateTime, Local};
use image::GrayImage;
use sha1::{Digest, Sha1};
use tracing::warn;

use catcierge_vision::{Direction, DirectionPolicy, MatchResult};

/// How many frame verdicts one open/lock decision aggregates.
pub const MATCH_MAX_COUNT: usize = 4;

/// Filename timestamp, microsecond precision.
const TIME_STR_FMT: &str = "%Y-%m-%d_%H_%M_%S%.6f";

/// Stable unique id for one match: SHA-1 over the raw pixels concatenated
/// with the formatted timestamp.
pub fn match_id(pixels: &[u8], time_str: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(pixels);
    sha.update(time_str.as_bytes());
    hex::encode(sha.finalize())
}

/// One frame verdict together with the captured image and its identity.
#[derive(Debug, Clone)]
pub struct MatchState {
    pub result: MatchResult,
    pub img: Option<GrayImage>,
    pub time: DateTime<Local>,
    pub time_str: String,
    pub id: String,
    pub path: String,
}

impl MatchState {
    pub fn new(frame: &GrayImage, result: MatchResult, now: DateTime<Local>, keep_img: bool) -> Self {
        let time_str = now.format(TIME_STR_FMT).to_string();
        let id = match_id(frame.as_raw(), &time_str);
        Self {
            result,
            img: keep_img.then(|| frame.clone()),
            time: now,
            time_str,
            id,
            path: String::new(),
        }
    }

    /// Fill in where this match (and its pipeline steps) will be persisted.
    pub fn assign_paths(&mut self, output_path: &str, idx: usize, save_steps: bool) {
        let fail = if self.result.success { "" } else { "fail_" };
        let base = format!("{}/match_{}{}__{}", output_path, fail, self.time_str, idx);
        self.path = format!("{}.png", base);

        if save_steps {
            for (j, step) in self.result.steps.iter_mut().enumerate() {
                step.path = format!("{}_{:02}_{}.png", base, j, step.name);
            }
        }
    }

    pub fn release_image(&mut self) {
        self.img = None;
        for step in &mut self.result.steps {
            step.img = None;
        }
    }
}

/// The bounded buffer of frame verdicts behind one decision.
#[derive(Debug, Default)]
pub struct MatchGroup {
    matches: Vec<MatchState>,
    pub success: bool,
    pub success_count: usize,
    pub direction: Direction,
}

impl MatchGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.matches.clear();
        self.success = false;
        self.success_count = 0;
        self.direction = Direction::Unknown;
    }

    pub fn push(&mut self, m: MatchState) {
        if self.matches.len() >= MATCH_MAX_COUNT {
            warn!("match group full, dropping extra verdict");
            return;
        }
        self.matches.push(m);
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.matches.len() >= MATCH_MAX_COUNT
    }

    pub fn get(&self, idx: usize) -> Option<&MatchState> {
        self.matches.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut MatchState> {
        self.matches.get_mut(idx)
    }

    pub fn matches(&self) -> &[MatchState] {
        &self.matches
    }

    pub fn release_images(&mut self) {
        for m in &mut self.matches {
            m.release_image();
        }
    }

    /// Fold the individual verdicts into the group decision. An overall OUT
    /// direction passes unconditionally: blocking an exiting cat is worse
    /// than admitting a false positive.
    pub fn evaluate(&mut self, policy: DirectionPolicy, ok_matches_needed: usize) {
        self.success_count = self.matches.iter().filter(|m| m.result.success).count();

        self.direction = match policy {
            DirectionPolicy::LastSuccess => self
                .matches
                .iter()
                .filter(|m| m.result.success)
                .map(|m| m.result.direction)
                .last()
                .unwrap_or(Direction::Unknown),
            DirectionPolicy::Plurality => {
                let count = |d: Direction| {
                    self.matches.iter().filter(|m| m.result.direction == d).count()
                };
                let (ins, outs, unknowns) =
                    (count(Direction::In), count(Direction::Out), count(Direction::Unknown));
                if ins > outs && ins > unknowns {
                    Direction::In
                } else if outs > unknowns {
                    Direction::Out
                } else {
                    Direction::Unknown
                }
            }
        };

        self.success =
            self.direction == Direction::Out || self.success_count >= ok_matches_needed;
    }
}
