pub mod camera;
pub mod cascade;
pub mod haar;
mod morph;
pub mod template;

use anyhow::Result;
use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Upper bound on detection rectangles reported per frame.
pub const MAX_MATCH_RECTS: usize = 10;

/// Upper bound on intermediate diagnostic images kept per frame.
pub const MAX_STEPS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
    Unknown,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
            Direction::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Unknown
    }
}

/// Which horizontal direction counts as "entering" for this door.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InDirection {
    Left,
    Right,
}

impl Default for InDirection {
    fn default() -> Self {
        InDirection::Right
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl MatchRect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn center_x(&self) -> i32 {
        self.x + (self.width as i32) / 2
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// One intermediate image out of a matcher pipeline, kept for diagnostics
/// when step saving is enabled.
#[derive(Debug, Clone)]
pub struct MatchStep {
    pub name: String,
    pub description: String,
    pub img: Option<GrayImage>,
    /// Filled in when the surrounding match is assigned an output path.
    pub path: String,
}

impl MatchStep {
    pub fn new(name: &str, description: &str, img: Option<GrayImage>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            img,
            path: String::new(),
        }
    }
}

/// Per-frame verdict out of a matcher.
#[derive(Debug, Clone, Default)]
pub struct MatchResult {
    pub success: bool,
    pub score: f64,
    pub direction: Direction,
    pub description: String,
    pub rects: Vec<MatchRect>,
    pub steps: Vec<MatchStep>,
}

impl MatchResult {
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Record a pipeline step, dropping the image unless capture is on.
    /// Steps beyond capacity are silently discarded.
    pub fn push_step(&mut self, capture: bool, name: &str, description: &str, img: &GrayImage) {
        if self.steps.len() >= MAX_STEPS {
            return;
        }
        let img = if capture { Some(img.clone()) } else { None };
        self.steps.push(MatchStep::new(name, description, img));
    }
}

/// How per-frame directions combine into one verdict for a whole group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionPolicy {
    /// The last successful frame's direction wins.
    LastSuccess,
    /// Plurality across the group's frames.
    Plurality,
}

/// The capability set the decision engine sees. Both matcher strategies
/// implement this; the engine never learns which one is active.
pub trait Matcher: Send {
    /// Short name used for logging and the `matcher` template variable.
    fn kind(&self) -> &'static str;

    /// Score cutoff that `success` was computed against.
    fn success_threshold(&self) -> f64;

    /// How this matcher's per-frame directions aggregate.
    fn direction_policy(&self) -> DirectionPolicy;

    /// Run one frame through the pipeline. An `Err` is a per-frame matcher
    /// failure; the caller logs it and skips the tick.
    fn match_frame(&mut self, frame: &GrayImage, save_steps: bool) -> Result<MatchResult>;

    /// Probe whether something is blocking the backlight. Must not modify
    /// the frame.
    fn is_frame_obstructed(&self, frame: &GrayImage) -> Result<bool>;
}

/// Center-band darkness probe. The door backlight makes a clear frame
/// bright; an animal in the doorway darkens the middle of the image.
pub fn is_frame_obstructed(frame: &GrayImage, cutoff: u8) -> Result<bool> {
    let (w, h) = frame.dimensions();
    anyhow::ensure!(w >= 3 && h >= 3, "frame too small to probe ({}x{})", w, h);

    let x0 = w / 3;
    let x1 = 2 * w / 3;
    let y0 = h / 3;
    let y1 = 2 * h / 3;

    let mut sum: u64 = 0;
    let mut count: u64 = 0;
    for y in y0..y1 {
        for x in x0..x1 {
            sum += frame.get_pixel(x, y).0[0] as u64;
            count += 1;
        }
    }

    let mean = sum / count.max(1);
    Ok(mean < cutoff as u64)
}
