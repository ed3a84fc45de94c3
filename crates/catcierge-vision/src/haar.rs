use anyhow::Result;
use image::GrayImage;
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::contrast::{equalize_histogram, otsu_level, threshold, ThresholdType};
use serde::Deserialize;
use tracing::debug;

use crate::cascade::{CascadeClassifier, HeadDetector};
use crate::{is_frame_obstructed, morph, Direction, InDirection, MatchResult, Matcher, MAX_MATCH_RECTS};

/// Column-sum difference below which the travel direction is unknown.
const DIRECTION_TIE_BAND: i64 = 25;

/// Contours smaller than this are noise, not prey.
const MIN_CONTOUR_AREA: f64 = 10.0;

/// How far the prey region extends past the head box toward the outside.
const ROI_EXTEND: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreyMethod {
    Adaptive,
    Normal,
}

impl Default for PreyMethod {
    fn default() -> Self {
        PreyMethod::Adaptive
    }
}

fn default_min_size() -> String {
    "80x80".into()
}

fn default_prey_steps() -> u32 {
    2
}

fn default_cutoff() -> u8 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct HaarConfig {
    /// Path to the JSON cascade model.
    pub cascade: String,

    /// Minimum head detection window, "WxH".
    #[serde(default = "default_min_size")]
    pub min_size: String,

    #[serde(default)]
    pub eq_histogram: bool,

    /// Count a head-less frame as a failure instead of a pass.
    #[serde(default)]
    pub no_match_is_fail: bool,

    #[serde(default)]
    pub prey_method: PreyMethod,

    /// Normal prey mode only: 2 enables the secondary erode/open rescan.
    #[serde(default = "default_prey_steps")]
    pub prey_steps: u32,

    #[serde(default)]
    pub in_direction: InDirection,

    #[serde(default = "default_cutoff")]
    pub obstruction_cutoff: u8,
}

pub fn parse_min_size(s: &str) -> Result<(u32, u32)> {
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| anyhow::anyhow!("invalid min_size \"{}\", expected WxH", s))?;
    Ok((w.trim().parse()?, h.trim().parse()?))
}

pub struct HaarMatcher {
    cfg: HaarConfig,
    min_size: (u32, u32),
    detector: Box<dyn HeadDetector>,
}

impl HaarMatcher {
    pub fn new(cfg: HaarConfig) -> Result<Self> {
        let detector = Box::new(CascadeClassifier::load(&cfg.cascade)?);
        Self::with_detector(cfg, detector)
    }

    /// Plug an alternative head-detection backend.
    pub fn with_detector(cfg: HaarConfig, detector: Box<dyn HeadDetector>) -> Result<Self> {
        let min_size = parse_min_size(&cfg.min_size)?;
        Ok(Self { cfg, min_size, detector })
    }
}

impl Matcher for HaarMatcher {
    fn kind(&self) -> &'static str {
        "haar"
    }

    fn success_threshold(&self) -> f64 {
        0.5
    }

    fn direction_policy(&self) -> crate::DirectionPolicy {
        crate::DirectionPolicy::Plurality
    }

    fn match_frame(&mut self, frame: &GrayImage, save_steps: bool) -> Result<MatchResult> {
        let (fw, fh) = frame.dimensions();
        let mut res = MatchResult::default();

        let img = if self.cfg.eq_histogram {
            equalize_histogram(frame)
        } else {
            frame.clone()
        };
        res.push_step(save_steps, "input", "Grayscale input frame", &img);

        let heads = self.detector.detect(&img, self.min_size)?;
        res.rects = heads.iter().copied().take(MAX_MATCH_RECTS).collect();

        // A head-less frame passes unless configured otherwise: only prey
        // fails a frame by default.
        let mut score = 0.999;
        if self.cfg.no_match_is_fail {
            score = if heads.is_empty() { 0.0 } else { 0.999 };
        }
        res.description = if heads.is_empty() {
            "no head".to_string()
        } else {
            format!("{} head(s)", heads.len())
        };

        if let Some(head) = heads.first().copied() {
            let (rx, ry, rw, rh) = prey_roi(head, fw, fh, self.cfg.in_direction);
            let roi = image::imageops::crop_imm(&img, rx, ry, rw, rh).to_image();
            res.push_step(save_steps, "roi", "Lower head region", &roi);

            let (inverted, kind) = match self.cfg.prey_method {
                PreyMethod::Adaptive => (true, ThresholdType::BinaryInverted),
                PreyMethod::Normal => (false, ThresholdType::Binary),
            };
            let thr = threshold(&roi, otsu_level(&roi), kind);
            res.push_step(save_steps, "threshold", "Otsu thresholded region", &thr);

            res.direction = guess_direction(&thr, inverted, self.cfg.in_direction);

            // No prey check on the way out.
            if res.direction == Direction::Out {
                debug!("haar: going out, skipping prey detection");
                res.description = "going out".to_string();
            } else {
                let prey = match self.cfg.prey_method {
                    PreyMethod::Adaptive => {
                        find_prey_adaptive(&roi, &thr, &mut res, save_steps)
                    }
                    PreyMethod::Normal => {
                        find_prey_normal(&thr, self.cfg.prey_steps, &mut res, save_steps)
                    }
                };
                score = if prey { 0.0 } else { 1.0 };
                res.description =
                    if prey { "prey detected".to_string() } else { "clear profile".to_string() };
            }
        }

        res.score = score;
        res.success = score >= self.success_threshold();

        debug!(
            "haar: score={:.3} dir={} heads={} ({})",
            res.score,
            res.direction,
            res.rects.len(),
            res.description
        );

        Ok(res)
    }

    fn is_frame_obstructed(&self, frame: &GrayImage) -> Result<bool> {
        is_frame_obstructed(frame, self.cfg.obstruction_cutoff)
    }
}

/// Lower half of the head box, widened toward the outside so prey dangling
/// from the mouth keeps background on both sides.
fn prey_roi(head: crate::MatchRect, fw: u32, fh: u32, in_dir: InDirection) -> (u32, u32, u32, u32) {
    let half = head.height / 2;
    let mut x = head.x;
    let y = head.y + half as i32;
    let mut w = head.width + ROI_EXTEND;

    if in_dir == InDirection::Right {
        x -= ROI_EXTEND as i32;
    }
    if x < 0 {
        w = w.saturating_sub((-x) as u32);
        x = 0;
    }

    let x = (x as u32).min(fw.saturating_sub(1));
    let y = (y.max(0) as u32).min(fh.saturating_sub(1));
    let w = w.min(fw - x).max(1);
    let h = half.min(fh - y).max(1);
    (x, y, w, h)
}

/// Compare the outermost columns of the thresholded region: the heavier side
/// is where the body still fills the frame, i.e. the side being moved toward.
pub(crate) fn guess_direction(thr: &GrayImage, inverted: bool, in_dir: InDirection) -> Direction {
    let (w, h) = thr.dimensions();
    if w < 2 {
        return Direction::Unknown;
    }

    let mut left_sum: i64 = 0;
    let mut right_sum: i64 = 0;
    for y in 0..h {
        left_sum += thr.get_pixel(0, y).0[0] as i64;
        right_sum += thr.get_pixel(w - 1, y).0[0] as i64;
    }

    if (left_sum - right_sum).abs() <= DIRECTION_TIE_BAND {
        return Direction::Unknown;
    }

    let going_right = right_sum > left_sum;
    let dir = match (going_right, in_dir) {
        (true, InDirection::Right) | (false, InDirection::Left) => Direction::In,
        _ => Direction::Out,
    };

    if inverted {
        match dir {
            Direction::In => Direction::Out,
            Direction::Out => Direction::In,
            Direction::Unknown => Direction::Unknown,
        }
    } else {
        dir
    }
}

fn contour_area(contour: &Contour<i32>) -> f64 {
    let pts = &contour.points;
    if pts.len() < 3 {
        return 0.0;
    }
    let mut acc = 0i64;
    for i in 0..pts.len() {
        let a = pts[i];
        let b = pts[(i + 1) % pts.len()];
        acc += a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64;
    }
    (acc.abs() as f64) / 2.0
}

fn count_contours(img: &GrayImage, outer_only: bool) -> usize {
    find_contours::<i32>(img)
        .iter()
        .filter(|c| !outer_only || c.border_type == BorderType::Outer)
        .filter(|c| contour_area(c) > MIN_CONTOUR_AREA)
        .count()
}

/// Inverted adaptive threshold against the local box mean (block 11, C 5):
/// brings out thin details like a mouse tail that a global threshold blends
/// into the background.
pub(crate) fn adaptive_threshold_inv(img: &GrayImage, radius: u32, c: f64) -> GrayImage {
    let (w, h) = img.dimensions();
    let mut out = GrayImage::new(w, h);

    for y in 0..h {
        for x in 0..w {
            let x0 = x.saturating_sub(radius);
            let x1 = (x + radius).min(w - 1);
            let y0 = y.saturating_sub(radius);
            let y1 = (y + radius).min(h - 1);

            let mut sum = 0u64;
            let mut n = 0u64;
            for sy in y0..=y1 {
                for sx in x0..=x1 {
                    sum += img.get_pixel(sx, sy).0[0] as u64;
                    n += 1;
                }
            }
            let mean = sum as f64 / n as f64;
            let v = if (img.get_pixel(x, y).0[0] as f64) > mean - c { 0 } else { 255 };
            out.put_pixel(x, y, image::Luma([v]));
        }
    }

    out
}

/// Prey check on an inverted-threshold profile: combine global and adaptive
/// thresholds, clean up, invert back, and count how many pieces the bright
/// background was split into.
pub(crate) fn find_prey_adaptive(
    roi: &GrayImage,
    inv_thr: &GrayImage,
    res: &mut MatchResult,
    save_steps: bool,
) -> bool {
    let adaptive = adaptive_threshold_inv(roi, 5, 5.0);
    res.push_step(save_steps, "adaptive", "Inverted adaptive threshold", &adaptive);

    let combined = morph::add(inv_thr, &adaptive);
    res.push_step(save_steps, "combined", "Combined thresholds", &combined);

    let opened = morph::open(&combined, 2, 2, 2);
    res.push_step(save_steps, "opened", "Opened combined image", &opened);

    let dilated = morph::dilate(&opened, 3, 3, 3);
    res.push_step(save_steps, "dilated", "Dilated combined image", &dilated);

    let back = morph::invert(&dilated);
    res.push_step(save_steps, "inverted", "Background restored to white", &back);

    let count = count_contours(&back, true);
    debug!("haar: adaptive prey contours={}", count);
    count > 1
}

/// Simpler prey check on a plain Otsu profile, with an optional second
/// erode/open pass when the first one finds a single region.
pub(crate) fn find_prey_normal(
    thr: &GrayImage,
    prey_steps: u32,
    res: &mut MatchResult,
    save_steps: bool,
) -> bool {
    let mut count = count_contours(thr, false);

    if count == 1 && prey_steps >= 2 {
        let eroded = morph::erode(thr, 3, 3, 3);
        res.push_step(save_steps, "eroded", "Eroded threshold image", &eroded);

        let opened = morph::open(&eroded, 5, 1, 1);
        res.push_step(save_steps, "opened", "Opened threshold image", &opened);

        count = count_contours(&opened, false);
    }

    debug!("haar: normal prey contours={}", count);
    count > 1
}
