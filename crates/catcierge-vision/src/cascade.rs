//! Stage-cascade head detector. Models are JSON descriptions of boosted
//! stages of rectangular intensity features evaluated over an integral
//! image, scanned at multiple scales with neighbor grouping.

use anyhow::{Context, Result};
use image::GrayImage;
use serde::Deserialize;
use tracing::debug;

use crate::MatchRect;

const SCALE_FACTOR: f64 = 1.1;
const MIN_NEIGHBORS: usize = 3;
const GROUP_EPS: f64 = 0.2;

/// One weighted rectangle of a feature, in base-window coordinates.
#[derive(Debug, Clone, Deserialize)]
pub struct FeatureRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub weight: f64,
}

/// A decision stump over the weighted mean intensity of its rectangles.
#[derive(Debug, Clone, Deserialize)]
pub struct Feature {
    pub rects: Vec<FeatureRect>,
    pub threshold: f64,
    pub pass_weight: f64,
    pub fail_weight: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Stage {
    pub threshold: f64,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CascadeModel {
    pub window_width: u32,
    pub window_height: u32,
    pub stages: Vec<Stage>,
}

pub struct CascadeClassifier {
    model: CascadeModel,
}

/// Seam between the cascade matcher and its detection backend. The prey and
/// direction analysis only needs head rectangles, wherever they come from.
pub trait HeadDetector: Send {
    fn detect(&self, frame: &GrayImage, min_size: (u32, u32)) -> Result<Vec<MatchRect>>;
}

impl CascadeClassifier {
    pub fn load(path: &str) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read cascade model {}", path))?;
        let model: CascadeModel =
            serde_json::from_str(&data).with_context(|| format!("parse cascade model {}", path))?;
        Self::from_model(model)
    }

    pub fn from_model(model: CascadeModel) -> Result<Self> {
        anyhow::ensure!(
            model.window_width > 0 && model.window_height > 0,
            "cascade window size is zero"
        );
        anyhow::ensure!(!model.stages.is_empty(), "cascade has no stages");
        for (i, stage) in model.stages.iter().enumerate() {
            anyhow::ensure!(!stage.features.is_empty(), "cascade stage {} has no features", i);
        }
        Ok(Self { model })
    }

    fn eval_window(&self, ii: &Integral, x: u32, y: u32, scale: f64) -> bool {
        for stage in &self.model.stages {
            let mut sum = 0.0;
            for feat in &stage.features {
                let mut value = 0.0;
                for r in &feat.rects {
                    let rx = x + (r.x as f64 * scale) as u32;
                    let ry = y + (r.y as f64 * scale) as u32;
                    let rw = ((r.w as f64 * scale) as u32).max(1);
                    let rh = ((r.h as f64 * scale) as u32).max(1);
                    let area = (rw * rh) as f64;
                    value += r.weight * (ii.sum(rx, ry, rw, rh) as f64) / (area * 255.0);
                }
                sum += if value >= feat.threshold {
                    feat.pass_weight
                } else {
                    feat.fail_weight
                };
            }
            if sum < stage.threshold {
                return false;
            }
        }
        true
    }
}

impl HeadDetector for CascadeClassifier {
    fn detect(&self, frame: &GrayImage, min_size: (u32, u32)) -> Result<Vec<MatchRect>> {
        let (fw, fh) = frame.dimensions();
        let ii = Integral::new(frame);

        let mut raw = Vec::new();
        let mut scale = 1.0f64;
        loop {
            let ww = (self.model.window_width as f64 * scale) as u32;
            let wh = (self.model.window_height as f64 * scale) as u32;
            if ww > fw || wh > fh {
                break;
            }

            if ww >= min_size.0 && wh >= min_size.1 {
                let step = ((2.0 * scale) as u32).max(1);
                let mut y = 0;
                while y + wh <= fh {
                    let mut x = 0;
                    while x + ww <= fw {
                        if self.eval_window(&ii, x, y, scale) {
                            raw.push(MatchRect::new(x as i32, y as i32, ww, wh));
                        }
                        x += step;
                    }
                    y += step;
                }
            }

            scale *= SCALE_FACTOR;
        }

        let grouped = group_rects(&raw, MIN_NEIGHBORS);
        debug!("cascade: {} raw hits -> {} heads", raw.len(), grouped.len());
        Ok(grouped)
    }
}

/// Flat u64 integral image with a zero border row/column.
struct Integral {
    w: usize,
    data: Vec<u64>,
}

impl Integral {
    fn new(img: &GrayImage) -> Self {
        let (w, h) = img.dimensions();
        let (w, h) = (w as usize, h as usize);
        let mut data = vec![0u64; (w + 1) * (h + 1)];
        for y in 0..h {
            let mut row = 0u64;
            for x in 0..w {
                row += img.get_pixel(x as u32, y as u32).0[0] as u64;
                data[(y + 1) * (w + 1) + (x + 1)] = data[y * (w + 1) + (x + 1)] + row;
            }
        }
        Self { w: w + 1, data }
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        self.data[y1 * self.w + x1] + self.data[y0 * self.w + x0]
            - self.data[y0 * self.w + x1]
            - self.data[y1 * self.w + x0]
    }
}

fn similar(a: &MatchRect, b: &MatchRect) -> bool {
    let delta = GROUP_EPS * 0.5 * (a.width.min(b.width) + a.height.min(b.height)) as f64;
    (a.x - b.x).abs() as f64 <= delta
        && (a.y - b.y).abs() as f64 <= delta
        && ((a.x + a.width as i32) - (b.x + b.width as i32)).abs() as f64 <= delta
        && ((a.y + a.height as i32) - (b.y + b.height as i32)).abs() as f64 <= delta
}

/// Cluster raw window hits and keep clusters with enough support, most
/// supported first. Cluster members are averaged into one rectangle.
fn group_rects(raw: &[MatchRect], min_neighbors: usize) -> Vec<MatchRect> {
    let mut clusters: Vec<(MatchRect, Vec<MatchRect>)> = Vec::new();

    for r in raw {
        match clusters.iter_mut().find(|(rep, _)| similar(rep, r)) {
            Some((_, members)) => members.push(*r),
            None => clusters.push((*r, vec![*r])),
        }
    }

    clusters.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

    clusters
        .into_iter()
        .filter(|(_, members)| members.len() >= min_neighbors.max(1))
        .map(|(_, members)| {
            let n = members.len() as i64;
            let x = members.iter().map(|m| m.x as i64).sum::<i64>() / n;
            let y = members.iter().map(|m| m.y as i64).sum::<i64>() / n;
            let w = members.iter().map(|m| m.width as i64).sum::<i64>() / n;
            let h = members.iter().map(|m| m.height as i64).sum::<i64>() / n;
            MatchRect::new(x as i32, y as i32, w as u32, h as u32)
        })
        .collect()
}
