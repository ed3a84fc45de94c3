use anyhow::{Context, Result};
use image::GrayImage;
use imageproc::template_matching::{match_template, MatchTemplateMethod};
use serde::Deserialize;
use tracing::debug;

use crate::{
    is_frame_obstructed, Direction, InDirection, MatchRect, MatchResult, Matcher, MAX_MATCH_RECTS,
};

fn default_threshold() -> f64 {
    0.8
}

fn default_cutoff() -> u8 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateConfig {
    /// Reference snout images, cross-correlated against every frame.
    pub snout_paths: Vec<String>,

    #[serde(default = "default_threshold")]
    pub match_threshold: f64,

    #[serde(default)]
    pub in_direction: InDirection,

    #[serde(default = "default_cutoff")]
    pub obstruction_cutoff: u8,
}

pub struct TemplateMatcher {
    cfg: TemplateConfig,
    snouts: Vec<GrayImage>,
}

impl TemplateMatcher {
    pub fn new(cfg: TemplateConfig) -> Result<Self> {
        anyhow::ensure!(!cfg.snout_paths.is_empty(), "no snout templates configured");

        let mut snouts = Vec::with_capacity(cfg.snout_paths.len());
        for path in &cfg.snout_paths {
            let img = image::open(path)
                .with_context(|| format!("load snout template {}", path))?
                .to_luma8();
            debug!("template: loaded snout {} ({}x{})", path, img.width(), img.height());
            snouts.push(img);
        }

        Ok(Self { cfg, snouts })
    }

    /// Build directly from in-memory templates.
    pub fn from_images(cfg: TemplateConfig, snouts: Vec<GrayImage>) -> Result<Self> {
        anyhow::ensure!(!snouts.is_empty(), "no snout templates given");
        Ok(Self { cfg, snouts })
    }

    pub fn snout_count(&self) -> usize {
        self.snouts.len()
    }

    fn direction_of(&self, best_center_x: i32, frame_width: u32) -> Direction {
        // The snout leads the body, so a best match right of the midline
        // means the animal is travelling right.
        let going_right = best_center_x >= (frame_width as i32) / 2;
        match (going_right, self.cfg.in_direction) {
            (true, InDirection::Right) | (false, InDirection::Left) => Direction::In,
            _ => Direction::Out,
        }
    }
}

impl Matcher for TemplateMatcher {
    fn kind(&self) -> &'static str {
        "template"
    }

    fn success_threshold(&self) -> f64 {
        self.cfg.match_threshold
    }

    fn direction_policy(&self) -> crate::DirectionPolicy {
        crate::DirectionPolicy::LastSuccess
    }

    fn match_frame(&mut self, frame: &GrayImage, save_steps: bool) -> Result<MatchResult> {
        let (fw, fh) = frame.dimensions();

        let mut res = MatchResult::default();
        res.push_step(save_steps, "gray", "Grayscale input frame", frame);

        let mut best_score = f32::NEG_INFINITY;
        let mut best_center_x = 0i32;
        let mut best_idx = 0usize;

        for (i, snout) in self.snouts.iter().enumerate() {
            let (tw, th) = snout.dimensions();
            anyhow::ensure!(
                tw <= fw && th <= fh,
                "snout template {} ({}x{}) larger than frame ({}x{})",
                i,
                tw,
                th,
                fw,
                fh
            );

            let response = match_template(frame, snout, MatchTemplateMethod::CrossCorrelationNormalized);

            // Best position for this template. Strict comparison keeps the
            // first position, and across templates the first template, on ties.
            let (rw, rh) = response.dimensions();
            let mut local_best = f32::NEG_INFINITY;
            let mut local_xy = (0u32, 0u32);
            for y in 0..rh {
                for x in 0..rw {
                    let v = response.get_pixel(x, y).0[0];
                    if v > local_best {
                        local_best = v;
                        local_xy = (x, y);
                    }
                }
            }

            if res.rects.len() < MAX_MATCH_RECTS {
                res.rects
                    .push(MatchRect::new(local_xy.0 as i32, local_xy.1 as i32, tw, th));
            }

            if local_best > best_score {
                best_score = local_best;
                best_center_x = local_xy.0 as i32 + (tw as i32) / 2;
                best_idx = i;
            }
        }

        res.score = best_score.clamp(0.0, 1.0) as f64;
        res.success = res.score >= self.cfg.match_threshold;
        res.direction = if res.success {
            self.direction_of(best_center_x, fw)
        } else {
            Direction::Unknown
        };
        res.description = format!("snout {} correlation {:.4}", best_idx + 1, res.score);

        debug!(
            "template: score={:.4} threshold={:.2} dir={} ({})",
            res.score, self.cfg.match_threshold, res.direction, res.description
        );

        Ok(res)
    }

    fn is_frame_obstructed(&self, frame: &GrayImage) -> Result<bool> {
        is_frame_obstructed(frame, self.cfg.obstruction_cutoff)
    }
}
