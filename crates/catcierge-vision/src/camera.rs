use anyhow::{Context, Result};
use image::GrayImage;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

fn default_device() -> String {
    "/dev/video0".into()
}

fn default_dim() -> u32 {
    320
}

fn default_height() -> u32 {
    240
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// "libcamera-jpeg" | "v4l2-mjpeg" | "dir"
    pub mode: String,

    #[serde(default = "default_device")]
    pub device: String,

    #[serde(default = "default_dim")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    /// Frame directory for mode = "dir": PNG/JPEG files replayed in sorted
    /// order, for bench runs without camera hardware.
    pub frame_dir: Option<String>,

    /// Pacing for directory replay, frames per second.
    #[serde(default)]
    pub replay_fps: Option<u32>,
}

/// Frame acquisition:
/// - libcamera-jpeg: `libcamera-still` single frame to stdout (robust on Pi)
/// - v4l2-mjpeg: `ffmpeg` single MJPEG frame grab
/// - dir: replay frames from disk; end of directory ends the stream
pub enum FrameSource {
    Command(CameraConfig),
    Dir {
        files: Vec<std::path::PathBuf>,
        next: usize,
        delay: std::time::Duration,
    },
}

impl FrameSource {
    pub fn new(cfg: &CameraConfig) -> Result<Self> {
        match cfg.mode.as_str() {
            "libcamera-jpeg" | "v4l2-mjpeg" => Ok(Self::Command(cfg.clone())),
            "dir" => {
                let dir = cfg.frame_dir.as_ref().context("camera.frame_dir missing")?;
                let mut files: Vec<_> = std::fs::read_dir(dir)
                    .with_context(|| format!("open frame dir {}", dir))?
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| {
                        matches!(
                            p.extension().and_then(|e| e.to_str()),
                            Some("png") | Some("jpg") | Some("jpeg")
                        )
                    })
                    .collect();
                files.sort();
                anyhow::ensure!(!files.is_empty(), "no frames in {}", dir);
                let fps = cfg.replay_fps.unwrap_or(0);
                let delay = if fps > 0 {
                    std::time::Duration::from_millis(1000 / fps as u64)
                } else {
                    std::time::Duration::ZERO
                };
                Ok(Self::Dir { files, next: 0, delay })
            }
            other => anyhow::bail!("unknown camera.mode: {}", other),
        }
    }

    /// Grab the next frame. `None` means the stream ended (directory replay
    /// exhausted); command capture never ends on its own.
    pub async fn next_frame(&mut self) -> Result<Option<GrayImage>> {
        match self {
            Self::Command(cfg) => {
                let jpeg = match cfg.mode.as_str() {
                    "libcamera-jpeg" => capture_libcamera(cfg).await?,
                    _ => capture_v4l2_ffmpeg(cfg).await?,
                };
                let img = image::load_from_memory(&jpeg).context("decode captured frame")?;
                Ok(Some(img.to_luma8()))
            }
            Self::Dir { files, next, delay } => {
                if *next >= files.len() {
                    return Ok(None);
                }
                let path = &files[*next];
                *next += 1;
                let img = image::open(path)
                    .with_context(|| format!("load frame {}", path.display()))?
                    .to_luma8();
                if !delay.is_zero() {
                    tokio::time::sleep(*delay).await;
                }
                Ok(Some(img))
            }
        }
    }
}

async fn capture_libcamera(cfg: &CameraConfig) -> Result<Vec<u8>> {
    let mut cmd = Command::new("libcamera-still");
    cmd.args([
        "-n",
        "-t",
        "1",
        "--width",
        &cfg.width.to_string(),
        "--height",
        &cfg.height.to_string(),
        "-o",
        "-",
    ]);

    debug!("capture: libcamera-still");
    let out = cmd.output().await.context("run libcamera-still")?;
    anyhow::ensure!(out.status.success(), "libcamera-still failed");
    Ok(out.stdout)
}

async fn capture_v4l2_ffmpeg(cfg: &CameraConfig) -> Result<Vec<u8>> {
    let mut cmd = Command::new("ffmpeg");
    cmd.args([
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        "video4linux2",
        "-input_format",
        "mjpeg",
        "-video_size",
        &format!("{}x{}", cfg.width, cfg.height),
        "-i",
        &cfg.device,
        "-vframes",
        "1",
        "-f",
        "image2pipe",
        "-vcodec",
        "mjpeg",
        "-",
    ]);

    debug!("capture: ffmpeg v4l2");
    let out = cmd.output().await.context("run ffmpeg capture")?;
    anyhow::ensure!(out.status.success(), "ffmpeg capture failed");
    Ok(out.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir_cfg(dir: &std::path::Path) -> CameraConfig {
        CameraConfig {
            mode: "dir".into(),
            device: default_device(),
            width: 320,
            height: 240,
            frame_dir: Some(dir.to_string_lossy().into_owned()),
            replay_fps: None,
        }
    }

    #[tokio::test]
    async fn dir_source_replays_in_order_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        for (name, v) in [("b.png", 20u8), ("a.png", 10u8)] {
            let img = GrayImage::from_pixel(8, 8, image::Luma([v]));
            img.save(dir.path().join(name)).unwrap();
        }

        let mut src = FrameSource::new(&dir_cfg(dir.path())).unwrap();
        let first = src.next_frame().await.unwrap().unwrap();
        assert_eq!(first.get_pixel(0, 0).0[0], 10, "a.png replays first");
        let second = src.next_frame().await.unwrap().unwrap();
        assert_eq!(second.get_pixel(0, 0).0[0], 20);
        assert!(src.next_frame().await.unwrap().is_none(), "stream must end");
    }

    #[test]
    fn empty_dir_is_an_init_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FrameSource::new(&dir_cfg(dir.path())).is_err());
    }

    #[test]
    fn unknown_mode_is_an_init_error() {
        let cfg = CameraConfig {
            mode: "pixies".into(),
            device: default_device(),
            width: 320,
            height: 240,
            frame_dir: None,
            replay_fps: None,
        };
        assert!(FrameSource::new(&cfg).is_err());
    }
}
