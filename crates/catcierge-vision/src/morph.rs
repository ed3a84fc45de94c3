//! Rectangular-kernel binary morphology. The prey pipeline needs exact 2x2,
//! 3x3 and 5x1 structuring elements, which norm-based morphology cannot
//! express, so these operate directly on the pixel buffer. Windows are
//! clamped at the borders (replicate semantics for min/max filters).

use image::GrayImage;

fn window_filter<F>(img: &GrayImage, kw: u32, kh: u32, fold: F) -> GrayImage
where
    F: Fn(u8, u8) -> u8,
{
    let (w, h) = img.dimensions();
    let mut out = GrayImage::new(w, h);

    for y in 0..h {
        for x in 0..w {
            // Kernel anchored at its top-left corner.
            let mut acc: Option<u8> = None;
            for ky in 0..kh {
                for kx in 0..kw {
                    let sx = (x + kx).min(w - 1);
                    let sy = (y + ky).min(h - 1);
                    let v = img.get_pixel(sx, sy).0[0];
                    acc = Some(match acc {
                        None => v,
                        Some(a) => fold(a, v),
                    });
                }
            }
            out.put_pixel(x, y, image::Luma([acc.unwrap_or(0)]));
        }
    }

    out
}

pub fn erode(img: &GrayImage, kw: u32, kh: u32, iterations: u32) -> GrayImage {
    let mut out = img.clone();
    for _ in 0..iterations {
        out = window_filter(&out, kw, kh, u8::min);
    }
    out
}

pub fn dilate(img: &GrayImage, kw: u32, kh: u32, iterations: u32) -> GrayImage {
    let mut out = img.clone();
    for _ in 0..iterations {
        out = window_filter(&out, kw, kh, u8::max);
    }
    out
}

/// Morphological opening: erosion runs first, then dilation, each applied
/// `iterations` times.
pub fn open(img: &GrayImage, kw: u32, kh: u32, iterations: u32) -> GrayImage {
    dilate(&erode(img, kw, kh, iterations), kw, kh, iterations)
}

pub fn invert(img: &GrayImage) -> GrayImage {
    let mut out = img.clone();
    for p in out.pixels_mut() {
        p.0[0] = 255 - p.0[0];
    }
    out
}

/// Saturating per-pixel sum of two equally sized images.
pub fn add(a: &GrayImage, b: &GrayImage) -> GrayImage {
    debug_assert_eq!(a.dimensions(), b.dimensions());
    let mut out = a.clone();
    for (p, q) in out.pixels_mut().zip(b.pixels()) {
        p.0[0] = p.0[0].saturating_add(q.0[0]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn from_rows(rows: &[&[u8]]) -> GrayImage {
        let h = rows.len() as u32;
        let w = rows[0].len() as u32;
        let mut img = GrayImage::new(w, h);
        for (y, row) in rows.iter().enumerate() {
            for (x, &v) in row.iter().enumerate() {
                img.put_pixel(x as u32, y as u32, Luma([v]));
            }
        }
        img
    }

    #[test]
    fn erode_removes_single_pixel() {
        let img = from_rows(&[
            &[0, 0, 0, 0],
            &[0, 255, 0, 0],
            &[0, 0, 0, 0],
        ]);
        let out = erode(&img, 2, 2, 1);
        assert!(out.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn erode_keeps_solid_block_core() {
        let img = from_rows(&[
            &[255, 255, 255, 0],
            &[255, 255, 255, 0],
            &[255, 255, 255, 0],
            &[0, 0, 0, 0],
        ]);
        let out = erode(&img, 2, 2, 1);
        assert_eq!(out.get_pixel(0, 0).0[0], 255);
        assert_eq!(out.get_pixel(1, 1).0[0], 255);
        assert_eq!(out.get_pixel(2, 0).0[0], 0);
        assert_eq!(out.get_pixel(0, 2).0[0], 0);
    }

    #[test]
    fn dilate_grows_single_pixel() {
        let img = from_rows(&[
            &[0, 0, 0],
            &[0, 0, 0],
            &[0, 0, 255],
        ]);
        let out = dilate(&img, 2, 2, 1);
        // Anchor at top-left: the window of (1,1) covers (2,2).
        assert_eq!(out.get_pixel(1, 1).0[0], 255);
        assert_eq!(out.get_pixel(2, 2).0[0], 255);
        assert_eq!(out.get_pixel(0, 0).0[0], 0);
    }

    #[test]
    fn open_drops_speckle_keeps_block() {
        let img = from_rows(&[
            &[255, 0, 0, 0, 0, 0],
            &[0, 0, 0, 255, 255, 255],
            &[0, 0, 0, 255, 255, 255],
            &[0, 0, 0, 255, 255, 255],
        ]);
        let out = open(&img, 2, 2, 1);
        assert_eq!(out.get_pixel(0, 0).0[0], 0, "lone speckle survives opening");
        assert_eq!(out.get_pixel(4, 2).0[0], 255, "solid block lost in opening");
    }

    #[test]
    fn wide_kernel_open_cuts_thin_vertical_line() {
        // A 1px vertical line cannot survive a 5x1 opening.
        let mut img = GrayImage::new(8, 4);
        for y in 0..4 {
            img.put_pixel(3, y, Luma([255]));
        }
        let out = open(&img, 5, 1, 1);
        assert!(out.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn invert_round_trips() {
        let img = from_rows(&[&[0, 100, 255]]);
        let back = invert(&invert(&img));
        assert_eq!(img.as_raw(), back.as_raw());
    }

    #[test]
    fn add_saturates() {
        let a = from_rows(&[&[200, 10]]);
        let b = from_rows(&[&[100, 10]]);
        let out = add(&a, &b);
        assert_eq!(out.get_pixel(0, 0).0[0], 255);
        assert_eq!(out.get_pixel(1, 0).0[0], 20);
    }
}
