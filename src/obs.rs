use ndarray::Array3;

use crate::{OBS_HEIGHT, OBS_WIDTH, SCREEN_HEIGHT, SCREEN_HEIGHT_BOTH, SCREEN_WIDTH};

/// Target resolution for the observation tensor.
#[derive(Debug, Clone, Copy)]
pub struct ObsConfig {
    pub width: usize,
    pub height: usize,
}

impl Default for ObsConfig {
    fn default() -> Self {
        Self {
            width: OBS_WIDTH,
            height: OBS_HEIGHT,
        }
    }
}

/// Build the observation from a raw RGBX framebuffer: crop the top screen,
/// convert to luminance, downscale with an area filter, and add a trailing
/// channel axis. Identical frames produce identical tensors on every
/// platform.
pub fn build_observation(frame: &[u8], config: &ObsConfig) -> Array3<u8> {
    assert_eq!(
        frame.len(),
        SCREEN_WIDTH * SCREEN_HEIGHT_BOTH * 4,
        "framebuffer must be {}x{} RGBX",
        SCREEN_WIDTH,
        SCREEN_HEIGHT_BOTH
    );

    // Top screen only; the bottom screen is the touch display and carries
    // no race view.
    let mut gray = vec![0.0f32; SCREEN_WIDTH * SCREEN_HEIGHT];
    for y in 0..SCREEN_HEIGHT {
        for x in 0..SCREEN_WIDTH {
            let px = (y * SCREEN_WIDTH + x) * 4;
            let r = frame[px] as f32;
            let g = frame[px + 1] as f32;
            let b = frame[px + 2] as f32;
            gray[y * SCREEN_WIDTH + x] = 0.299 * r + 0.587 * g + 0.114 * b;
        }
    }

    let resized = resize_area(
        &gray,
        SCREEN_WIDTH,
        SCREEN_HEIGHT,
        config.width,
        config.height,
    );

    let bytes: Vec<u8> = resized
        .iter()
        .map(|v| v.round().clamp(0.0, 255.0) as u8)
        .collect();
    Array3::from_shape_vec((config.height, config.width, 1), bytes)
        .expect("observation shape matches buffer length")
}

/// Area-average downscale: each destination pixel is the coverage-weighted
/// mean of its (fractional) source rectangle. Equivalent to OpenCV's
/// INTER_AREA for downscaling, which is what the capture path needs since
/// 256x192 to 84x84 is not an integer ratio.
fn resize_area(src: &[f32], sw: usize, sh: usize, dw: usize, dh: usize) -> Vec<f32> {
    let x_ratio = sw as f32 / dw as f32;
    let y_ratio = sh as f32 / dh as f32;
    let inv_area = 1.0 / (x_ratio * y_ratio);

    let mut dst = vec![0.0f32; dw * dh];
    for dy in 0..dh {
        let sy0 = dy as f32 * y_ratio;
        let sy1 = sy0 + y_ratio;
        let iy0 = sy0.floor() as usize;
        let iy1 = (sy1.ceil() as usize).min(sh);
        for dx in 0..dw {
            let sx0 = dx as f32 * x_ratio;
            let sx1 = sx0 + x_ratio;
            let ix0 = sx0.floor() as usize;
            let ix1 = (sx1.ceil() as usize).min(sw);

            let mut acc = 0.0f32;
            for iy in iy0..iy1 {
                let wy = overlap(iy as f32, sy0, sy1);
                let row = iy * sw;
                for ix in ix0..ix1 {
                    let wx = overlap(ix as f32, sx0, sx1);
                    acc += src[row + ix] * wx * wy;
                }
            }
            dst[dy * dw + dx] = acc * inv_area;
        }
    }
    dst
}

/// Length of the intersection between the unit cell starting at `cell` and
/// the span `[lo, hi)`.
fn overlap(cell: f32, lo: f32, hi: f32) -> f32 {
    (hi.min(cell + 1.0) - lo.max(cell)).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(top: [u8; 3], bottom: [u8; 3]) -> Vec<u8> {
        let mut frame = vec![0u8; SCREEN_WIDTH * SCREEN_HEIGHT_BOTH * 4];
        for y in 0..SCREEN_HEIGHT_BOTH {
            let rgb = if y < SCREEN_HEIGHT { top } else { bottom };
            for x in 0..SCREEN_WIDTH {
                let px = (y * SCREEN_WIDTH + x) * 4;
                frame[px..px + 3].copy_from_slice(&rgb);
                frame[px + 3] = 0xFF;
            }
        }
        frame
    }

    #[test]
    fn output_shape_is_configured_target_with_channel_axis() {
        let obs = build_observation(&solid_frame([0; 3], [0; 3]), &ObsConfig::default());
        assert_eq!(obs.shape(), &[84, 84, 1]);
    }

    #[test]
    fn uniform_frame_maps_to_uniform_luminance() {
        let frame = solid_frame([200, 200, 200], [0, 0, 0]);
        let obs = build_observation(&frame, &ObsConfig::default());
        assert!(obs.iter().all(|&v| v == 200));
    }

    #[test]
    fn bottom_screen_is_cropped_out() {
        // White top, bright bottom: any bottom-screen leakage would darken
        // or brighten nothing -- the output must be all white.
        let frame = solid_frame([255, 255, 255], [10, 10, 10]);
        let obs = build_observation(&frame, &ObsConfig::default());
        assert!(obs.iter().all(|&v| v == 255));
    }

    #[test]
    fn luminance_uses_rec601_weights() {
        let frame = solid_frame([255, 0, 0], [0, 0, 0]);
        let obs = build_observation(&frame, &ObsConfig::default());
        // 0.299 * 255 = 76.245 -> 76
        assert!(obs.iter().all(|&v| v == 76));
    }

    #[test]
    fn identical_frames_yield_identical_tensors() {
        let mut frame = solid_frame([90, 40, 180], [5, 5, 5]);
        for (i, byte) in frame.iter_mut().enumerate() {
            if i % 4 != 3 {
                *byte = byte.wrapping_add((i % 251) as u8);
            }
        }
        let a = build_observation(&frame, &ObsConfig::default());
        let b = build_observation(&frame, &ObsConfig::default());
        assert_eq!(a, b);
    }

    #[test]
    fn integer_downscale_averages_blocks_exactly() {
        // 256x192 -> 64x48 is an exact 4x4 box filter. A checkerboard of
        // 0/100 in 4x4 tiles averages to the tile value itself.
        let mut frame = vec![0u8; SCREEN_WIDTH * SCREEN_HEIGHT_BOTH * 4];
        for y in 0..SCREEN_HEIGHT {
            for x in 0..SCREEN_WIDTH {
                let v = if ((x / 4) + (y / 4)) % 2 == 0 { 100 } else { 0 };
                let px = (y * SCREEN_WIDTH + x) * 4;
                frame[px] = v;
                frame[px + 1] = v;
                frame[px + 2] = v;
            }
        }
        let obs = build_observation(
            &frame,
            &ObsConfig {
                width: 64,
                height: 48,
            },
        );
        for ((y, x, _), &v) in obs.indexed_iter() {
            let expected = if (x + y) % 2 == 0 { 100 } else { 0 };
            assert_eq!(v, expected, "block ({y},{x})");
        }
    }
}
