//! Tiled execution of spatial upscalers.
//!
//! A frame is cut into overlapping tiles, each tile goes through the
//! transform on its own, and the scaled tiles are blended back with a
//! linear feather on every edge shared with a neighbouring tile. Peak
//! activation memory is bounded by one tile instead of one frame.

use anyhow::{bail, ensure, Context, Result};
use ndarray::{s, Array2, Array3, Array4, ArrayView4, Zip};
use tracing::{debug, info};

use crate::progress::ProgressReporter;

pub const DEFAULT_TILE_SIZE: usize = 512;
pub const DEFAULT_TILE_OVERLAP: usize = 32;

/// Rough activation multiplier per input pixel for ESRGAN-class models.
const ACTIVATION_FACTOR: f64 = 384.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileParams {
    pub tile: usize,
    pub overlap: usize,
    pub scale: usize,
}

impl TileParams {
    pub fn new(tile: usize, overlap: usize, scale: usize) -> Self {
        Self {
            tile,
            overlap,
            scale,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.tile > 0, "tile size must be positive");
        ensure!(self.scale >= 1, "upscale factor must be at least 1");
        if self.tile <= self.overlap {
            bail!(
                "tile size ({}) is too small for overlap ({})",
                self.tile,
                self.overlap
            );
        }
        Ok(())
    }

    pub fn step(&self) -> usize {
        self.tile - self.overlap
    }

    /// Width of the blend ramp in output pixels.
    pub fn feather(&self) -> usize {
        self.overlap * self.scale
    }
}

impl Default for TileParams {
    fn default() -> Self {
        Self::new(DEFAULT_TILE_SIZE, DEFAULT_TILE_OVERLAP, 4)
    }
}

/// One rectangle of the input plane plus which of its edges overlap a neighbour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRegion {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
    pub shared_left: bool,
    pub shared_top: bool,
    pub shared_right: bool,
    pub shared_bottom: bool,
}

fn axis_spans(dim: usize, tile: usize, step: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut origin = 0usize;
    loop {
        let len = tile.min(dim - origin);
        spans.push((origin, len));
        if origin + len >= dim {
            break;
        }
        origin += step;
    }
    spans
}

/// Row-major tile grid covering a `width x height` plane.
pub fn tile_grid(width: usize, height: usize, params: &TileParams) -> Result<Vec<TileRegion>> {
    params.validate()?;
    ensure!(
        width > 0 && height > 0,
        "cannot tile an empty plane ({width}x{height})"
    );

    let xs = axis_spans(width, params.tile, params.step());
    let ys = axis_spans(height, params.tile, params.step());

    let mut grid = Vec::with_capacity(xs.len() * ys.len());
    for (yi, &(y, tile_h)) in ys.iter().enumerate() {
        for (xi, &(x, tile_w)) in xs.iter().enumerate() {
            grid.push(TileRegion {
                x,
                y,
                width: tile_w,
                height: tile_h,
                shared_left: xi > 0,
                shared_top: yi > 0,
                shared_right: xi + 1 < xs.len(),
                shared_bottom: yi + 1 < ys.len(),
            });
        }
    }
    Ok(grid)
}

/// Number of transform calls needed for one frame.
pub fn tiled_scale_steps(width: usize, height: usize, params: &TileParams) -> Result<u64> {
    Ok(tile_grid(width, height, params)?.len() as u64)
}

fn feather_ramp(len: usize, feather_lo: usize, feather_hi: usize) -> Vec<f32> {
    (0..len)
        .map(|i| {
            let mut weight = 1.0f32;
            if feather_lo > 0 && i < feather_lo {
                weight = weight.min((i + 1) as f32 / (feather_lo + 1) as f32);
            }
            let from_end = len - 1 - i;
            if feather_hi > 0 && from_end < feather_hi {
                weight = weight.min((from_end + 1) as f32 / (feather_hi + 1) as f32);
            }
            weight
        })
        .collect()
}

/// Blend weights for one scaled tile: 1 inside, linear ramp on shared edges.
pub fn tile_mask(region: &TileRegion, params: &TileParams) -> Array2<f32> {
    let feather = params.feather();
    let edge = |shared: bool| if shared { feather } else { 0 };

    let rows = feather_ramp(
        region.height * params.scale,
        edge(region.shared_top),
        edge(region.shared_bottom),
    );
    let cols = feather_ramp(
        region.width * params.scale,
        edge(region.shared_left),
        edge(region.shared_right),
    );

    Array2::from_shape_fn((rows.len(), cols.len()), |(y, x)| rows[y] * cols[x])
}

/// Sum of all tile masks over the scaled plane. Fails if any pixel is uncovered.
pub fn blend_weights(width: usize, height: usize, params: &TileParams) -> Result<Array2<f32>> {
    let grid = tile_grid(width, height, params)?;
    let scale = params.scale;
    let mut weights = Array2::<f32>::zeros((height * scale, width * scale));

    for region in &grid {
        let mask = tile_mask(region, params);
        let (oy, ox) = (region.y * scale, region.x * scale);
        let (mh, mw) = mask.dim();
        Zip::from(weights.slice_mut(s![oy..oy + mh, ox..ox + mw]))
            .and(&mask)
            .for_each(|w, &m| *w += m);
    }

    if let Some(((y, x), _)) = weights.indexed_iter().find(|(_, &w)| w <= 0.0) {
        bail!("tile grid leaves output pixel ({x}, {y}) without blend weight");
    }
    Ok(weights)
}

/// Advisory peak-memory estimate in bytes. Logged, never enforced.
pub fn estimate_memory_bytes(
    param_bytes: u64,
    tile: usize,
    scale: usize,
    element_bytes: usize,
    input_elements: usize,
) -> f64 {
    let tile_pixels = (tile * tile * 3) as f64;
    param_bytes as f64
        + tile_pixels * element_bytes as f64 * (scale.max(1) as f64) * ACTIVATION_FACTOR
        + (input_elements * element_bytes) as f64
}

/// Upscale `[frames, channels, h, w]` tile by tile.
///
/// `transform` receives `[1, C, th, tw]` views and must return
/// `[1, C', th * scale, tw * scale]`. Any transform error aborts the whole
/// call. `progress` advances once per tile.
pub fn tiled_scale<F>(
    input: ArrayView4<'_, f32>,
    params: &TileParams,
    mut transform: F,
    progress: &mut ProgressReporter,
) -> Result<Array4<f32>>
where
    F: FnMut(ArrayView4<'_, f32>) -> Result<Array4<f32>>,
{
    let (frames, _channels, height, width) = input.dim();
    ensure!(frames > 0, "cannot upscale an input without frames");

    let grid = tile_grid(width, height, params)?;
    let weights = blend_weights(width, height, params)?;
    let scale = params.scale;
    let (out_h, out_w) = (height * scale, width * scale);

    debug!(
        frames,
        height,
        width,
        tile = params.tile,
        overlap = params.overlap,
        scale,
        tiles_per_frame = grid.len(),
        "Starting tiled upscale"
    );

    let mut output: Option<Array4<f32>> = None;

    for f in 0..frames {
        let frame = input.slice(s![f..f + 1, .., .., ..]);
        let mut accumulator: Option<Array3<f32>> = None;

        for region in &grid {
            let tile_in = frame.slice(s![
                ..,
                ..,
                region.y..region.y + region.height,
                region.x..region.x + region.width
            ]);
            let tile_out = transform(tile_in).with_context(|| {
                format!(
                    "tile transform failed (frame {f}, x={}, y={}, {}x{})",
                    region.x, region.y, region.width, region.height
                )
            })?;

            let (n, out_channels, th, tw) = tile_out.dim();
            ensure!(
                n == 1 && th == region.height * scale && tw == region.width * scale,
                "tile transform returned shape {:?}, expected [1, C, {}, {}]",
                tile_out.shape(),
                region.height * scale,
                region.width * scale
            );

            let acc = accumulator.get_or_insert_with(|| Array3::zeros((out_channels, out_h, out_w)));
            ensure!(
                acc.dim().0 == out_channels,
                "tile transform changed channel count from {} to {out_channels}",
                acc.dim().0
            );

            let mask = tile_mask(region, params);
            let (oy, ox) = (region.y * scale, region.x * scale);
            for c in 0..out_channels {
                Zip::from(acc.slice_mut(s![c, oy..oy + th, ox..ox + tw]))
                    .and(tile_out.slice(s![0, c, .., ..]))
                    .and(&mask)
                    .for_each(|dst, &value, &m| *dst += value * m);
            }

            progress.advance(1);
        }

        let acc = accumulator.context("tile grid produced no tiles")?;
        let out_channels = acc.dim().0;
        let out = output.get_or_insert_with(|| Array4::zeros((frames, out_channels, out_h, out_w)));
        ensure!(
            out.dim().1 == out_channels,
            "tile transform changed channel count between frames"
        );
        for c in 0..out_channels {
            Zip::from(out.slice_mut(s![f, c, .., ..]))
                .and(acc.slice(s![c, .., ..]))
                .and(&weights)
                .for_each(|dst, &sum, &w| *dst = sum / w);
        }
    }

    info!(frames, out_h, out_w, "Tiled upscale finished");
    output.context("tiled upscale produced no output")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_cover_axis_without_padding() {
        assert_eq!(axis_spans(10, 16, 12), vec![(0, 10)]);
        assert_eq!(axis_spans(16, 16, 12), vec![(0, 16)]);
        assert_eq!(axis_spans(20, 8, 6), vec![(0, 8), (6, 8), (12, 8)]);
        assert_eq!(axis_spans(21, 8, 6), vec![(0, 8), (6, 8), (12, 8), (18, 3)]);
    }

    #[test]
    fn grid_marks_shared_edges_only() {
        let params = TileParams::new(8, 2, 1);
        let grid = tile_grid(14, 8, &params).unwrap();
        assert_eq!(grid.len(), 2);

        assert_eq!(grid[0].x, 0);
        assert!(!grid[0].shared_left);
        assert!(grid[0].shared_right);
        assert!(!grid[0].shared_top && !grid[0].shared_bottom);

        assert_eq!(grid[1].x, 6);
        assert_eq!(grid[1].width, 8);
        assert!(grid[1].shared_left);
        assert!(!grid[1].shared_right);
    }

    #[test]
    fn steps_match_grid_size() {
        let params = TileParams::new(512, 32, 4);
        assert_eq!(tiled_scale_steps(480, 512, &params).unwrap(), 1);
        assert_eq!(tiled_scale_steps(720, 480, &params).unwrap(), 2);
        assert_eq!(tiled_scale_steps(1500, 1000, &params).unwrap(), 4 * 3);
    }

    #[test]
    fn ramp_is_one_inside_and_positive_at_edges() {
        let ramp = feather_ramp(10, 3, 0);
        assert_eq!(ramp[0], 0.25);
        assert_eq!(ramp[1], 0.5);
        assert_eq!(ramp[2], 0.75);
        assert!(ramp[3..].iter().all(|&w| w == 1.0));

        let both = feather_ramp(6, 2, 2);
        assert_eq!(both, vec![1.0 / 3.0, 2.0 / 3.0, 1.0, 1.0, 2.0 / 3.0, 1.0 / 3.0]);
    }

    #[test]
    fn mask_is_flat_for_single_tile() {
        let params = TileParams::new(16, 4, 2);
        let grid = tile_grid(10, 12, &params).unwrap();
        assert_eq!(grid.len(), 1);
        let mask = tile_mask(&grid[0], &params);
        assert_eq!(mask.dim(), (24, 20));
        assert!(mask.iter().all(|&w| w == 1.0));
    }

    #[test]
    fn weights_cover_awkward_sizes() {
        for (w, h) in [(37, 53), (9, 9), (17, 8), (1, 40)] {
            let params = TileParams::new(8, 3, 2);
            let weights = blend_weights(w, h, &params).unwrap();
            assert_eq!(weights.dim(), (h * 2, w * 2));
            assert!(weights.iter().all(|&v| v > 0.0), "uncovered pixel for {w}x{h}");
        }
    }

    #[test]
    fn rejects_overlap_not_smaller_than_tile() {
        let err = TileParams::new(16, 16, 2).validate().unwrap_err();
        assert!(err.to_string().contains("too small for overlap"));
        assert!(TileParams::new(16, 4, 0).validate().is_err());
    }

    #[test]
    fn rejects_empty_plane() {
        assert!(tile_grid(0, 16, &TileParams::new(8, 2, 1)).is_err());
    }

    #[test]
    fn memory_estimate_adds_params_activations_and_input() {
        let estimate = estimate_memory_bytes(1_000, 512, 4, 2, 10);
        let expected = 1_000.0 + (512.0 * 512.0 * 3.0) * 2.0 * 4.0 * 384.0 + 20.0;
        assert_eq!(estimate, expected);
        assert_eq!(
            estimate_memory_bytes(0, 8, 0, 4, 0),
            estimate_memory_bytes(0, 8, 1, 4, 0)
        );
    }
}
