use anyhow::bail;
use ndarray::{Array4, Array5, ArrayView4, Axis};
use vidgen_core::progress::ProgressReporter;
use vidgen_core::tiling::{blend_weights, tiled_scale, tiled_scale_steps, TileParams};
use vidgen_core::upscale::{upscale_batch, upscale_steps};

const TOLERANCE: f32 = 1e-4;

fn nearest(tile: ArrayView4<'_, f32>, scale: usize) -> Array4<f32> {
    let (n, c, h, w) = tile.dim();
    Array4::from_shape_fn((n, c, h * scale, w * scale), |(i, ch, y, x)| {
        tile[[i, ch, y / scale, x / scale]]
    })
}

fn patterned_frames(frames: usize, height: usize, width: usize, seed: usize) -> Array4<f32> {
    Array4::from_shape_fn((frames, 3, height, width), |(f, c, y, x)| {
        let v = (f * 7919 + c * 104_729 + y * 131 + x * 17 + seed * 31) % 1000;
        v as f32 / 1000.0
    })
}

fn assert_close(a: &Array4<f32>, b: &Array4<f32>) {
    assert_eq!(a.shape(), b.shape());
    let worst = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0f32, f32::max);
    assert!(worst <= TOLERANCE, "max abs difference {worst}");
}

#[test]
fn tiled_nearest_matches_whole_frame() {
    // 40 = 16 + 2 * 12 and 52 = 16 + 3 * 12: an exact number of steps.
    let input = patterned_frames(2, 40, 52, 0);
    let params = TileParams::new(16, 4, 2);

    let mut progress = ProgressReporter::new(2 * tiled_scale_steps(52, 40, &params).unwrap());
    let tiled = tiled_scale(input.view(), &params, |t| Ok(nearest(t, 2)), &mut progress).unwrap();

    assert_close(&tiled, &nearest(input.view(), 2));
    assert!(progress.is_complete());
}

#[test]
fn clipped_edge_tiles_still_match() {
    let input = patterned_frames(1, 37, 23, 3);
    let params = TileParams::new(16, 4, 3);

    let mut progress = ProgressReporter::new(tiled_scale_steps(23, 37, &params).unwrap());
    let tiled = tiled_scale(input.view(), &params, |t| Ok(nearest(t, 3)), &mut progress).unwrap();

    assert_close(&tiled, &nearest(input.view(), 3));
}

#[test]
fn pointwise_transform_at_unit_scale() {
    let input = patterned_frames(1, 30, 30, 9);
    let params = TileParams::new(12, 3, 1);

    let mut progress = ProgressReporter::new(tiled_scale_steps(30, 30, &params).unwrap());
    let tiled = tiled_scale(
        input.view(),
        &params,
        |t| Ok(t.mapv(|v| v * 2.0 + 1.0)),
        &mut progress,
    )
    .unwrap();

    assert_close(&tiled, &input.mapv(|v| v * 2.0 + 1.0));
}

#[test]
fn single_tile_when_frame_fits() {
    let input = patterned_frames(1, 8, 8, 1);
    let params = TileParams::new(16, 4, 2);

    assert_eq!(tiled_scale_steps(8, 8, &params).unwrap(), 1);
    let mut progress = ProgressReporter::new(1);
    let tiled = tiled_scale(input.view(), &params, |t| Ok(nearest(t, 2)), &mut progress).unwrap();
    assert_close(&tiled, &nearest(input.view(), 2));
}

#[test]
fn blend_weights_cover_every_pixel() {
    for (w, h) in [(52, 40), (23, 37), (100, 7), (16, 16)] {
        let params = TileParams::new(16, 4, 2);
        let weights = blend_weights(w, h, &params).unwrap();
        assert_eq!(weights.dim(), (h * 2, w * 2));
        assert!(weights.iter().all(|&v| v > 0.0), "zero weight for {w}x{h}");
    }
}

#[test]
fn progress_counts_every_tile_of_every_item() {
    let batch = Array5::from_shape_fn((2, 3, 3, 40, 52), |(b, f, c, y, x)| {
        ((b + f + c + y + x) % 11) as f32 / 11.0
    });
    let params = TileParams::new(16, 4, 2);
    let total = upscale_steps(batch.shape(), &params).unwrap();
    assert_eq!(total, 2 * 3 * tiled_scale_steps(52, 40, &params).unwrap());

    let (tx, rx) = std::sync::mpsc::channel();
    let mut progress = ProgressReporter::with_listener(total, move |snapshot| {
        let _ = tx.send(snapshot.current);
    });
    let mut calls = 0u64;
    upscale_batch(
        batch.view(),
        &params,
        |t| {
            calls += 1;
            Ok(nearest(t, 2))
        },
        &mut progress,
    )
    .unwrap();

    assert_eq!(calls, total);
    assert_eq!(progress.current(), total);
    let counts: Vec<u64> = rx.try_iter().collect();
    assert_eq!(counts.len() as u64, total);
    assert!(counts.windows(2).all(|pair| pair[1] == pair[0] + 1));
}

#[test]
fn transform_failure_aborts_without_partial_result() {
    let input = patterned_frames(1, 40, 52, 0);
    let params = TileParams::new(16, 4, 2);
    let mut progress = ProgressReporter::new(tiled_scale_steps(52, 40, &params).unwrap());

    let mut calls = 0;
    let err = tiled_scale(
        input.view(),
        &params,
        |t| {
            calls += 1;
            if calls == 3 {
                bail!("device lost");
            }
            Ok(nearest(t, 2))
        },
        &mut progress,
    )
    .unwrap_err();

    let message = format!("{err:#}");
    assert!(message.contains("tile transform failed"));
    assert!(message.contains("device lost"));
    assert_eq!(calls, 3);
    assert_eq!(progress.current(), 2);
}

#[test]
fn wrong_tile_shape_is_rejected() {
    let input = patterned_frames(1, 20, 20, 0);
    let params = TileParams::new(16, 4, 2);
    let mut progress = ProgressReporter::new(tiled_scale_steps(20, 20, &params).unwrap());

    let err = tiled_scale(input.view(), &params, |t| Ok(nearest(t, 3)), &mut progress).unwrap_err();
    assert!(err.to_string().contains("expected [1, C"));
}

#[test]
fn batch_items_are_upscaled_independently() {
    let first = patterned_frames(2, 24, 24, 1);
    let second = patterned_frames(2, 24, 24, 2);
    let batch = ndarray::stack(Axis(0), &[first.view(), second.view()]).unwrap();
    let params = TileParams::new(16, 4, 2);

    let mut progress = ProgressReporter::new(upscale_steps(batch.shape(), &params).unwrap());
    let out = upscale_batch(batch.view(), &params, |t| Ok(nearest(t, 2)), &mut progress).unwrap();
    assert_eq!(out.shape(), &[2, 2, 3, 48, 48]);

    for (index, item) in [first, second].iter().enumerate() {
        let mut solo_progress = ProgressReporter::new(0);
        let alone = tiled_scale(item.view(), &params, |t| Ok(nearest(t, 2)), &mut solo_progress)
            .unwrap();
        assert_close(&out.index_axis(Axis(0), index).to_owned(), &alone);
    }
}

#[test]
fn invalid_params_are_rejected_before_any_tile() {
    let input = patterned_frames(1, 20, 20, 0);
    let mut progress = ProgressReporter::new(0);
    let mut calls = 0;

    let err = tiled_scale(
        input.view(),
        &TileParams::new(8, 8, 2),
        |t| {
            calls += 1;
            Ok(nearest(t, 2))
        },
        &mut progress,
    )
    .unwrap_err();
    assert!(err.to_string().contains("too small for overlap"));
    assert_eq!(calls, 0);
}
