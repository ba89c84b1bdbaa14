//! Example: run the tracker on a synthetic translating sequence.
//!
//! Usage:
//!   cargo run --example track_synthetic -- [num_frames] [shift_px_per_frame]
//!
//! Renders a moving blob scene, feeds it through the runtime and prints the
//! per-frame track statistics.

use anyhow::Result;
use nalgebra::Isometry3;

use argus_core::camera::{CameraCalib, PinholeCamera};
use argus_core::config::FlowConfig;
use argus_core::image::Gray16Image;
use argus_frontend::pattern::Pattern;
use argus_frontend::runtime::FlowRuntime;
use argus_frontend::types::FrameInput;

const W: u32 = 640;
const H: u32 = 480;

/// Bright blocks drifting over a shaded background; the block corners are
/// what the detector latches onto.
fn render(shift: f64) -> Gray16Image {
    let mut img = Gray16Image::new(W, H);
    for y in 0..H {
        for x in 0..W {
            let v = 6000.0 + 20.0 * y as f64;
            img.put_pixel(x, y, image::Luma([v.clamp(0.0, 65535.0) as u16]));
        }
    }
    let s = shift.round() as i64;
    for j in 0..5i64 {
        for i in 0..6i64 {
            let x0 = 96 + 80 * i + s;
            let y0 = 80 + 72 * j;
            for y in y0..y0 + 30 {
                for x in x0..x0 + 30 {
                    if x >= 0 && y >= 0 && (x as u32) < W && (y as u32) < H {
                        img.put_pixel(x as u32, y as u32, image::Luma([52000]));
                    }
                }
            }
        }
    }
    img
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let num_frames: usize = args.get(1).map_or(Ok(20), |s| s.parse())?;
    let shift_per_frame: f64 = args.get(2).map_or(Ok(2.0), |s| s.parse())?;

    let calib = CameraCalib::new(
        vec![PinholeCamera::new(
            300.0f32,
            300.0,
            W as f32 / 2.0,
            H as f32 / 2.0,
        )],
        vec![Isometry3::identity()],
    )?;

    let runtime: FlowRuntime<f32, 52> =
        FlowRuntime::spawn(FlowConfig::default(), calib, Pattern::rosette52())?;
    let output = runtime.output();

    for k in 0..num_frames {
        let img = render(shift_per_frame * k as f64);
        runtime.push_frame(FrameInput::new(k as i64 * 50_000_000, vec![Some(img)]));
    }
    runtime.push_null_frame();

    while let Ok(Some(result)) = output.recv() {
        println!(
            "t = {:>12} ns   tracked = {:>4}   depth prior = {:.2}",
            result.t_ns,
            result.num_tracked(0),
            result.depth_guess
        );
    }
    println!("stream finished");

    Ok(())
}
