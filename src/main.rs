//! Stream-driven estimator node.
//!
//! Reads a line protocol on stdin (the transport normally provided by a
//! middleware adapter) and forwards each record into the estimator:
//!
//! ```text
//! imu  <t> <ax> <ay> <az> <gx> <gy> <gz>
//! enc  <t> <speed_left> <speed_right>
//! feat <t> <id> <cam> <x> <y> <vx> <vy>
//! frame <t>                      # flush the pending feature frame
//! restart
//! sensors <use_imu> <use_stereo>
//! ```
//!
//! Odometry outputs are printed as they are published.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::process::ExitCode;

use anyhow::{Context, Result};
use nalgebra::{Vector2, Vector3};
use tracing::{error, info, warn};

use gvio::estimator::output::OutputEvent;
use gvio::features::{FeatureFrame, FeatureObservation};
use gvio::{output_channel, Config, Estimator};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let Some(config_path) = std::env::args().nth(1) else {
        error!("usage: gvio_node <config.yaml>");
        return ExitCode::FAILURE;
    };

    match run(&config_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(config_path: &str) -> Result<()> {
    let cfg = Config::load(config_path)?;
    info!(
        "estimator configured: imu {}, stereo {}, encoder {}, gnss {}",
        cfg.use_imu, cfg.stereo, cfg.encoder_enable, cfg.gnss_enable
    );

    let (tx, rx) = output_channel();
    let mut estimator = Estimator::new(cfg, Some(tx))?;

    let printer = std::thread::spawn(move || {
        while let Ok(event) = rx.recv() {
            match event {
                OutputEvent::Odometry { t, position, .. } => {
                    info!(
                        "odometry t={t:.3} p=[{:.3}, {:.3}, {:.3}]",
                        position.x, position.y, position.z
                    );
                }
                OutputEvent::GnssState { t, ecef_pos, .. } => {
                    info!(
                        "global t={t:.3} ecef=[{:.1}, {:.1}, {:.1}]",
                        ecef_pos.x, ecef_pos.y, ecef_pos.z
                    );
                }
                _ => {}
            }
        }
    });

    let mut pending: BTreeMap<u64, Vec<FeatureObservation>> = FeatureFrame::new();
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("reading input stream")?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() || fields[0].starts_with('#') {
            continue;
        }
        if let Err(e) = dispatch(&estimator, &mut pending, &fields) {
            warn!("skipping malformed record: {e:#}");
        }
    }

    estimator.shutdown();
    drop(estimator);
    let _ = printer.join();
    Ok(())
}

fn dispatch(
    estimator: &Estimator,
    pending: &mut FeatureFrame,
    fields: &[&str],
) -> Result<()> {
    let num = |i: usize| -> Result<f64> {
        fields
            .get(i)
            .with_context(|| format!("missing field {i}"))?
            .parse::<f64>()
            .with_context(|| format!("bad number in field {i}"))
    };

    match fields[0] {
        "imu" => {
            let t = num(1)?;
            let acc = Vector3::new(num(2)?, num(3)?, num(4)?);
            let gyr = Vector3::new(num(5)?, num(6)?, num(7)?);
            estimator.input_imu(t, acc, gyr);
        }
        "enc" => {
            estimator.input_encoder(num(1)?, num(2)?, num(3)?);
        }
        "feat" => {
            let id = num(2)? as u64;
            let cam = num(3)? as usize;
            pending.entry(id).or_default().push(FeatureObservation {
                camera_id: cam,
                point: Vector3::new(num(4)?, num(5)?, 1.0),
                velocity: Vector2::new(num(6)?, num(7)?),
            });
        }
        "frame" => {
            let t = num(1)?;
            let frame = std::mem::take(pending);
            estimator.input_feature(t, frame);
        }
        "restart" => {
            estimator.restart();
        }
        "sensors" => {
            estimator.change_sensor_type(num(1)? != 0.0, num(2)? != 0.0);
        }
        other => anyhow::bail!("unknown record type {other:?}"),
    }
    Ok(())
}
