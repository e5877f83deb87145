//! Time-indexed sensor buffers shared between the input callbacks and the
//! measurement dispatcher.
//!
//! Each stream is a min-heap keyed by timestamp so samples may arrive out
//! of order; the dispatcher drains them monotonically through the
//! interval extractors. The owning mutex is held only for push/extract,
//! never while processing.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use nalgebra::{Vector3, Vector6};

use crate::features::FeatureFrame;
use crate::gnss::GnssObservation;

/// A timestamped payload ordered for a min-heap.
struct Timed<T> {
    t: f64,
    data: Arc<T>,
}

impl<T> Clone for Timed<T> {
    fn clone(&self) -> Self {
        Self {
            t: self.t,
            data: self.data.clone(),
        }
    }
}

impl<T> PartialEq for Timed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.t == other.t
    }
}
impl<T> Eq for Timed<T> {}
impl<T> PartialOrd for Timed<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Timed<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap pops the earliest timestamp first
        other.t.total_cmp(&self.t)
    }
}

/// A GNSS epoch: the observation batch of one receiver measurement.
pub type GnssBatch = Vec<GnssObservation>;

/// All sensor queues plus the latest-arrival watermarks the dispatcher
/// waits on.
#[derive(Default)]
pub struct SensorBuffers {
    acc: BinaryHeap<Timed<Vector3<f64>>>,
    gyr: BinaryHeap<Timed<Vector3<f64>>>,
    enc: BinaryHeap<Timed<Vector6<f64>>>,
    feature: BinaryHeap<Timed<FeatureFrame>>,
    gnss: BinaryHeap<Timed<GnssBatch>>,

    pub latest_imu_time: f64,
    pub latest_encoder_time: f64,
    pub latest_gnss_time: f64,
}

impl SensorBuffers {
    pub fn new() -> Self {
        Self {
            latest_imu_time: f64::MIN,
            latest_encoder_time: f64::MIN,
            latest_gnss_time: f64::MIN,
            ..Default::default()
        }
    }

    pub fn clear(&mut self) {
        self.acc.clear();
        self.gyr.clear();
        self.enc.clear();
        self.feature.clear();
        self.gnss.clear();
    }

    pub fn push_imu(&mut self, t: f64, acc: Vector3<f64>, gyr: Vector3<f64>) {
        self.latest_imu_time = self.latest_imu_time.max(t);
        self.acc.push(Timed { t, data: Arc::new(acc) });
        self.gyr.push(Timed { t, data: Arc::new(gyr) });
    }

    pub fn push_encoder(&mut self, t: f64, vel: Vector6<f64>) {
        self.latest_encoder_time = self.latest_encoder_time.max(t);
        self.enc.push(Timed { t, data: Arc::new(vel) });
    }

    pub fn push_feature(&mut self, t: f64, frame: FeatureFrame) {
        self.feature.push(Timed { t, data: Arc::new(frame) });
    }

    pub fn push_gnss(&mut self, t: f64, batch: GnssBatch) {
        self.latest_gnss_time = self.latest_gnss_time.max(t);
        self.gnss.push(Timed { t, data: Arc::new(batch) });
    }

    pub fn has_feature(&self) -> bool {
        !self.feature.is_empty()
    }

    /// Earliest pending feature frame without removing it.
    pub fn peek_feature_time(&self) -> Option<f64> {
        self.feature.peek().map(|f| f.t)
    }

    pub fn pop_feature(&mut self) -> Option<(f64, Arc<FeatureFrame>)> {
        self.feature.pop().map(|f| (f.t, f.data))
    }

    /// Extracts IMU samples covering `(t0, t1]`: samples at or before `t0`
    /// are discarded, samples before `t1` are drained, and the first
    /// sample at or after `t1` is appended as the boundary for the
    /// caller's interpolation.
    pub fn imu_interval(
        &mut self,
        t0: f64,
        t1: f64,
    ) -> Option<(Vec<(f64, Vector3<f64>)>, Vec<(f64, Vector3<f64>)>)> {
        if self.acc.is_empty() || self.latest_imu_time < t1 {
            return None;
        }
        while self.acc.peek().map_or(false, |s| s.t <= t0) {
            self.acc.pop();
            self.gyr.pop();
        }
        let mut acc_v = Vec::new();
        let mut gyr_v = Vec::new();
        while self.acc.peek().map_or(false, |s| s.t < t1) {
            let a = self.acc.pop().expect("peeked");
            let g = self.gyr.pop().expect("acc and gyr stay paired");
            acc_v.push((a.t, *a.data));
            gyr_v.push((g.t, *g.data));
        }
        let a = self.acc.peek()?;
        let g = self.gyr.peek()?;
        acc_v.push((a.t, *a.data));
        gyr_v.push((g.t, *g.data));
        Some((acc_v, gyr_v))
    }

    /// Extracts encoder samples with the same boundary policy as the IMU,
    /// re-pushing the last-but-one sample so the next extraction still
    /// sees continuous history at the low side.
    pub fn encoder_interval(&mut self, t0: f64, t1: f64) -> Option<Vec<(f64, Vector6<f64>)>> {
        if self.enc.is_empty() || self.latest_encoder_time < t1 {
            return None;
        }
        while self.enc.peek().map_or(false, |s| s.t <= t0) {
            self.enc.pop();
        }
        let mut out = Vec::new();
        while self.enc.peek().map_or(false, |s| s.t < t1) {
            let e = self.enc.pop().expect("peeked");
            out.push((e.t, *e.data));
        }
        let boundary = self.enc.peek()?;
        out.push((boundary.t, *boundary.data));
        if out.len() >= 2 {
            let (t, v) = out[out.len() - 2];
            self.enc.push(Timed { t, data: Arc::new(v) });
        }
        Some(out)
    }

    /// Extracts GNSS batches in `(t0, t1)`; the boundary epoch is not
    /// duplicated.
    pub fn gnss_interval(&mut self, t0: f64, t1: f64) -> Vec<(f64, Arc<GnssBatch>)> {
        while self.gnss.peek().map_or(false, |s| s.t <= t0) {
            self.gnss.pop();
        }
        let mut out = Vec::new();
        while self.gnss.peek().map_or(false, |s| s.t < t1) {
            let b = self.gnss.pop().expect("peeked");
            out.push((b.t, b.data));
        }
        out
    }

    /// Snapshot of the pending IMU stream, oldest first, for the fast
    /// predictor's replay.
    pub fn imu_snapshot(&self) -> Vec<(f64, Vector3<f64>, Vector3<f64>)> {
        let mut acc: Vec<_> = self.acc.iter().map(|s| (s.t, *s.data)).collect();
        let mut gyr: Vec<_> = self.gyr.iter().map(|s| (s.t, *s.data)).collect();
        acc.sort_by(|a, b| a.0.total_cmp(&b.0));
        gyr.sort_by(|a, b| a.0.total_cmp(&b.0));
        acc.iter()
            .zip(gyr.iter())
            .map(|(a, g)| (a.0, a.1, g.1))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.acc.is_empty() && self.feature.is_empty() && self.gnss.is_empty() && self.enc.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imu_buffers_with(times: &[f64]) -> SensorBuffers {
        let mut b = SensorBuffers::new();
        for &t in times {
            b.push_imu(t, Vector3::new(t, 0.0, 0.0), Vector3::zeros());
        }
        b
    }

    #[test]
    fn imu_extraction_keeps_boundary_sample() {
        let mut b = imu_buffers_with(&[0.00, 0.01, 0.02, 0.03, 0.04, 0.05]);
        let (acc, gyr) = b.imu_interval(0.005, 0.035).unwrap();
        let times: Vec<f64> = acc.iter().map(|s| s.0).collect();
        assert_eq!(times, vec![0.01, 0.02, 0.03, 0.04]);
        assert_eq!(acc.len(), gyr.len());
        // the boundary sample stays in the heap for the next interval
        let (acc2, _) = b.imu_interval(0.035, 0.045).unwrap();
        let times2: Vec<f64> = acc2.iter().map(|s| s.0).collect();
        assert_eq!(times2, vec![0.04, 0.05]);
    }

    #[test]
    fn imu_extraction_waits_for_coverage() {
        let mut b = imu_buffers_with(&[0.00, 0.01]);
        assert!(b.imu_interval(0.0, 0.05).is_none());
    }

    #[test]
    fn imu_extraction_with_early_frame_still_yields_boundary() {
        // feature frame arriving barely after t0 must still produce a
        // non-empty vector with the boundary present
        let mut b = imu_buffers_with(&[0.00, 0.01, 0.02]);
        let (acc, _) = b.imu_interval(0.012, 0.013).unwrap();
        assert_eq!(acc.len(), 1);
        assert!(acc[0].0 >= 0.013);
    }

    #[test]
    fn encoder_extraction_repushes_last_but_one() {
        let mut b = SensorBuffers::new();
        for t in [0.0, 0.1, 0.2, 0.3] {
            b.push_encoder(t, Vector6::repeat(t));
        }
        let v = b.encoder_interval(0.05, 0.25).unwrap();
        let times: Vec<f64> = v.iter().map(|s| s.0).collect();
        assert_eq!(times, vec![0.1, 0.2, 0.3]);
        // 0.2 was re-pushed: extraction restarted below 0.3 still sees it
        let v2 = b.encoder_interval(0.15, 0.28).unwrap();
        assert!(v2.iter().any(|s| s.0 == 0.2));
    }

    #[test]
    fn gnss_extraction_does_not_duplicate_boundary() {
        let mut b = SensorBuffers::new();
        for t in [0.0, 1.0, 2.0, 3.0] {
            b.push_gnss(t, vec![]);
        }
        let v = b.gnss_interval(0.5, 2.5);
        let times: Vec<f64> = v.iter().map(|s| s.0).collect();
        assert_eq!(times, vec![1.0, 2.0]);
        let v2 = b.gnss_interval(2.5, 3.5);
        let times2: Vec<f64> = v2.iter().map(|s| s.0).collect();
        assert_eq!(times2, vec![3.0]);
    }

    #[test]
    fn out_of_order_arrival_is_sorted_out() {
        let mut b = SensorBuffers::new();
        for &t in &[0.02, 0.00, 0.03, 0.01, 0.04] {
            b.push_imu(t, Vector3::zeros(), Vector3::zeros());
        }
        let (acc, _) = b.imu_interval(-0.5, 0.035).unwrap();
        let times: Vec<f64> = acc.iter().map(|s| s.0).collect();
        assert_eq!(times, vec![0.0, 0.01, 0.02, 0.03, 0.04]);
    }
}
