//! Schur-complement marginalization: turns the factors touching evicted
//! parameter blocks into a linearized prior on the surviving blocks.
//!
//! `pre_marginalize` evaluates every collected factor at the current
//! linearization point; `marginalize` assembles the dense information
//! system, eliminates the drop set, and stores the square-root form
//! `(J, r)` of the remaining information. The prior is re-attached to the
//! next window through a key-shift table built at slide time.

use std::collections::BTreeMap;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Quaternion, UnitQuaternion, Vector3};
use tracing::warn;

use super::{BlockKey, Factor, Loss, Manifold};
use crate::geometry::so3::positify;

/// Eigenvalue floor when inverting the dropped-block information.
const EIG_EPS: f64 = 1e-8;

/// One factor scheduled for marginalization, with the indices of its
/// parameter blocks that belong to the drop set.
pub struct ResidualBlockInfo {
    pub factor: Box<dyn Factor>,
    pub loss: Loss,
    pub keys: Vec<BlockKey>,
    pub drop_set: Vec<usize>,
    residuals: DVector<f64>,
    jacobians: Vec<DMatrix<f64>>,
}

impl ResidualBlockInfo {
    pub fn new(
        factor: Box<dyn Factor>,
        loss: Loss,
        keys: Vec<BlockKey>,
        drop_set: Vec<usize>,
    ) -> Self {
        Self {
            factor,
            loss,
            keys,
            drop_set,
            residuals: DVector::zeros(0),
            jacobians: Vec::new(),
        }
    }

    fn evaluate(&mut self, values: &BTreeMap<BlockKey, BlockState>) {
        let params: Vec<&[f64]> = self
            .keys
            .iter()
            .map(|k| values[k].values.as_slice())
            .collect();
        let nr = self.factor.num_residuals();
        let sizes = self.factor.param_block_sizes();
        let mut r = vec![0.0; nr];
        let mut jacs: Vec<Option<DMatrix<f64>>> =
            sizes.iter().map(|s| Some(DMatrix::zeros(nr, *s))).collect();
        if !self.factor.evaluate(&params, &mut r, Some(&mut jacs)) {
            warn!("marginalization factor evaluation failed");
        }

        let mut rv = DVector::from_column_slice(&r);
        let (_, rho_p) = self.loss.evaluate(rv.norm_squared());
        let w = rho_p.sqrt();
        rv *= w;
        self.residuals = rv;
        self.jacobians = jacs
            .into_iter()
            .map(|j| j.expect("jacobian requested") * w)
            .collect();
    }
}

#[derive(Clone)]
struct BlockState {
    values: Vec<f64>,
    manifold: Manifold,
}

/// Collected linearization state and, after `marginalize`, the prior.
pub struct MarginalizationInfo {
    residual_blocks: Vec<ResidualBlockInfo>,
    block_state: BTreeMap<BlockKey, BlockState>,
    drop_keys: Vec<BlockKey>,

    keep_keys: Vec<BlockKey>,
    keep_x0: Vec<Vec<f64>>,
    keep_manifolds: Vec<Manifold>,
    linearized_jacobian: DMatrix<f64>,
    linearized_residual: DVector<f64>,
    pub valid: bool,
}

impl Default for MarginalizationInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl MarginalizationInfo {
    pub fn new() -> Self {
        Self {
            residual_blocks: Vec::new(),
            block_state: BTreeMap::new(),
            drop_keys: Vec::new(),
            keep_keys: Vec::new(),
            keep_x0: Vec::new(),
            keep_manifolds: Vec::new(),
            linearized_jacobian: DMatrix::zeros(0, 0),
            linearized_residual: DVector::zeros(0),
            valid: false,
        }
    }

    /// Registers a factor together with the current values of the blocks it
    /// touches. Indices in `drop_set` select the blocks to eliminate.
    pub fn add_residual_block(
        &mut self,
        factor: Box<dyn Factor>,
        loss: Loss,
        keys: Vec<BlockKey>,
        values: Vec<Vec<f64>>,
        manifolds: Vec<Manifold>,
        drop_set: Vec<usize>,
    ) {
        debug_assert_eq!(keys.len(), values.len());
        debug_assert_eq!(keys.len(), manifolds.len());
        for (i, k) in keys.iter().enumerate() {
            self.block_state.entry(*k).or_insert_with(|| BlockState {
                values: values[i].clone(),
                manifold: manifolds[i],
            });
            if drop_set.contains(&i) && !self.drop_keys.contains(k) {
                self.drop_keys.push(*k);
            }
        }
        self.residual_blocks
            .push(ResidualBlockInfo::new(factor, loss, keys, drop_set));
    }

    pub fn has_blocks(&self) -> bool {
        !self.residual_blocks.is_empty()
    }

    /// Evaluates every factor at the stored linearization point.
    pub fn pre_marginalize(&mut self) {
        let state = self.block_state.clone();
        for rb in &mut self.residual_blocks {
            rb.evaluate(&state);
        }
    }

    /// Schur-complements the drop set out of the assembled information.
    pub fn marginalize(&mut self) {
        // local offsets: dropped blocks first
        let mut offsets: BTreeMap<BlockKey, (usize, usize)> = BTreeMap::new();
        let mut m = 0usize;
        for k in &self.drop_keys {
            let st = &self.block_state[k];
            let l = st.manifold.local_size(st.values.len());
            offsets.insert(*k, (m, l));
            m += l;
        }
        let mut n = 0usize;
        for (k, st) in &self.block_state {
            if offsets.contains_key(k) {
                continue;
            }
            let l = st.manifold.local_size(st.values.len());
            offsets.insert(*k, (m + n, l));
            self.keep_keys.push(*k);
            self.keep_x0.push(st.values.clone());
            self.keep_manifolds.push(st.manifold);
            n += l;
        }

        if n == 0 {
            self.valid = false;
            return;
        }

        let total = m + n;
        let mut h = DMatrix::zeros(total, total);
        let mut b = DVector::zeros(total);

        for rb in &self.residual_blocks {
            for (a, ka) in rb.keys.iter().enumerate() {
                let (oa, la) = offsets[ka];
                let ja = rb.jacobians[a].columns(0, la).into_owned();
                let jt_r = ja.transpose() * &rb.residuals;
                for i in 0..la {
                    b[oa + i] += jt_r[i];
                }
                for (c, kc) in rb.keys.iter().enumerate() {
                    let (oc, lc) = offsets[kc];
                    let jc = rb.jacobians[c].columns(0, lc).into_owned();
                    let block = ja.transpose() * jc;
                    for i in 0..la {
                        for j in 0..lc {
                            h[(oa + i, oc + j)] += block[(i, j)];
                        }
                    }
                }
            }
        }

        let (h_keep, b_keep) = if m == 0 {
            (h, b)
        } else {
            let amm = {
                let raw = h.view((0, 0), (m, m)).into_owned();
                0.5 * (&raw + raw.transpose())
            };
            let amm_inv = pseudo_inverse(&amm);
            let bmm = b.rows(0, m).into_owned();
            let hnm = h.view((m, 0), (n, m)).into_owned();
            let hmn = h.view((0, m), (m, n)).into_owned();
            let hnn = h.view((m, m), (n, n)).into_owned();
            let bnn = b.rows(m, n).into_owned();
            (&hnn - &hnm * &amm_inv * &hmn, &bnn - &hnm * &amm_inv * &bmm)
        };

        // square root of the kept information for use as a cost term
        let sym = 0.5 * (&h_keep + h_keep.transpose());
        let eig = nalgebra::SymmetricEigen::new(sym);
        let mut s = DVector::zeros(n);
        let mut s_inv = DVector::zeros(n);
        for i in 0..n {
            if eig.eigenvalues[i] > EIG_EPS {
                s[i] = eig.eigenvalues[i].sqrt();
                s_inv[i] = 1.0 / s[i];
            }
        }
        let vt = eig.eigenvectors.transpose();
        let mut jac = vt.clone();
        let mut res_rows = vt * &b_keep;
        for i in 0..n {
            for j in 0..n {
                jac[(i, j)] *= s[i];
            }
            res_rows[i] *= s_inv[i];
        }
        self.linearized_jacobian = jac;
        self.linearized_residual = res_rows;
        self.valid = true;
    }

    /// Kept keys after applying the slide-time shift table; order matches
    /// the prior's block layout.
    pub fn parameter_blocks(&self, shift: &BTreeMap<BlockKey, BlockKey>) -> Vec<BlockKey> {
        self.keep_keys
            .iter()
            .map(|k| *shift.get(k).unwrap_or(k))
            .collect()
    }

    pub fn keep_block_count(&self) -> usize {
        self.keep_keys.len()
    }
}

/// Moore-Penrose inverse through the symmetric eigendecomposition, with
/// small eigenvalues zeroed.
fn pseudo_inverse(m: &DMatrix<f64>) -> DMatrix<f64> {
    let n = m.nrows();
    let eig = nalgebra::SymmetricEigen::new(m.clone());
    let mut inv = DMatrix::zeros(n, n);
    for i in 0..n {
        let ev = eig.eigenvalues[i];
        if ev.abs() > EIG_EPS {
            let col = eig.eigenvectors.column(i);
            inv += (1.0 / ev) * &col * col.transpose();
        }
    }
    inv
}

/// Linearized prior `r + J·δx` over the surviving parameter blocks.
pub struct MarginalizationFactor {
    info: Arc<MarginalizationInfo>,
}

impl MarginalizationFactor {
    pub fn new(info: Arc<MarginalizationInfo>) -> Self {
        Self { info }
    }
}

impl Factor for MarginalizationFactor {
    fn num_residuals(&self) -> usize {
        self.info.linearized_residual.len()
    }

    fn param_block_sizes(&self) -> Vec<usize> {
        self.info.keep_x0.iter().map(|x| x.len()).collect()
    }

    fn evaluate(
        &self,
        params: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [Option<DMatrix<f64>>]>,
    ) -> bool {
        let n = self.info.linearized_residual.len();
        let mut dx = DVector::zeros(n);
        let mut offset = 0usize;
        for (idx, x0) in self.info.keep_x0.iter().enumerate() {
            let x = params[idx];
            match self.info.keep_manifolds[idx] {
                Manifold::Euclidean => {
                    for i in 0..x0.len() {
                        dx[offset + i] = x[i] - x0[i];
                    }
                    offset += x0.len();
                }
                Manifold::Pose => {
                    for i in 0..3 {
                        dx[offset + i] = x[i] - x0[i];
                    }
                    let q0 = UnitQuaternion::from_quaternion(Quaternion::new(
                        x0[6], x0[3], x0[4], x0[5],
                    ));
                    let q = UnitQuaternion::from_quaternion(Quaternion::new(
                        x[6], x[3], x[4], x[5],
                    ));
                    let dq = positify(&(q0.inverse() * q));
                    let v: Vector3<f64> = 2.0 * dq.imag();
                    dx[offset + 3] = v.x;
                    dx[offset + 4] = v.y;
                    dx[offset + 5] = v.z;
                    offset += 6;
                }
            }
        }

        let r = &self.info.linearized_residual + &self.info.linearized_jacobian * dx;
        for i in 0..n {
            residuals[i] = r[i];
        }

        if let Some(jacs) = jacobians {
            let mut col = 0usize;
            for (idx, x0) in self.info.keep_x0.iter().enumerate() {
                let local = self.info.keep_manifolds[idx].local_size(x0.len());
                if let Some(j) = jacs[idx].as_mut() {
                    j.fill(0.0);
                    j.view_mut((0, 0), (n, local))
                        .copy_from(&self.info.linearized_jacobian.columns(col, local));
                }
                col += local;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// r = x - y on two scalar blocks, unit information.
    struct Tie;
    impl Factor for Tie {
        fn num_residuals(&self) -> usize {
            1
        }
        fn param_block_sizes(&self) -> Vec<usize> {
            vec![1, 1]
        }
        fn evaluate(
            &self,
            params: &[&[f64]],
            residuals: &mut [f64],
            jacobians: Option<&mut [Option<DMatrix<f64>>]>,
        ) -> bool {
            residuals[0] = params[0][0] - params[1][0];
            if let Some(jacs) = jacobians {
                if let Some(j) = jacs[0].as_mut() {
                    j[(0, 0)] = 1.0;
                }
                if let Some(j) = jacs[1].as_mut() {
                    j[(0, 0)] = -1.0;
                }
            }
            true
        }
    }

    /// r = x - c anchor on one scalar block.
    struct Anchor(f64);
    impl Factor for Anchor {
        fn num_residuals(&self) -> usize {
            1
        }
        fn param_block_sizes(&self) -> Vec<usize> {
            vec![1]
        }
        fn evaluate(
            &self,
            params: &[&[f64]],
            residuals: &mut [f64],
            jacobians: Option<&mut [Option<DMatrix<f64>>]>,
        ) -> bool {
            residuals[0] = params[0][0] - self.0;
            if let Some(jacs) = jacobians {
                if let Some(j) = jacs[0].as_mut() {
                    j[(0, 0)] = 1.0;
                }
            }
            true
        }
    }

    #[test]
    fn marginalizing_anchored_block_transfers_information() {
        // x anchored at 3, tied to y; marginalize x ⇒ prior pulls y to 3.
        let kx = BlockKey(1);
        let ky = BlockKey(2);
        let mut info = MarginalizationInfo::new();
        info.add_residual_block(
            Box::new(Anchor(3.0)),
            Loss::Trivial,
            vec![kx],
            vec![vec![3.0]],
            vec![Manifold::Euclidean],
            vec![0],
        );
        info.add_residual_block(
            Box::new(Tie),
            Loss::Trivial,
            vec![kx, ky],
            vec![vec![3.0], vec![3.0]],
            vec![Manifold::Euclidean, Manifold::Euclidean],
            vec![0],
        );
        info.pre_marginalize();
        info.marginalize();
        assert!(info.valid);
        assert_eq!(info.keep_block_count(), 1);

        let factor = MarginalizationFactor::new(Arc::new(info));
        // residual at y = 3 is zero
        let mut r = vec![0.0; factor.num_residuals()];
        assert!(factor.evaluate(&[&[3.0]], &mut r, None));
        assert!(r.iter().all(|v| v.abs() < 1e-9));

        // moving y produces a restoring residual with half the information
        // of the original pair (chain of two unit-information ties)
        let mut r2 = vec![0.0; factor.num_residuals()];
        factor.evaluate(&[&[5.0]], &mut r2, None);
        let cost: f64 = r2.iter().map(|v| v * v).sum();
        assert!((cost - 2.0).abs() < 1e-9, "cost {}", cost);
    }

    #[test]
    fn shift_table_renames_kept_blocks() {
        let kx = BlockKey(1);
        let ky = BlockKey(2);
        let mut info = MarginalizationInfo::new();
        info.add_residual_block(
            Box::new(Tie),
            Loss::Trivial,
            vec![kx, ky],
            vec![vec![0.0], vec![0.0]],
            vec![Manifold::Euclidean, Manifold::Euclidean],
            vec![0],
        );
        info.pre_marginalize();
        info.marginalize();

        let mut shift = BTreeMap::new();
        shift.insert(ky, BlockKey(9));
        assert_eq!(info.parameter_blocks(&shift), vec![BlockKey(9)]);
    }
}
