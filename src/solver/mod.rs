//! Nonlinear least-squares problem consumed through a cost-function +
//! parameter-block interface.
//!
//! Factors expose `evaluate(params) -> residuals, jacobians` plus their
//! block sizes; the problem assembles the Gauss-Newton system in tangent
//! space and runs a dogleg trust-region loop with dense Schur elimination
//! of the scalar inverse-depth blocks.
//!
//! Jacobian contract: factors produce derivatives with respect to the
//! **tangent** parameterization, stored in the leading columns of a
//! `num_residuals × global_size` matrix. For pose blocks (7 ambient,
//! 6 tangent `[δp, δθ]`) the seventh column is zero; the update applied
//! afterwards is `p += δp`, `q ← q ⊗ δq(½δθ)` normalized.

pub mod marginalization;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

use crate::geometry::so3::delta_q;

/// Opaque identity of a parameter block. The estimator derives keys from
/// its own slot layout; the solver only compares them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockKey(pub u64);

/// Parameterization of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Manifold {
    /// Plain Euclidean block, tangent size equals global size.
    Euclidean,
    /// Position + unit quaternion `[p, q_xyzw]`: 7 ambient, 6 tangent.
    Pose,
}

impl Manifold {
    pub fn local_size(&self, global: usize) -> usize {
        match self {
            Manifold::Euclidean => global,
            Manifold::Pose => 6,
        }
    }

    /// Applies a tangent step to ambient coordinates in place.
    pub fn plus(&self, x: &mut [f64], dx: &[f64]) {
        match self {
            Manifold::Euclidean => {
                for (xi, di) in x.iter_mut().zip(dx.iter()) {
                    *xi += di;
                }
            }
            Manifold::Pose => {
                x[0] += dx[0];
                x[1] += dx[1];
                x[2] += dx[2];
                let q = nalgebra::UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
                    x[6], x[3], x[4], x[5],
                ));
                let dq = delta_q(&nalgebra::Vector3::new(dx[3], dx[4], dx[5]));
                let q_new = q * dq;
                x[3] = q_new.i;
                x[4] = q_new.j;
                x[5] = q_new.k;
                x[6] = q_new.w;
            }
        }
    }
}

/// Robust loss applied to a residual block.
#[derive(Debug, Clone, Copy)]
pub enum Loss {
    Trivial,
    /// Huber with the given threshold on the residual norm.
    Huber(f64),
}

impl Loss {
    /// Returns `(ρ(s), ρ'(s))` for the squared residual norm `s`.
    pub fn evaluate(&self, s: f64) -> (f64, f64) {
        match *self {
            Loss::Trivial => (s, 1.0),
            Loss::Huber(delta) => {
                let d2 = delta * delta;
                if s <= d2 {
                    (s, 1.0)
                } else {
                    let sqrt_s = s.sqrt();
                    (2.0 * delta * sqrt_s - d2, delta / sqrt_s)
                }
            }
        }
    }
}

/// A measurement residual with analytic Jacobians.
pub trait Factor: Send + Sync {
    fn num_residuals(&self) -> usize;
    /// Global (ambient) size of each parameter block, in call order.
    fn param_block_sizes(&self) -> Vec<usize>;
    /// Fills `residuals` and, when given, one `num_residuals × global`
    /// Jacobian per block. Returns `false` if evaluation failed.
    fn evaluate(
        &self,
        params: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [Option<DMatrix<f64>>]>,
    ) -> bool;
}

struct ParamBlock {
    values: Vec<f64>,
    manifold: Manifold,
    constant: bool,
    /// Marked blocks are Schur-eliminated before the reduced solve.
    eliminate: bool,
}

struct ResidualBlock {
    factor: Box<dyn Factor>,
    loss: Loss,
    keys: Vec<BlockKey>,
}

/// Solver configuration mirroring the optimizer caps of the estimator.
#[derive(Debug, Clone, Copy)]
pub struct SolverOptions {
    pub max_iterations: usize,
    pub max_time: Duration,
    pub initial_trust_radius: f64,
    pub gradient_tolerance: f64,
    pub step_tolerance: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            max_time: Duration::from_millis(40),
            initial_trust_radius: 1e4,
            gradient_tolerance: 1e-10,
            step_tolerance: 1e-10,
        }
    }
}

/// Summary of a solve.
#[derive(Debug, Clone, Copy, Default)]
pub struct SolverSummary {
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
}

/// A nonlinear least-squares problem over keyed parameter blocks.
#[derive(Default)]
pub struct Problem {
    blocks: BTreeMap<BlockKey, ParamBlock>,
    residuals: Vec<ResidualBlock>,
}

impl Problem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or refreshes) a parameter block.
    pub fn add_parameter_block(&mut self, key: BlockKey, values: &[f64], manifold: Manifold) {
        self.blocks.insert(
            key,
            ParamBlock {
                values: values.to_vec(),
                manifold,
                constant: false,
                eliminate: false,
            },
        );
    }

    /// Marks a block for Schur elimination (landmark depth blocks).
    pub fn mark_eliminated(&mut self, key: BlockKey) {
        if let Some(b) = self.blocks.get_mut(&key) {
            b.eliminate = true;
        }
    }

    pub fn set_parameter_block_constant(&mut self, key: BlockKey) {
        if let Some(b) = self.blocks.get_mut(&key) {
            b.constant = true;
        }
    }

    pub fn parameter(&self, key: BlockKey) -> Option<&[f64]> {
        self.blocks.get(&key).map(|b| b.values.as_slice())
    }

    pub fn manifold(&self, key: BlockKey) -> Option<Manifold> {
        self.blocks.get(&key).map(|b| b.manifold)
    }

    pub fn add_residual_block(&mut self, factor: Box<dyn Factor>, loss: Loss, keys: Vec<BlockKey>) {
        debug_assert_eq!(factor.param_block_sizes().len(), keys.len());
        self.residuals.push(ResidualBlock { factor, loss, keys });
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.residuals.len()
    }

    /// Total cost `½ Σ ρ(‖r‖²)` at the given assignment.
    fn cost(&self, values: &BTreeMap<BlockKey, Vec<f64>>) -> f64 {
        let mut cost = 0.0;
        for rb in &self.residuals {
            let params: Vec<&[f64]> = rb.keys.iter().map(|k| values[k].as_slice()).collect();
            let mut r = vec![0.0; rb.factor.num_residuals()];
            if !rb.factor.evaluate(&params, &mut r, None) {
                continue;
            }
            let s: f64 = r.iter().map(|v| v * v).sum();
            cost += 0.5 * rb.loss.evaluate(s).0;
        }
        cost
    }

    /// Runs the dogleg loop and writes the result back into the blocks.
    pub fn solve(&mut self, options: &SolverOptions) -> SolverSummary {
        let start = Instant::now();

        // tangent layout: free variable blocks first, eliminated last
        let mut offsets: BTreeMap<BlockKey, (usize, usize)> = BTreeMap::new(); // (offset, local)
        let mut nv = 0usize;
        for (k, b) in &self.blocks {
            if b.constant || b.eliminate {
                continue;
            }
            let l = b.manifold.local_size(b.values.len());
            offsets.insert(*k, (nv, l));
            nv += l;
        }
        let mut ne = 0usize;
        for (k, b) in &self.blocks {
            if b.constant || !b.eliminate {
                continue;
            }
            let l = b.manifold.local_size(b.values.len());
            offsets.insert(*k, (nv + ne, l));
            ne += l;
        }
        let n = nv + ne;
        if n == 0 || self.residuals.is_empty() {
            return SolverSummary::default();
        }

        let mut values: BTreeMap<BlockKey, Vec<f64>> = self
            .blocks
            .iter()
            .map(|(k, b)| (*k, b.values.clone()))
            .collect();

        let mut summary = SolverSummary {
            initial_cost: self.cost(&values),
            ..Default::default()
        };
        let mut cost = summary.initial_cost;
        let mut radius = options.initial_trust_radius;

        for iter in 0..options.max_iterations {
            if start.elapsed() > options.max_time && iter > 0 {
                debug!("solver time cap hit after {iter} iterations");
                break;
            }

            let (h, g) = self.build_normal_equations(&values, &offsets, n);
            let grad_norm = g.norm();
            if grad_norm < options.gradient_tolerance {
                break;
            }

            let gn = match solve_schur(&h, &g, nv, ne) {
                Some(dx) => dx,
                None => {
                    warn!("Schur solve failed, damping and retrying");
                    let mut hd = h.clone();
                    for i in 0..n {
                        hd[(i, i)] += 1e-6 * hd[(i, i)].abs().max(1e-8);
                    }
                    match solve_schur(&hd, &g, nv, ne) {
                        Some(dx) => dx,
                        None => break,
                    }
                }
            };

            // dogleg step within the trust region
            let g_h_g = (g.transpose() * &h * &g)[(0, 0)];
            let step = if gn.norm() <= radius {
                gn.clone()
            } else if g_h_g <= 0.0 {
                -&g * (radius / grad_norm)
            } else {
                let alpha = g.norm_squared() / g_h_g;
                let cauchy = -&g * alpha;
                if cauchy.norm() >= radius {
                    -&g * (radius / grad_norm)
                } else {
                    // blend point on the segment cauchy → gn hitting the boundary
                    let d = &gn - &cauchy;
                    let a = d.norm_squared();
                    let b = 2.0 * cauchy.dot(&d);
                    let c = cauchy.norm_squared() - radius * radius;
                    let disc = (b * b - 4.0 * a * c).max(0.0).sqrt();
                    let beta = (-b + disc) / (2.0 * a);
                    &cauchy + d * beta
                }
            };

            if step.norm() < options.step_tolerance {
                break;
            }

            // predicted reduction of the quadratic model
            let predicted = -(g.dot(&step)) - 0.5 * (step.transpose() * &h * &step)[(0, 0)];

            let trial = self.apply_step(&values, &offsets, &step);
            let trial_cost = self.cost(&trial);
            let actual = cost - trial_cost;
            let rho = if predicted.abs() > 1e-18 { actual / predicted } else { -1.0 };

            if rho > 0.0 && actual > 0.0 {
                values = trial;
                cost = trial_cost;
                if rho > 0.75 {
                    radius = (2.0 * radius).min(1e8);
                } else if rho < 0.25 {
                    radius *= 0.5;
                }
            } else {
                radius *= 0.25;
                if radius < 1e-12 {
                    break;
                }
            }
            summary.iterations = iter + 1;
        }

        for (k, v) in values {
            if let Some(b) = self.blocks.get_mut(&k) {
                b.values = v;
            }
        }
        summary.final_cost = cost;
        summary
    }

    fn build_normal_equations(
        &self,
        values: &BTreeMap<BlockKey, Vec<f64>>,
        offsets: &BTreeMap<BlockKey, (usize, usize)>,
        n: usize,
    ) -> (DMatrix<f64>, DVector<f64>) {
        let mut h = DMatrix::zeros(n, n);
        let mut g = DVector::zeros(n);

        for rb in &self.residuals {
            let params: Vec<&[f64]> = rb.keys.iter().map(|k| values[k].as_slice()).collect();
            let nr = rb.factor.num_residuals();
            let mut r = vec![0.0; nr];
            let sizes = rb.factor.param_block_sizes();
            let mut jacs: Vec<Option<DMatrix<f64>>> =
                sizes.iter().map(|s| Some(DMatrix::zeros(nr, *s))).collect();
            if !rb.factor.evaluate(&params, &mut r, Some(&mut jacs)) {
                continue;
            }

            let mut rv = DVector::from_column_slice(&r);
            let s = rv.norm_squared();
            let (_, rho_p) = rb.loss.evaluate(s);
            let w = rho_p.sqrt();
            rv *= w;

            // local (tangent) jacobians: leading columns of the global ones
            let locals: Vec<Option<DMatrix<f64>>> = rb
                .keys
                .iter()
                .zip(jacs.iter())
                .map(|(k, j)| {
                    let (_, l) = *offsets.get(k)?;
                    let j = j.as_ref()?;
                    Some(j.columns(0, l).into_owned() * w)
                })
                .collect();

            for (a, ka) in rb.keys.iter().enumerate() {
                let Some((oa, la)) = offsets.get(ka).copied() else { continue };
                let Some(ja) = locals[a].as_ref() else { continue };
                let jt_r = ja.transpose() * &rv;
                for i in 0..la {
                    g[oa + i] += jt_r[i];
                }
                for (b, kb) in rb.keys.iter().enumerate() {
                    let Some((ob, lb)) = offsets.get(kb).copied() else { continue };
                    let Some(jb) = locals[b].as_ref() else { continue };
                    let block = ja.transpose() * jb;
                    for i in 0..la {
                        for j in 0..lb {
                            h[(oa + i, ob + j)] += block[(i, j)];
                        }
                    }
                }
            }
        }
        (h, g)
    }

    fn apply_step(
        &self,
        values: &BTreeMap<BlockKey, Vec<f64>>,
        offsets: &BTreeMap<BlockKey, (usize, usize)>,
        step: &DVector<f64>,
    ) -> BTreeMap<BlockKey, Vec<f64>> {
        let mut out = values.clone();
        for (k, (off, l)) in offsets {
            let b = &self.blocks[k];
            let dx: Vec<f64> = (0..*l).map(|i| step[off + i]).collect();
            b.manifold.plus(out.get_mut(k).expect("block present"), &dx);
        }
        out
    }
}

/// Solves `H dx = -g` with the trailing `ne` coordinates block-diagonal
/// (scalar inverse-depth blocks), via the Schur complement.
fn solve_schur(h: &DMatrix<f64>, g: &DVector<f64>, nv: usize, ne: usize) -> Option<DVector<f64>> {
    let n = nv + ne;
    if ne == 0 {
        let chol = nalgebra::Cholesky::new(h.clone())?;
        return Some(chol.solve(&(-g)));
    }

    // C is diagonal by construction: depth blocks are size 1 and no factor
    // couples two depths.
    let mut c_inv = DVector::zeros(ne);
    for i in 0..ne {
        let c = h[(nv + i, nv + i)];
        c_inv[i] = 1.0 / (c + 1e-12);
    }

    let a = h.view((0, 0), (nv, nv)).into_owned();
    let b = h.view((0, nv), (nv, ne)).into_owned();
    let g_v = g.rows(0, nv).into_owned();
    let g_e = g.rows(nv, ne).into_owned();

    // B · C⁻¹
    let mut b_cinv = b.clone();
    for j in 0..ne {
        for i in 0..nv {
            b_cinv[(i, j)] *= c_inv[j];
        }
    }

    let h_red = &a - &b_cinv * b.transpose();
    let g_red = &g_v - &b_cinv * &g_e;

    let chol = nalgebra::Cholesky::new(h_red)?;
    let dx_v = chol.solve(&(-&g_red));

    let rhs = -(&g_e + b.transpose() * &dx_v);
    let mut dx_e = rhs;
    for i in 0..ne {
        dx_e[i] *= c_inv[i];
    }

    let mut dx = DVector::zeros(n);
    dx.rows_mut(0, nv).copy_from(&dx_v);
    dx.rows_mut(nv, ne).copy_from(&dx_e);
    Some(dx)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// r = x - target on a 1-dim block.
    struct Pull {
        key_size: usize,
        target: Vec<f64>,
    }

    impl Factor for Pull {
        fn num_residuals(&self) -> usize {
            self.key_size
        }
        fn param_block_sizes(&self) -> Vec<usize> {
            vec![self.key_size]
        }
        fn evaluate(
            &self,
            params: &[&[f64]],
            residuals: &mut [f64],
            jacobians: Option<&mut [Option<DMatrix<f64>>]>,
        ) -> bool {
            for i in 0..self.key_size {
                residuals[i] = params[0][i] - self.target[i];
            }
            if let Some(jacs) = jacobians {
                if let Some(j) = jacs[0].as_mut() {
                    j.fill(0.0);
                    for i in 0..self.key_size {
                        j[(i, i)] = 1.0;
                    }
                }
            }
            true
        }
    }

    /// r = x - y between two scalar blocks.
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

    #[test]
    fn converges_on_quadratic() {
        let mut problem = Problem::new();
        let k = BlockKey(1);
        problem.add_parameter_block(k, &[10.0, -3.0], Manifold::Euclidean);
        problem.add_residual_block(
            Box::new(Pull {
                key_size: 2,
                target: vec![1.0, 2.0],
            }),
            Loss::Trivial,
            vec![k],
        );
        let summary = problem.solve(&SolverOptions::default());
        assert!(summary.final_cost < 1e-15);
        let v = problem.parameter(k).unwrap();
        assert!((v[0] - 1.0).abs() < 1e-8);
        assert!((v[1] - 2.0).abs() < 1e-8);
    }

    #[test]
    fn schur_elimination_matches_plain_solve() {
        let build = |eliminate: bool| {
            let mut problem = Problem::new();
            let a = BlockKey(1);
            let b = BlockKey(2);
            problem.add_parameter_block(a, &[4.0], Manifold::Euclidean);
            problem.add_parameter_block(b, &[-2.0], Manifold::Euclidean);
            if eliminate {
                problem.mark_eliminated(b);
            }
            problem.add_residual_block(
                Box::new(Pull {
                    key_size: 1,
                    target: vec![1.0],
                }),
                Loss::Trivial,
                vec![a],
            );
            problem.add_residual_block(Box::new(Tie), Loss::Trivial, vec![a, b]);
            problem.solve(&SolverOptions::default());
            (
                problem.parameter(a).unwrap()[0],
                problem.parameter(b).unwrap()[0],
            )
        };
        let (a0, b0) = build(false);
        let (a1, b1) = build(true);
        assert!((a0 - a1).abs() < 1e-8);
        assert!((b0 - b1).abs() < 1e-8);
        assert!((a1 - 1.0).abs() < 1e-6);
        assert!((b1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn constant_blocks_do_not_move() {
        let mut problem = Problem::new();
        let a = BlockKey(1);
        problem.add_parameter_block(a, &[5.0], Manifold::Euclidean);
        problem.set_parameter_block_constant(a);
        problem.add_residual_block(
            Box::new(Pull {
                key_size: 1,
                target: vec![0.0],
            }),
            Loss::Trivial,
            vec![a],
        );
        problem.solve(&SolverOptions::default());
        assert_eq!(problem.parameter(a).unwrap()[0], 5.0);
    }

    #[test]
    fn huber_loss_downweights_outliers() {
        let (rho, rho_p) = Loss::Huber(1.0).evaluate(9.0);
        assert!((rho - 5.0).abs() < 1e-12); // 2·1·3 − 1
        assert!((rho_p - 1.0 / 3.0).abs() < 1e-12);
        let (rho_in, rho_p_in) = Loss::Huber(1.0).evaluate(0.25);
        assert!((rho_in - 0.25).abs() < 1e-12);
        assert!((rho_p_in - 1.0).abs() < 1e-12);
    }
}
