//! Perspective-n-point solve for a small rigid point set.
//!
//! Levenberg-Marquardt over a rotation matrix (updated multiplicatively
//! with an axis-angle step) and a translation vector, minimizing pixel
//! reprojection error under an undistorted pinhole camera.

use thiserror::Error;

pub type Vec3 = [f64; 3];
pub type Mat3 = [[f64; 3]; 3];

const MAX_ITERATIONS: usize = 100;
const MIN_DEPTH: f64 = 1e-6;
const MIN_IMAGE_SPREAD_PX: f64 = 1.0;
const STEP_TOLERANCE: f64 = 1e-10;
const COST_TOLERANCE: f64 = 1e-12;
const INITIAL_DAMPING: f64 = 1e-3;
const MAX_DAMPING: f64 = 1e12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PnpError {
    #[error("need at least 4 point correspondences, got {0}")]
    TooFewPoints(usize),
    #[error("image points are non-finite or collapsed to a single location")]
    DegenerateInput,
    #[error("solution places the model behind the camera")]
    BehindCamera,
    #[error("normal equations are singular")]
    Singular,
    #[error("no convergence after {0} iterations")]
    NotConverged(usize),
}

/// Pinhole intrinsics with zero lens distortion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    /// Approximate intrinsics: focal length = frame width, principal point at the center.
    pub fn approximate(width: u32, height: u32) -> Self {
        let focal = width as f64;
        Self {
            fx: focal,
            fy: focal,
            cx: width as f64 / 2.0,
            cy: height as f64 / 2.0,
        }
    }

    /// Project a camera-space point. `None` if it is not in front of the camera.
    pub fn project(&self, p: Vec3) -> Option<(f64, f64)> {
        if p[2] <= MIN_DEPTH {
            return None;
        }
        Some((self.fx * p[0] / p[2] + self.cx, self.fy * p[1] / p[2] + self.cy))
    }
}

#[derive(Debug, Clone)]
pub struct PnpSolution {
    pub rotation: Mat3,
    pub translation: Vec3,
    /// Root-mean-square reprojection error in pixels.
    pub rms_error: f64,
    pub iterations: usize,
}

/// Recover the rigid transform mapping `object` points into camera space so
/// that they project onto `image` points.
///
/// `initial_rotation` seeds the search; the initial translation is derived
/// from the image centroid and spread.
pub fn solve_pnp(
    object: &[Vec3],
    image: &[(f64, f64)],
    camera: &CameraIntrinsics,
    initial_rotation: Mat3,
) -> Result<PnpSolution, PnpError> {
    let n = object.len().min(image.len());
    if n < 4 {
        return Err(PnpError::TooFewPoints(n));
    }
    let object = &object[..n];
    let image = &image[..n];

    if image.iter().any(|(u, v)| !u.is_finite() || !v.is_finite()) {
        return Err(PnpError::DegenerateInput);
    }

    let mut rotation = initial_rotation;
    let mut translation = initial_translation(object, image, camera, &rotation)?;
    let mut cost = reprojection_cost(object, image, camera, &rotation, &translation)
        .ok_or(PnpError::BehindCamera)?;
    let mut damping = INITIAL_DAMPING;

    for iteration in 1..=MAX_ITERATIONS {
        let (jtj, jtr) = normal_equations(object, image, camera, &rotation, &translation)
            .ok_or(PnpError::BehindCamera)?;

        // Marquardt scaling: damp each parameter relative to its own curvature.
        let mut improved = false;
        while damping <= MAX_DAMPING {
            let mut a = jtj;
            for (i, row) in a.iter_mut().enumerate() {
                row[i] += damping * jtj[i][i].max(1e-12);
            }
            let neg_g = jtr.map(|g| -g);
            let step = solve_linear(a, neg_g).ok_or(PnpError::Singular)?;

            let candidate_rotation = mat_mul(&rotation_from_axis_angle([step[0], step[1], step[2]]), &rotation);
            let candidate_translation = [
                translation[0] + step[3],
                translation[1] + step[4],
                translation[2] + step[5],
            ];

            match reprojection_cost(object, image, camera, &candidate_rotation, &candidate_translation) {
                Some(candidate_cost) if candidate_cost < cost => {
                    let reduction = cost - candidate_cost;
                    rotation = candidate_rotation;
                    translation = candidate_translation;
                    cost = candidate_cost;
                    damping = (damping / 10.0).max(1e-12);
                    improved = true;

                    let step_norm = step.iter().map(|s| s * s).sum::<f64>().sqrt();
                    if step_norm < STEP_TOLERANCE || reduction <= COST_TOLERANCE * (1.0 + cost) {
                        return Ok(solution(rotation, translation, cost, n, iteration));
                    }
                    break;
                }
                _ => damping *= 10.0,
            }
        }

        if !improved {
            // No step reduces the error at any damping: we are at a minimum.
            return Ok(solution(rotation, translation, cost, n, iteration));
        }
    }

    Err(PnpError::NotConverged(MAX_ITERATIONS))
}

fn solution(rotation: Mat3, translation: Vec3, cost: f64, n: usize, iterations: usize) -> PnpSolution {
    let rms_error = (cost / n as f64).sqrt();
    tracing::debug!(rms_error, iterations, "PnP converged");
    PnpSolution {
        rotation,
        translation,
        rms_error,
        iterations,
    }
}

/// Place the rotated model so its centroid projects onto the image centroid,
/// at the depth where its spread matches the image spread.
fn initial_translation(
    object: &[Vec3],
    image: &[(f64, f64)],
    camera: &CameraIntrinsics,
    rotation: &Mat3,
) -> Result<Vec3, PnpError> {
    let n = object.len() as f64;
    let (mut u_c, mut v_c) = (0.0, 0.0);
    for (u, v) in image {
        u_c += u / n;
        v_c += v / n;
    }
    let image_spread = (image
        .iter()
        .map(|(u, v)| (u - u_c).powi(2) + (v - v_c).powi(2))
        .sum::<f64>()
        / n)
        .sqrt();
    if image_spread < MIN_IMAGE_SPREAD_PX {
        return Err(PnpError::DegenerateInput);
    }

    let rotated: Vec<Vec3> = object.iter().map(|p| mat_vec(rotation, p)).collect();
    let mut centroid = [0.0; 3];
    for p in &rotated {
        for k in 0..3 {
            centroid[k] += p[k] / n;
        }
    }
    let object_spread = (rotated
        .iter()
        .map(|p| (p[0] - centroid[0]).powi(2) + (p[1] - centroid[1]).powi(2))
        .sum::<f64>()
        / n)
        .sqrt();
    if object_spread <= f64::EPSILON {
        return Err(PnpError::DegenerateInput);
    }

    let depth = camera.fx * object_spread / image_spread;
    Ok([
        (u_c - camera.cx) * depth / camera.fx - centroid[0],
        (v_c - camera.cy) * depth / camera.fy - centroid[1],
        depth - centroid[2],
    ])
}

/// Sum of squared pixel residuals, or `None` if any point is behind the camera.
fn reprojection_cost(
    object: &[Vec3],
    image: &[(f64, f64)],
    camera: &CameraIntrinsics,
    rotation: &Mat3,
    translation: &Vec3,
) -> Option<f64> {
    let mut cost = 0.0;
    for (p, (u, v)) in object.iter().zip(image) {
        let q = mat_vec(rotation, p);
        let (pu, pv) = camera.project([q[0] + translation[0], q[1] + translation[1], q[2] + translation[2]])?;
        cost += (pu - u).powi(2) + (pv - v).powi(2);
    }
    cost.is_finite().then_some(cost)
}

/// Accumulate JᵀJ and Jᵀr for parameters [ω (rotation step), t].
#[allow(clippy::needless_range_loop)]
fn normal_equations(
    object: &[Vec3],
    image: &[(f64, f64)],
    camera: &CameraIntrinsics,
    rotation: &Mat3,
    translation: &Vec3,
) -> Option<([[f64; 6]; 6], [f64; 6])> {
    let mut jtj = [[0.0f64; 6]; 6];
    let mut jtr = [0.0f64; 6];

    for (p, (u, v)) in object.iter().zip(image) {
        let q = mat_vec(rotation, p);
        let x = q[0] + translation[0];
        let y = q[1] + translation[1];
        let z = q[2] + translation[2];
        if z <= MIN_DEPTH {
            return None;
        }

        let ru = camera.fx * x / z + camera.cx - u;
        let rv = camera.fy * y / z + camera.cy - v;

        // d(camera point)/d[ω, t] = [-[q]× | I]
        let dp: [[f64; 6]; 3] = [
            [0.0, q[2], -q[1], 1.0, 0.0, 0.0],
            [-q[2], 0.0, q[0], 0.0, 1.0, 0.0],
            [q[1], -q[0], 0.0, 0.0, 0.0, 1.0],
        ];
        let du = [camera.fx / z, 0.0, -camera.fx * x / (z * z)];
        let dv = [0.0, camera.fy / z, -camera.fy * y / (z * z)];

        let mut ju = [0.0f64; 6];
        let mut jv = [0.0f64; 6];
        for j in 0..6 {
            for k in 0..3 {
                ju[j] += du[k] * dp[k][j];
                jv[j] += dv[k] * dp[k][j];
            }
        }

        for a in 0..6 {
            for b in 0..6 {
                jtj[a][b] += ju[a] * ju[b] + jv[a] * jv[b];
            }
            jtr[a] += ju[a] * ru + jv[a] * rv;
        }
    }

    Some((jtj, jtr))
}

/// Solve an N×N linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
pub(crate) fn solve_linear<const N: usize>(a: [[f64; N]; N], b: [f64; N]) -> Option<[f64; N]> {
    let mut m = a;
    let mut rhs = b;

    for col in 0..N {
        let mut max_row = col;
        let mut max_val = m[col][col].abs();
        for row in (col + 1)..N {
            if m[row][col].abs() > max_val {
                max_val = m[row][col].abs();
                max_row = row;
            }
        }
        m.swap(col, max_row);
        rhs.swap(col, max_row);

        let pivot = m[col][col];
        if !pivot.is_finite() || pivot.abs() < 1e-12 {
            return None;
        }

        for row in (col + 1)..N {
            let factor = m[row][col] / pivot;
            for j in col..N {
                m[row][j] -= factor * m[col][j];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0f64; N];
    for i in (0..N).rev() {
        x[i] = rhs[i];
        for j in (i + 1)..N {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Rotation matrix for an axis-angle vector (Rodrigues' formula).
pub fn rotation_from_axis_angle(w: Vec3) -> Mat3 {
    let theta = (w[0] * w[0] + w[1] * w[1] + w[2] * w[2]).sqrt();
    if theta < 1e-12 {
        return [
            [1.0, -w[2], w[1]],
            [w[2], 1.0, -w[0]],
            [-w[1], w[0], 1.0],
        ];
    }
    let k = [w[0] / theta, w[1] / theta, w[2] / theta];
    let (s, c) = theta.sin_cos();
    let t = 1.0 - c;
    [
        [c + k[0] * k[0] * t, k[0] * k[1] * t - k[2] * s, k[0] * k[2] * t + k[1] * s],
        [k[1] * k[0] * t + k[2] * s, c + k[1] * k[1] * t, k[1] * k[2] * t - k[0] * s],
        [k[2] * k[0] * t - k[1] * s, k[2] * k[1] * t + k[0] * s, c + k[2] * k[2] * t],
    ]
}

pub fn rotation_x(angle: f64) -> Mat3 {
    let (s, c) = angle.sin_cos();
    [[1.0, 0.0, 0.0], [0.0, c, -s], [0.0, s, c]]
}

pub fn rotation_y(angle: f64) -> Mat3 {
    let (s, c) = angle.sin_cos();
    [[c, 0.0, s], [0.0, 1.0, 0.0], [-s, 0.0, c]]
}

pub fn rotation_z(angle: f64) -> Mat3 {
    let (s, c) = angle.sin_cos();
    [[c, -s, 0.0], [s, c, 0.0], [0.0, 0.0, 1.0]]
}

pub fn mat_mul(a: &Mat3, b: &Mat3) -> Mat3 {
    let mut out = [[0.0f64; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

pub fn mat_vec(m: &Mat3, v: &Vec3) -> Vec3 {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    const MODEL: [Vec3; 6] = [
        [0.0, 0.0, 0.0],
        [0.0, -63.6, -12.5],
        [-43.3, 32.7, -26.0],
        [43.3, 32.7, -26.0],
        [-28.9, -28.9, -24.1],
        [28.9, -28.9, -24.1],
    ];

    fn project_all(rotation: &Mat3, translation: &Vec3, camera: &CameraIntrinsics) -> Vec<(f64, f64)> {
        MODEL
            .iter()
            .map(|p| {
                let q = mat_vec(rotation, p);
                camera
                    .project([q[0] + translation[0], q[1] + translation[1], q[2] + translation[2]])
                    .unwrap()
            })
            .collect()
    }

    fn assert_mat_close(a: &Mat3, b: &Mat3, tol: f64) {
        for i in 0..3 {
            for j in 0..3 {
                assert!((a[i][j] - b[i][j]).abs() < tol, "[{i}][{j}]: {} vs {}", a[i][j], b[i][j]);
            }
        }
    }

    #[test]
    fn test_solve_linear_known_system() {
        let a = [[2.0, 1.0, 0.0], [1.0, 3.0, 1.0], [0.0, 1.0, 4.0]];
        let x = solve_linear(a, [3.0, 5.0, 5.0]).unwrap();
        for (got, want) in x.iter().zip([1.0, 1.0, 1.0]) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn test_solve_linear_needs_pivoting() {
        let a = [[0.0, 1.0], [1.0, 0.0]];
        let x = solve_linear(a, [2.0, 3.0]).unwrap();
        assert_eq!(x, [3.0, 2.0]);
    }

    #[test]
    fn test_solve_linear_singular() {
        let a = [[1.0, 2.0], [2.0, 4.0]];
        assert!(solve_linear(a, [1.0, 2.0]).is_none());
    }

    #[test]
    fn test_axis_angle_matches_elementary_rotations() {
        assert_mat_close(&rotation_from_axis_angle([0.4, 0.0, 0.0]), &rotation_x(0.4), 1e-12);
        assert_mat_close(&rotation_from_axis_angle([0.0, -0.7, 0.0]), &rotation_y(-0.7), 1e-12);
        assert_mat_close(&rotation_from_axis_angle([0.0, 0.0, 1.1]), &rotation_z(1.1), 1e-12);
    }

    #[test]
    fn test_recovers_frontal_pose() {
        let camera = CameraIntrinsics::approximate(640, 480);
        let rotation = rotation_x(PI);
        let translation = [0.0, 0.0, 600.0];
        let image = project_all(&rotation, &translation, &camera);

        let sol = solve_pnp(&MODEL, &image, &camera, rotation_x(PI)).unwrap();
        assert_mat_close(&sol.rotation, &rotation, 1e-6);
        assert!(sol.rms_error < 1e-6);
    }

    #[test]
    fn test_recovers_turned_pose() {
        let camera = CameraIntrinsics::approximate(640, 480);
        let rotation = mat_mul(&rotation_y(0.5), &mat_mul(&rotation_x(PI + 0.15), &rotation_z(0.1)));
        let translation = [25.0, -10.0, 550.0];
        let image = project_all(&rotation, &translation, &camera);

        let sol = solve_pnp(&MODEL, &image, &camera, rotation_x(PI)).unwrap();
        assert_mat_close(&sol.rotation, &rotation, 1e-5);
        for k in 0..3 {
            assert!((sol.translation[k] - translation[k]).abs() < 1e-3);
        }
    }

    #[test]
    fn test_collapsed_points_are_degenerate() {
        let camera = CameraIntrinsics::approximate(640, 480);
        let image = vec![(320.0, 240.0); 6];
        assert_eq!(
            solve_pnp(&MODEL, &image, &camera, rotation_x(PI)).unwrap_err(),
            PnpError::DegenerateInput
        );
    }

    #[test]
    fn test_non_finite_points_are_degenerate() {
        let camera = CameraIntrinsics::approximate(640, 480);
        let mut image = project_all(&rotation_x(PI), &[0.0, 0.0, 600.0], &camera);
        image[2].0 = f64::NAN;
        assert_eq!(
            solve_pnp(&MODEL, &image, &camera, rotation_x(PI)).unwrap_err(),
            PnpError::DegenerateInput
        );
    }

    #[test]
    fn test_too_few_points() {
        let camera = CameraIntrinsics::approximate(640, 480);
        let image = vec![(1.0, 2.0), (3.0, 4.0), (5.0, 9.0)];
        assert_eq!(
            solve_pnp(&MODEL[..3], &image, &camera, rotation_x(PI)).unwrap_err(),
            PnpError::TooFewPoints(3)
        );
    }
}
