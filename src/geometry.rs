//! SO(3)/SE(3) helpers shared by the IMU preintegrator and the
//! reference pose-graph solver, so their residual Jacobians can be
//! checked against numerical differentiation from a single place
//! (spec.md §9).

use nalgebra::{Isometry3, Matrix3, UnitQuaternion, Vector3, Vector6};

pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// `Log: SO(3) -> so(3)`, returning the rotation vector (axis * angle).
pub fn so3_log(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    let q = q.normalize();
    let w = q.w.clamp(-1.0, 1.0);
    let xyz = Vector3::new(q.i, q.j, q.k);
    let sin_half = xyz.norm();
    if sin_half < 1e-9 {
        2.0 * xyz
    } else {
        let angle = 2.0 * sin_half.atan2(w);
        (angle / sin_half) * xyz
    }
}

/// `Exp: so(3) -> SO(3)`.
pub fn so3_exp(w: &Vector3<f64>) -> UnitQuaternion<f64> {
    let angle = w.norm();
    if angle < 1e-9 {
        UnitQuaternion::identity()
    } else {
        UnitQuaternion::from_axis_angle(&nalgebra::Unit::new_normalize(*w), angle)
    }
}

/// Residual between pose `i` and pose `j` given a measured relative
/// transform `T_ij`, expressed in the frame of `i`:
///   e_rot   = Log( T_ij.rot^-1 * (R_i^-1 * R_j) )
///   e_trans = R_i^-1 * (p_j - p_i) - T_ij.trans
/// Stacked as [rotation(3); translation(3)].
pub fn relative_pose_residual(
    pose_i: &Isometry3<f64>,
    pose_j: &Isometry3<f64>,
    measured: &Isometry3<f64>,
) -> Vector6<f64> {
    let r_i = pose_i.rotation;
    let r_j = pose_j.rotation;
    let rel_rot = measured.rotation.inverse() * (r_i.inverse() * r_j);
    let e_rot = so3_log(&rel_rot);
    let e_trans =
        r_i.inverse() * (pose_j.translation.vector - pose_i.translation.vector) - measured.translation.vector;
    let mut e = Vector6::zeros();
    e.fixed_rows_mut::<3>(0).copy_from(&e_rot);
    e.fixed_rows_mut::<3>(3).copy_from(&e_trans);
    e
}

/// Inverse of the SO(3) right Jacobian: the first-order relation
/// `Log(R * Exp(w)) ~= Log(R) + Jr^-1(Log(R)) * w` (used to check
/// residual Jacobians against finite differences without assuming the
/// reference rotation is near identity).
pub fn so3_right_jacobian_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let s = skew(phi);
    if theta < 1e-9 {
        return Matrix3::identity() + 0.5 * s;
    }
    let a = 1.0 / (theta * theta) - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
    Matrix3::identity() + 0.5 * s + a * (s * s)
}

/// Apply a minimal right-tangent perturbation `[drot; dtrans]` to a
/// pose: `T * Exp([dtrans, drot])`, rotation first then translation,
/// matching the convention used by `relative_pose_residual`'s implicit
/// parameterization.
pub fn perturb_pose(pose: &Isometry3<f64>, delta: &Vector6<f64>) -> Isometry3<f64> {
    let drot = Vector3::new(delta[0], delta[1], delta[2]);
    let dtrans = Vector3::new(delta[3], delta[4], delta[5]);
    let dq = so3_exp(&drot);
    Isometry3::from_parts(
        (pose.translation.vector + pose.rotation * dtrans).into(),
        pose.rotation * dq,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Translation3;

    fn random_pose(seed: u64) -> Isometry3<f64> {
        let s = seed as f64;
        let axis = Vector3::new((s * 0.37).sin(), (s * 1.7).cos(), (s * 2.9).sin()).normalize();
        let angle = (s * 0.5).sin() * 1.2;
        let rot = UnitQuaternion::from_axis_angle(&nalgebra::Unit::new_normalize(axis), angle);
        let trans = Translation3::new((s * 1.1).sin() * 3.0, (s * 0.7).cos() * 2.0, (s * 1.9).sin());
        Isometry3::from_parts(trans, rot)
    }

    #[test]
    fn so3_log_exp_round_trip() {
        for seed in 0..10 {
            let w = Vector3::new(
                (seed as f64 * 0.3).sin(),
                (seed as f64 * 0.7).cos(),
                (seed as f64 * 1.1).sin(),
            ) * 0.8;
            let q = so3_exp(&w);
            let w2 = so3_log(&q);
            assert_relative_eq!(w, w2, epsilon = 1e-9);
        }
    }

    #[test]
    fn residual_is_zero_for_consistent_measurement() {
        let pose_i = random_pose(1);
        let relative = random_pose(2);
        let pose_j = pose_i * relative;
        let e = relative_pose_residual(&pose_i, &pose_j, &relative);
        assert_relative_eq!(e.norm(), 0.0, epsilon = 1e-9);
    }

    /// Numerical-differentiation cross-check (spec.md §9: EPS ~= 1e-8,
    /// tolerance ~= 1e-6) of the residual's Jacobian with respect to a
    /// minimal right-tangent perturbation of pose j, holding pose i and
    /// the measurement fixed.
    #[test]
    fn residual_jacobian_matches_finite_difference() {
        let pose_i = random_pose(3);
        let pose_j = random_pose(4);
        let measured = random_pose(5);
        let eps = 1e-8;

        let mut numeric = nalgebra::Matrix6::<f64>::zeros();
        for k in 0..6 {
            let mut plus = Vector6::zeros();
            plus[k] = eps;
            let mut minus = Vector6::zeros();
            minus[k] = -eps;
            let e_plus =
                relative_pose_residual(&pose_i, &perturb_pose(&pose_j, &plus), &measured);
            let e_minus =
                relative_pose_residual(&pose_i, &perturb_pose(&pose_j, &minus), &measured);
            let dcol = (e_plus - e_minus) / (2.0 * eps);
            numeric.set_column(k, &dcol);
        }

        // Analytic Jacobian of e wrt right-tangent perturbation of j:
        // d(e_rot)/d(drot_j)   = Jr^-1(e_rot), via Log(R Exp(w)) ~= Log(R) + Jr^-1(Log(R)) w
        // d(e_trans)/d(dtrans_j) = R_i^-1 * R_j
        let r_i = pose_i.rotation;
        let r_j = pose_j.rotation;
        let rel_rot = measured.rotation.inverse() * (r_i.inverse() * r_j);
        let e_rot = so3_log(&rel_rot);
        let mut analytic = nalgebra::Matrix6::<f64>::zeros();
        analytic
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&so3_right_jacobian_inv(&e_rot));
        analytic
            .fixed_view_mut::<3, 3>(3, 3)
            .copy_from((r_i.inverse() * r_j).to_rotation_matrix().matrix());

        assert_relative_eq!(numeric, analytic, epsilon = 1e-6);
    }
}
