//! IMU preintegration (spec.md §4.1): accumulates inertial samples
//! between two keyframes into a single relative-motion delta with a
//! dense 15x15 error-state covariance and bias Jacobians, plus a
//! two-state (keyframe anchor, current) prediction interface.
//!
//! Grounded in the on-manifold preintegration this corpus's
//! `factors::imu_preintegration` module already implements (SO(3)
//! quaternion retraction, accumulated bias Jacobians); expanded here
//! to the full 15-dimensional error state and the push/anchor/predict
//! protocol spec.md names explicitly.

use std::collections::VecDeque;

use nalgebra::{Matrix3, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::error::{SlamError, SlamResult};
use crate::estimator::GraphEstimator;
use crate::geometry::skew;
use crate::transaction::{Constraint, Transaction, VariableId, VariableValue};
use crate::types::{ImuSample, ImuState, Pose3, StateMat15};

/// Accumulated IMU measurements between two keyframes (spec.md §3
/// `PreintegratedDelta`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreintegratedDelta {
    pub delta_t: f64,
    pub delta_q: UnitQuaternion<f64>,
    pub delta_v: Vector3<f64>,
    pub delta_p: Vector3<f64>,
    /// 15x15 error-state covariance over (δφ, δv, δp, δb_g, δb_a).
    #[serde(with = "state_mat15_serde")]
    pub covariance: StateMat15,
    pub nominal_gyro_bias: Vector3<f64>,
    pub nominal_accel_bias: Vector3<f64>,
    pub dp_dbg: Matrix3<f64>,
    pub dp_dba: Matrix3<f64>,
    pub dv_dbg: Matrix3<f64>,
    pub dv_dba: Matrix3<f64>,
    pub dq_dbg: Matrix3<f64>,
}

mod state_mat15_serde {
    use super::StateMat15;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(m: &StateMat15, s: S) -> Result<S::Ok, S::Error> {
        let flat: Vec<f64> = m.iter().copied().collect();
        flat.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<StateMat15, D::Error> {
        let flat: Vec<f64> = Vec::deserialize(d)?;
        Ok(StateMat15::from_iterator(flat))
    }
}

impl PreintegratedDelta {
    fn identity(nominal_gyro_bias: Vector3<f64>, nominal_accel_bias: Vector3<f64>) -> Self {
        Self {
            delta_t: 0.0,
            delta_q: UnitQuaternion::identity(),
            delta_v: Vector3::zeros(),
            delta_p: Vector3::zeros(),
            covariance: StateMat15::zeros(),
            nominal_gyro_bias,
            nominal_accel_bias,
            dp_dbg: Matrix3::zeros(),
            dp_dba: Matrix3::zeros(),
            dv_dbg: Matrix3::zeros(),
            dv_dba: Matrix3::zeros(),
            dq_dbg: Matrix3::zeros(),
        }
    }

    /// 9x6 bias Jacobian block named in spec.md §9, stacked as rows
    /// [rotation; velocity; position] and columns [b_g; b_a].
    pub fn bias_jacobian_9x6(&self) -> crate::types::BiasJacobian9x6 {
        let mut j = crate::types::BiasJacobian9x6::zeros();
        j.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.dq_dbg);
        j.fixed_view_mut::<3, 3>(3, 0).copy_from(&self.dv_dbg);
        j.fixed_view_mut::<3, 3>(3, 3).copy_from(&self.dv_dba);
        j.fixed_view_mut::<3, 3>(6, 0).copy_from(&self.dp_dbg);
        j.fixed_view_mut::<3, 3>(6, 3).copy_from(&self.dp_dba);
        j
    }

    /// Corrects the delta for a small change in bias away from the
    /// nominal bias used during integration, via the stored Jacobians
    /// (spec.md §8: post-hoc bias correction without re-integration).
    pub fn corrected(&self, gyro_bias: Vector3<f64>, accel_bias: Vector3<f64>) -> (UnitQuaternion<f64>, Vector3<f64>, Vector3<f64>) {
        let dbg = gyro_bias - self.nominal_gyro_bias;
        let dba = accel_bias - self.nominal_accel_bias;
        let corrected_p = self.delta_p + self.dp_dbg * dbg + self.dp_dba * dba;
        let corrected_v = self.delta_v + self.dv_dbg * dbg + self.dv_dba * dba;
        let dtheta = self.dq_dbg * dbg;
        let corrected_q = self.delta_q * crate::geometry::so3_exp(&dtheta);
        (corrected_q, corrected_v, corrected_p)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct NoiseModel {
    pub gyro_noise_std: f64,
    pub accel_noise_std: f64,
    pub gyro_bias_rw_std: f64,
    pub accel_bias_rw_std: f64,
}

impl Default for NoiseModel {
    fn default() -> Self {
        Self {
            gyro_noise_std: 0.001,
            accel_noise_std: 0.01,
            gyro_bias_rw_std: 1e-5,
            accel_bias_rw_std: 1e-4,
        }
    }
}

/// Accepts IMU samples and produces preintegrated deltas and
/// instantaneous pose predictions between keyframe anchors (spec.md
/// §4.1).
pub struct ImuPreintegrator {
    noise: NoiseModel,
    gravity: Vector3<f64>,
    sigma_prior: f64,
    total_buffer: Vec<ImuSample>,
    working: VecDeque<ImuSample>,
    anchor: ImuState,
    delta: PreintegratedDelta,
    last_sample_stamp: Option<f64>,
    emitted_first_prior: bool,
}

impl ImuPreintegrator {
    pub fn new(noise: NoiseModel, gravity: Vector3<f64>, sigma_prior: f64) -> Self {
        let anchor = ImuState::identity_at(0.0);
        Self {
            delta: PreintegratedDelta::identity(anchor.gyro_bias, anchor.accel_bias),
            noise,
            gravity,
            sigma_prior,
            total_buffer: Vec::new(),
            working: VecDeque::new(),
            anchor,
            last_sample_stamp: None,
            emitted_first_prior: false,
        }
    }

    /// Appends a sample; fails with `OUT_OF_ORDER` if `stamp` does not
    /// strictly increase.
    pub fn push_sample(&mut self, sample: ImuSample) -> SlamResult<()> {
        if let Some(last) = self.last_sample_stamp {
            if sample.stamp <= last {
                return Err(SlamError::OutOfOrder {
                    stamp: sample.stamp,
                    last,
                });
            }
        }
        self.last_sample_stamp = Some(sample.stamp);
        self.total_buffer.push(sample);
        if sample.stamp > self.anchor.stamp {
            self.working.push_back(sample);
            self.integrate_one(sample);
        }
        Ok(())
    }

    fn integrate_one(&mut self, sample: ImuSample) {
        let prev_stamp = self
            .working
            .iter()
            .rev()
            .nth(1)
            .map(|s| s.stamp)
            .unwrap_or(self.anchor.stamp);
        let dt = sample.stamp - prev_stamp;
        if dt <= 0.0 {
            return;
        }
        self.integrate_step(sample.accel, sample.omega, dt);
    }

    fn integrate_step(&mut self, accel: Vector3<f64>, gyro: Vector3<f64>, dt: f64) {
        let accel_c = accel - self.delta.nominal_accel_bias;
        let gyro_c = gyro - self.delta.nominal_gyro_bias;
        let r = self.delta.delta_q.to_rotation_matrix().into_inner();

        // Midpoint-ish integration: position/velocity use the
        // rotation at the start of the step, matching the "standard
        // midpoint or Euler rule under zero gravity" directive.
        self.delta.delta_p += self.delta.delta_v * dt + 0.5 * (r * accel_c) * dt * dt;
        self.delta.delta_v += (r * accel_c) * dt;
        self.delta.delta_q = self.delta.delta_q * crate::geometry::so3_exp(&(gyro_c * dt));
        self.delta.delta_t += dt;

        // Error-state transition (F) and noise Jacobian (G) over this
        // step, order [δφ, δv, δp, δb_g, δb_a].
        let mut f = StateMat15::identity();
        let skew_gyro = skew(&gyro_c);
        let skew_accel = skew(&accel_c);
        f.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(Matrix3::identity() - skew_gyro * dt));
        f.fixed_view_mut::<3, 3>(0, 9)
            .copy_from(&(-Matrix3::identity() * dt));
        f.fixed_view_mut::<3, 3>(3, 0)
            .copy_from(&(-r * skew_accel * dt));
        f.fixed_view_mut::<3, 3>(3, 12).copy_from(&(-r * dt));
        f.fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(Matrix3::identity() * dt));

        let mut g = nalgebra::SMatrix::<f64, 15, 12>::zeros();
        g.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(-Matrix3::identity() * dt));
        g.fixed_view_mut::<3, 3>(3, 3).copy_from(&(-r * dt));
        g.fixed_view_mut::<3, 3>(9, 6)
            .copy_from(&(Matrix3::identity() * dt));
        g.fixed_view_mut::<3, 3>(12, 9)
            .copy_from(&(Matrix3::identity() * dt));

        let mut q = nalgebra::SMatrix::<f64, 12, 12>::zeros();
        let gv = self.noise.gyro_noise_std.powi(2);
        let av = self.noise.accel_noise_std.powi(2);
        let gbv = self.noise.gyro_bias_rw_std.powi(2);
        let abv = self.noise.accel_bias_rw_std.powi(2);
        for i in 0..3 {
            q[(i, i)] = gv;
            q[(i + 3, i + 3)] = av;
            q[(i + 6, i + 6)] = gbv;
            q[(i + 9, i + 9)] = abv;
        }

        self.delta.covariance = f * self.delta.covariance * f.transpose() + g * q * g.transpose();

        // Recursive bias-Jacobian update (first-order, right-Jacobian
        // approximated as identity over one IMU step).
        let step_rot = crate::geometry::so3_exp(&(gyro_c * dt))
            .to_rotation_matrix()
            .into_inner();
        self.delta.dp_dba += self.delta.dv_dba * dt - 0.5 * r * dt * dt;
        self.delta.dp_dbg += self.delta.dv_dbg * dt - 0.5 * r * skew_accel * self.delta.dq_dbg * dt * dt;
        self.delta.dv_dba += -r * dt;
        self.delta.dv_dbg += -r * skew_accel * self.delta.dq_dbg * dt;
        self.delta.dq_dbg = step_rot.transpose() * self.delta.dq_dbg - Matrix3::identity() * dt;
    }

    /// Anchors keyframe state `i`; discards samples with `stamp <=
    /// stamp_i` and resets the working delta.
    pub fn set_start(
        &mut self,
        stamp_i: f64,
        q_i: Option<UnitQuaternion<f64>>,
        p_i: Option<Vector3<f64>>,
        v_i: Option<Vector3<f64>>,
    ) {
        self.anchor.stamp = stamp_i;
        if let Some(q) = q_i {
            self.anchor.orientation = q;
        }
        if let Some(p) = p_i {
            self.anchor.position = p;
        }
        if let Some(v) = v_i {
            self.anchor.velocity = v;
        }
        self.working.retain(|s| s.stamp > stamp_i);
        self.delta = PreintegratedDelta::identity(self.anchor.gyro_bias, self.anchor.accel_bias);
        for s in self.working.clone() {
            self.integrate_step(s.accel, s.omega, {
                let idx = self.working.iter().position(|w| w.stamp == s.stamp).unwrap();
                if idx == 0 {
                    s.stamp - stamp_i
                } else {
                    s.stamp - self.working[idx - 1].stamp
                }
            });
        }
    }

    /// Integrates from the anchor up to `stamp_now` and returns the
    /// predicted `T_world_imu`. Fails `NOT_READY` if `stamp_now`
    /// precedes the buffer front.
    pub fn predict_pose(&self, stamp_now: f64) -> SlamResult<Pose3> {
        let front = self.working.front().map(|s| s.stamp).unwrap_or(self.anchor.stamp);
        if stamp_now < self.anchor.stamp.min(front) {
            return Err(SlamError::NotReady {
                requested: stamp_now,
                front: self.anchor.stamp.min(front),
            });
        }
        let mut q = self.anchor.orientation;
        let mut v = self.anchor.velocity;
        let mut p = self.anchor.position;
        let mut t = self.anchor.stamp;

        for sample in &self.working {
            if sample.stamp > stamp_now {
                break;
            }
            let dt = sample.stamp - t;
            if dt <= 0.0 {
                continue;
            }
            let accel_c = sample.accel - self.anchor.accel_bias;
            let gyro_c = sample.omega - self.anchor.gyro_bias;
            let r = q.to_rotation_matrix().into_inner();
            let world_accel = r * accel_c + self.gravity;
            p += v * dt + 0.5 * world_accel * dt * dt;
            v += world_accel * dt;
            q = q * crate::geometry::so3_exp(&(gyro_c * dt));
            t = sample.stamp;
        }
        if stamp_now > t {
            let dt = stamp_now - t;
            let world_accel = self.gravity;
            p += v * dt + 0.5 * world_accel * dt * dt;
        }
        Ok(Pose3::from_parts(p.into(), q))
    }

    /// Closes the interval `(t_i, stamp_j]`, emitting the
    /// preintegration constraint (and, for the first interval, a
    /// prior on state `i`), then rolls the anchor forward. Negative or
    /// empty intervals return an empty transaction.
    pub fn register_preintegrated_factor(
        &mut self,
        stamp_j: f64,
        q_j: Option<UnitQuaternion<f64>>,
        p_j: Option<Vector3<f64>>,
    ) -> Transaction {
        if stamp_j <= self.anchor.stamp {
            return Transaction::default();
        }
        let mut txn = Transaction::default();

        let predicted_q = self.delta.delta_q;
        let predicted_p = self.anchor.position
            + self.anchor.velocity * self.delta.delta_t
            + self.anchor.orientation * self.delta.delta_p
            + 0.5 * self.gravity * self.delta.delta_t * self.delta.delta_t;
        let final_q = self.anchor.orientation * predicted_q;

        let resolved_q = q_j.unwrap_or(final_q);
        let resolved_p = p_j.unwrap_or(predicted_p);
        let predicted_v = self.anchor.velocity + self.anchor.orientation * self.delta.delta_v
            + self.gravity * self.delta.delta_t;
        let resolved_v = if p_j.is_some() && self.delta.delta_t > 0.0 {
            // Recompute velocity from the chord when pose j is
            // overridden externally (spec.md §4.1).
            (resolved_p - self.anchor.position) / self.delta.delta_t
        } else {
            predicted_v
        };

        if !self.emitted_first_prior {
            txn.constraints.push(Constraint::Prior {
                variable: VariableId::pose(self.anchor.stamp),
                value: VariableValue::Pose(Pose3::from_parts(
                    self.anchor.position.into(),
                    self.anchor.orientation,
                )),
                covariance_diag: [self.sigma_prior; 6],
            });
            self.emitted_first_prior = true;
        }

        txn.variables.push((
            VariableId::pose(stamp_j),
            VariableValue::Pose(Pose3::from_parts(resolved_p.into(), resolved_q)),
        ));
        txn.variables
            .push((VariableId::velocity(stamp_j), VariableValue::Velocity(resolved_v)));
        let bias_j = {
            let mut v = Vector6::zeros();
            v.fixed_rows_mut::<3>(0).copy_from(&self.anchor.accel_bias);
            v.fixed_rows_mut::<3>(3).copy_from(&self.anchor.gyro_bias);
            v
        };
        txn.variables
            .push((VariableId::bias(stamp_j), VariableValue::Bias(bias_j)));

        txn.constraints.push(Constraint::Preintegrated {
            pose_i: VariableId::pose(self.anchor.stamp),
            vel_i: VariableId::velocity(self.anchor.stamp),
            bias_i: VariableId::bias(self.anchor.stamp),
            pose_j: VariableId::pose(stamp_j),
            vel_j: VariableId::velocity(stamp_j),
            bias_j: VariableId::bias(stamp_j),
            delta: self.delta.clone(),
        });

        self.anchor = ImuState {
            stamp: stamp_j,
            orientation: resolved_q,
            position: resolved_p,
            velocity: resolved_v,
            gyro_bias: self.anchor.gyro_bias,
            accel_bias: self.anchor.accel_bias,
        };
        self.delta = PreintegratedDelta::identity(self.anchor.gyro_bias, self.anchor.accel_bias);
        self.working.retain(|s| s.stamp > stamp_j);

        txn
    }

    /// Pulls the post-optimization anchor value from the graph and
    /// refills the working buffer from the total history.
    pub fn update_from_graph(&mut self, graph: &dyn GraphEstimator) {
        let pose_id = VariableId::pose(self.anchor.stamp);
        let vel_id = VariableId::velocity(self.anchor.stamp);
        let bias_id = VariableId::bias(self.anchor.stamp);
        if let Some(VariableValue::Pose(p)) = graph.variable(&pose_id) {
            self.anchor.position = p.translation.vector;
            self.anchor.orientation = p.rotation;
        }
        if let Some(VariableValue::Velocity(v)) = graph.variable(&vel_id) {
            self.anchor.velocity = v;
        }
        if let Some(VariableValue::Bias(b)) = graph.variable(&bias_id) {
            self.anchor.accel_bias = b.fixed_rows::<3>(0).into_owned();
            self.anchor.gyro_bias = b.fixed_rows::<3>(3).into_owned();
        }
        self.working = self
            .total_buffer
            .iter()
            .filter(|s| s.stamp > self.anchor.stamp)
            .copied()
            .collect();
        self.delta = PreintegratedDelta::identity(self.anchor.gyro_bias, self.anchor.accel_bias);
        let mut prev = self.anchor.stamp;
        let samples: Vec<_> = self.working.iter().copied().collect();
        for s in samples {
            let dt = s.stamp - prev;
            self.integrate_step(s.accel, s.omega, dt);
            prev = s.stamp;
        }
    }

    pub fn anchor(&self) -> &ImuState {
        &self.anchor
    }

    pub fn current_delta(&self) -> &PreintegratedDelta {
        &self.delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn straight_line_preintegrator() -> ImuPreintegrator {
        ImuPreintegrator::new(NoiseModel::default(), Vector3::new(0.0, 0.0, -9.81), 1e-6)
    }

    /// Scenario 1, spec.md §8: straight-line IMU-only preintegration.
    #[test]
    fn imu_only_straight_line() {
        let mut imu = straight_line_preintegrator();
        imu.set_start(0.0, Some(UnitQuaternion::identity()), Some(Vector3::zeros()), Some(Vector3::zeros()));
        for i in 1..=100 {
            let stamp = i as f64 * 0.01;
            imu.push_sample(ImuSample {
                stamp,
                omega: Vector3::zeros(),
                accel: Vector3::new(1.0, 0.0, 9.81),
            })
            .unwrap();
        }
        let txn = imu.register_preintegrated_factor(1.0, None, None);
        let VariableValue::Pose(pose_j) = txn
            .variables
            .iter()
            .find(|(id, _)| *id == VariableId::pose(1.0))
            .unwrap()
            .1
            .clone()
        else {
            panic!("expected pose variable");
        };
        assert_relative_eq!(pose_j.translation.vector.x, 0.5, epsilon = 1e-6);
        assert_relative_eq!(pose_j.translation.vector.y, 0.0, epsilon = 1e-6);
        assert_relative_eq!(pose_j.translation.vector.z, 0.0, epsilon = 1e-6);

        let VariableValue::Velocity(v_j) = txn
            .variables
            .iter()
            .find(|(id, _)| *id == VariableId::velocity(1.0))
            .unwrap()
            .1
            .clone()
        else {
            panic!("expected velocity variable");
        };
        assert_relative_eq!(v_j.x, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn register_then_predict_matches_committed_state() {
        let mut imu = straight_line_preintegrator();
        imu.set_start(0.0, None, None, None);
        for i in 1..=50 {
            let stamp = i as f64 * 0.01;
            imu.push_sample(ImuSample {
                stamp,
                omega: Vector3::new(0.0, 0.0, 0.1),
                accel: Vector3::new(0.2, 0.0, 9.81),
            })
            .unwrap();
        }
        imu.register_preintegrated_factor(0.5, None, None);
        let predicted = imu.predict_pose(0.5).unwrap();
        assert_relative_eq!(
            predicted.translation.vector,
            imu.anchor().position,
            epsilon = 1e-9
        );
    }

    #[test]
    fn out_of_order_sample_is_rejected() {
        let mut imu = straight_line_preintegrator();
        imu.push_sample(ImuSample { stamp: 1.0, omega: Vector3::zeros(), accel: Vector3::zeros() })
            .unwrap();
        let err = imu
            .push_sample(ImuSample { stamp: 0.5, omega: Vector3::zeros(), accel: Vector3::zeros() })
            .unwrap_err();
        assert_eq!(err.kind(), "OUT_OF_ORDER");
    }

    #[test]
    fn predict_before_buffer_front_is_not_ready() {
        let mut imu = straight_line_preintegrator();
        imu.set_start(5.0, None, None, None);
        let err = imu.predict_pose(1.0).unwrap_err();
        assert_eq!(err.kind(), "NOT_READY");
    }

    #[test]
    fn empty_interval_returns_empty_transaction() {
        let mut imu = straight_line_preintegrator();
        imu.set_start(1.0, None, None, None);
        let txn = imu.register_preintegrated_factor(1.0, None, None);
        assert!(txn.is_empty());
    }

    /// Bias-Jacobian correction should approximate a fresh
    /// re-integration with a perturbed bias to within the tolerance
    /// named in spec.md §8 (1e-3 rotation, 1e-2 position).
    #[test]
    fn bias_jacobian_correction_matches_reintegration() {
        let make = |gyro_bias: Vector3<f64>, accel_bias: Vector3<f64>| {
            let mut imu = straight_line_preintegrator();
            imu.set_start(0.0, None, None, None);
            imu.anchor.gyro_bias = gyro_bias;
            imu.anchor.accel_bias = accel_bias;
            imu.delta = PreintegratedDelta::identity(gyro_bias, accel_bias);
            for i in 1..=80 {
                let stamp = i as f64 * 0.01;
                imu.push_sample(ImuSample {
                    stamp,
                    omega: Vector3::new(0.05, -0.02, 0.1),
                    accel: Vector3::new(0.5, 0.1, 9.81),
                })
                .unwrap();
            }
            imu
        };

        let nominal = make(Vector3::zeros(), Vector3::zeros());
        let perturbed_bg = Vector3::new(0.002, -0.001, 0.0015);
        let perturbed_ba = Vector3::new(0.01, -0.005, 0.008);
        let reintegrated = make(perturbed_bg, perturbed_ba);

        let (corrected_q, _corrected_v, corrected_p) =
            nominal.delta.corrected(perturbed_bg, perturbed_ba);

        let rot_err = crate::geometry::so3_log(&(corrected_q.inverse() * reintegrated.delta.delta_q)).norm();
        let pos_err = (corrected_p - reintegrated.delta.delta_p).norm();

        assert!(rot_err < 1e-3, "rotation error {rot_err} too large");
        assert!(pos_err < 1e-2, "position error {pos_err} too large");
    }

    #[test]
    fn covariance_stays_positive_semidefinite() {
        let mut imu = straight_line_preintegrator();
        imu.set_start(0.0, None, None, None);
        for i in 1..=30 {
            let stamp = i as f64 * 0.01;
            imu.push_sample(ImuSample {
                stamp,
                omega: Vector3::new(0.1, 0.2, -0.1),
                accel: Vector3::new(0.3, -0.2, 9.81),
            })
            .unwrap();
        }
        let cov = imu.current_delta().covariance;
        let sym = (cov + cov.transpose()) * 0.5;
        let eigen = sym.symmetric_eigenvalues();
        for v in eigen.iter() {
            assert!(*v >= -1e-9, "negative eigenvalue {v}");
        }
    }
}
