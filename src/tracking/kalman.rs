// SPDX-License-Identifier: Apache-2.0

use nalgebra::{convert, OMatrix, RealField, SVector, U2, U4};

/// Constant velocity model over the ground plane, the state being
/// `[x, y, vx, vy]`.
#[derive(Debug, Clone)]
pub struct ConstantVelocityXY<R>
where
    R: RealField,
{
    pub mean: SVector<R, 4>,
    pub covariance: OMatrix<R, U4, U4>,
    /// Acceleration noise density in (m/s²)².
    pub process_noise: R,
    /// Position measurement variance in m².
    pub measurement_noise: R,
    update_matrix: OMatrix<R, U2, U4>,
}

impl<R> ConstantVelocityXY<R>
where
    R: RealField + Copy,
{
    pub fn new(
        position: &[R; 2],
        velocity: &[R; 2],
        process_noise: R,
        measurement_noise: R,
    ) -> Self {
        let mean = SVector::<R, 4>::from_row_slice(&[
            position[0],
            position[1],
            velocity[0],
            velocity[1],
        ]);

        let position_var = measurement_noise;
        let velocity_var: R = convert(4.0);
        let diag = SVector::<R, 4>::from_row_slice(&[
            position_var,
            position_var,
            velocity_var,
            velocity_var,
        ]);

        let mut update_matrix = OMatrix::<R, U2, U4>::zeros();
        update_matrix[(0, 0)] = R::one();
        update_matrix[(1, 1)] = R::one();

        Self {
            mean,
            covariance: OMatrix::<R, U4, U4>::from_diagonal(&diag),
            process_noise,
            measurement_noise,
            update_matrix,
        }
    }

    #[inline]
    pub fn position(&self) -> [R; 2] {
        [self.mean[0], self.mean[1]]
    }

    #[inline]
    pub fn velocity(&self) -> [R; 2] {
        [self.mean[2], self.mean[3]]
    }

    /// Propagates the state by `dt` seconds.
    pub fn predict(&mut self, dt: R) {
        let mut motion_matrix = OMatrix::<R, U4, U4>::identity();
        motion_matrix[(0, 2)] = dt;
        motion_matrix[(1, 3)] = dt;

        // Discrete white noise acceleration.
        let two: R = convert(2.0);
        let four: R = convert(4.0);
        let dt2 = dt * dt;
        let pp = dt2 * dt2 / four * self.process_noise;
        let pv = dt2 * dt / two * self.process_noise;
        let vv = dt2 * self.process_noise;
        let mut motion_cov = OMatrix::<R, U4, U4>::zeros();
        motion_cov[(0, 0)] = pp;
        motion_cov[(1, 1)] = pp;
        motion_cov[(0, 2)] = pv;
        motion_cov[(2, 0)] = pv;
        motion_cov[(1, 3)] = pv;
        motion_cov[(3, 1)] = pv;
        motion_cov[(2, 2)] = vv;
        motion_cov[(3, 3)] = vv;

        self.mean = motion_matrix * self.mean;
        self.covariance = motion_matrix * self.covariance * motion_matrix.transpose() + motion_cov;
    }

    /// Projects the state into measurement space.
    pub fn project(&self) -> (SVector<R, 2>, OMatrix<R, U2, U2>) {
        let innovation_cov = OMatrix::<R, U2, U2>::identity() * self.measurement_noise;
        let mean = self.update_matrix * self.mean;
        let covariance =
            self.update_matrix * self.covariance * self.update_matrix.transpose() + innovation_cov;
        (mean, covariance)
    }

    /// Corrects the state with a measured position.
    pub fn update(&mut self, measurement: &[R; 2]) {
        let measurement = SVector::<R, 2>::from_row_slice(measurement);

        let (projected_mean, projected_cov) = self.project();
        let cho_factor = match projected_cov.cholesky() {
            None => return,
            Some(v) => v,
        };
        let kalman_gain = cho_factor
            .solve(&(self.covariance * self.update_matrix.transpose()).transpose())
            .transpose();

        let innovation = measurement - projected_mean;
        self.mean += kalman_gain * innovation;
        self.covariance -= kalman_gain * projected_cov * kalman_gain.transpose();
    }

    /// Euclidean distance between the predicted position and a measurement.
    pub fn distance(&self, measurement: &[R; 2]) -> R {
        let dx = self.mean[0] - measurement[0];
        let dy = self.mean[1] - measurement[1];
        (dx * dx + dy * dy).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::ConstantVelocityXY;

    #[test]
    fn predict_moves_with_velocity() {
        let mut t = ConstantVelocityXY::new(&[10.0f32, 0.0], &[-2.0, 1.0], 1.0, 0.25);
        t.predict(0.5);
        let [x, y] = t.position();
        assert!((x - 9.0).abs() < 1e-5);
        assert!((y - 0.5).abs() < 1e-5);
    }

    #[test]
    fn update_learns_velocity() {
        let mut t = ConstantVelocityXY::new(&[0.0f32, 0.0], &[0.0, 0.0], 1.0, 0.04);
        for i in 1..=30 {
            t.predict(0.1);
            t.update(&[i as f32 * 0.1, 0.0]);
        }

        let [vx, vy] = t.velocity();
        assert!((vx - 1.0).abs() < 0.1, "vx={}", vx);
        assert!(vy.abs() < 0.1, "vy={}", vy);
        assert!(t.distance(&[3.0, 0.0]) < 0.1);
    }
}
