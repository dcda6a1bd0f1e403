// =============================================================================
// Velocity / Acceleration — finite differences of price
// =============================================================================
//
// Velocity    = first derivative  = close[t] - close[t-1]
// Acceleration = second derivative = velocity[t] - velocity[t-1]

#[derive(Debug, Clone, Copy)]
pub struct VelocityResult {
    pub velocity: f64,
    pub acceleration: f64,
}

/// Compute velocity and acceleration from the tail of a close-price series.
/// Requires at least 3 points (two to form the last two velocities).
pub fn calculate_velocity(closes: &[f64]) -> Option<VelocityResult> {
    if closes.len() < 3 {
        return None;
    }

    let n = closes.len();
    let velocity = closes[n - 1] - closes[n - 2];
    let prev_velocity = closes[n - 2] - closes[n - 3];
    let acceleration = velocity - prev_velocity;

    if !velocity.is_finite() || !acceleration.is_finite() {
        return None;
    }

    Some(VelocityResult {
        velocity,
        acceleration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn velocity_insufficient_data() {
        assert!(calculate_velocity(&[1.0, 2.0]).is_none());
    }

    #[test]
    fn velocity_constant_acceleration_is_zero() {
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let r = calculate_velocity(&closes).unwrap();
        assert!((r.velocity - 1.0).abs() < 1e-9);
        assert!(r.acceleration.abs() < 1e-9);
    }

    #[test]
    fn velocity_accelerating_series() {
        let closes: Vec<f64> = (0..10).map(|i| (i * i) as f64).collect();
        let r = calculate_velocity(&closes).unwrap();
        assert!(r.acceleration > 0.0);
    }

    #[test]
    fn velocity_negative_on_decline() {
        let closes: Vec<f64> = (1..=10).rev().map(|x| x as f64).collect();
        let r = calculate_velocity(&closes).unwrap();
        assert!(r.velocity < 0.0);
    }
}
