//! Speed-loop PI controller. The wheel's speed mode is a plain PI onto
//! commanded current; there is no derivative term, so no filtering either.

/// Default gains, amps per rad/s of speed error.
pub const KP_SPEED: f32 = 0.05;
pub const KI_SPEED: f32 = 0.01;

/// Anti-windup clamp on the integral contribution, in amps.
pub const INTEGRATOR_CLAMP_A: f32 = 3.;

/// Controller scratch. Reset on every entry into speed mode so the windup
/// from one maneuver can't bleed into the next.
#[derive(Clone, Copy, Default)]
pub struct SpeedPi {
    /// Accumulated error, rad/s · s.
    pub integral: f32,
    /// Output of the last update, amps.
    pub last_out: f32,
}

impl SpeedPi {
    pub fn reset(&mut self) {
        self.integral = 0.;
        self.last_out = 0.;
    }

    /// One controller step. `setpoint` and `omega` in rad/s; returns the
    /// commanded current in amps, before the plant limits.
    pub fn update(&mut self, setpoint: f32, omega: f32, dt: f32) -> f32 {
        let error = setpoint - omega;
        let p = KP_SPEED * error;

        self.integral += error * dt;
        let clamp = INTEGRATOR_CLAMP_A / KI_SPEED;
        self.integral = self.integral.clamp(-clamp, clamp);

        let out = p + KI_SPEED * self.integral;
        self.last_out = out;
        out
    }
}
