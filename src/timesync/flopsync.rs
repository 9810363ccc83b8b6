//! FLOPSYNC-2 clock synchronization controller.
//!
//! Reaches zero steady-state error under both step-like and ramp-like
//! disturbances, which is what slow temperature-driven skew looks like at
//! the controller's time scale. All arithmetic is integer; controller
//! state is carried multiplied by 512.
//!
//! The receiver window is sized to three sigma of the synchronization
//! error variance over a rolling window, clamped to `[W_MIN, W_MAX]`; on
//! packet loss the window grows by 1.7x (clamped) and the last correction
//! is reused.

/// Minimum receiver window, nanoseconds (50 us).
pub const W_MIN: i32 = 50_000;
/// Maximum receiver window, nanoseconds (6 ms).
pub const W_MAX: i32 = 6_000_000;

/// Samples per variance computation.
const NUM_SAMPLES: i32 = 5;
/// Error prescaler to avoid overflow in the controller.
const CONTROLLER_SCALE: i32 = 6;
/// Error prescaler to avoid overflow in the variance accumulator.
const VARIANCE_SCALE: i32 = 300;

#[derive(Debug, Clone)]
pub struct Flopsync2 {
    eo: i32,
    eoo: i32,
    uo: i32,
    uoo: i32,
    sum: i32,
    square_sum: i32,
    three_sigma: i32,
    dw: i32,
    count: u8,
    init: u8,
}

impl Default for Flopsync2 {
    fn default() -> Self {
        Self::new()
    }
}

impl Flopsync2 {
    pub fn new() -> Self {
        let mut s = Self {
            eo: 0,
            eoo: 0,
            uo: 0,
            uoo: 0,
            sum: 0,
            square_sum: 0,
            three_sigma: 0,
            dw: 0,
            count: 0,
            init: 0,
        };
        s.reset();
        s
    }

    /// Compute clock correction and receiver window from the measured
    /// synchronization error (nanoseconds).
    pub fn compute_correction(&mut self, error: i64) -> (i64, i64) {
        let mut e = (error as i32) / CONTROLLER_SCALE;

        // Controller preinit, for fast boot convergence.
        match self.init {
            0 => {
                self.init = 1;
                // One step of a deadbeat controller.
                self.eo = e;
                self.uo = 2 * 512 * e;
                self.uoo = 512 * e;
                return ((2 * e * CONTROLLER_SCALE) as i64, W_MAX as i64);
            }
            1 => {
                self.init = 2;
                self.eo = 0;
                self.uo /= 2;
            }
            _ => {}
        }

        // FLOPSYNC-2 controller with alpha = 3/8:
        // u(k) = 2u(k-1) - u(k-2) + 1.875e(k) - 2.578125e(k-1)
        //        + 0.947265625e(k-2), values kept multiplied by 512.
        let u = 2 * self.uo - self.uoo + 960 * e - 1320 * self.eo + 485 * self.eoo;
        self.uoo = self.uo;
        self.uo = u;
        self.eoo = self.eo;
        self.eo = e;

        let sign = if u >= 0 { 1 } else { -1 };
        let uquant = (u + 256 * sign) / 512 * CONTROLLER_SCALE;

        // Receiver window from the rolling error variance.
        e = (error as i32) / VARIANCE_SCALE;
        self.sum += e;
        self.square_sum += e * e;
        self.count += 1;
        if i32::from(self.count) >= NUM_SAMPLES {
            // Variance as E[X^2] - E[X]^2.
            let average = self.sum / NUM_SAMPLES;
            let var = self.square_sum / NUM_SAMPLES - average * average;
            // Babylonian square root approximation.
            let mut stddev = var / 7;
            for _ in 0..3 {
                if stddev > 0 {
                    stddev = (stddev + var / stddev) / 2;
                }
            }
            self.three_sigma = (stddev * 3).max(1);
            self.dw = (self.three_sigma * VARIANCE_SCALE).clamp(W_MIN, W_MAX);
            self.sum = 0;
            self.square_sum = 0;
            self.count = 0;
        }

        (uquant as i64, self.dw as i64)
    }

    /// Correction and window when the sync packet was lost: reuse the last
    /// correction and widen the window.
    pub fn lost_packet(&mut self) -> (i64, i64) {
        if self.init == 1 {
            self.init = 2;
            self.eo = 0;
            self.uo /= 2;
        }
        self.dw = (self.dw.saturating_mul(17) / 10).min(W_MAX);
        (self.clock_correction(), self.dw as i64)
    }

    /// Reset after a resynchronization.
    pub fn reset(&mut self) {
        self.eo = 0;
        self.eoo = 0;
        self.uo = 0;
        self.uoo = 0;
        self.sum = 0;
        self.square_sum = 0;
        self.three_sigma = 0;
        self.count = 0;
        self.init = 0;
        self.dw = W_MAX;
    }

    pub fn sync_error(&self) -> i64 {
        i64::from(self.eo) * i64::from(CONTROLLER_SCALE)
    }

    pub fn clock_correction(&self) -> i64 {
        let sign = if self.uo >= 0 { 1 } else { -1 };
        i64::from((self.uo + 256 * sign) / 512 * CONTROLLER_SCALE)
    }

    pub fn receiver_window(&self) -> i64 {
        self.dw as i64
    }
}
