use crate::engine::{Edge, Polarity};
use crate::error::GlitchError;
use log::debug;

/// Largest count the engine's 16 bit parameter words can hold.
pub const MAX_CLOCKS: u32 = 0xFFFF;

/// Engine clock of the controller board.
pub const DEFAULT_CLOCK_MHZ: f64 = 150.0;

/// Empirical correction added to every delay: the engine needs a few clocks to
/// reach its compare point after the trigger edge.
pub const DEFAULT_MIN_DELAY_OFFSET_NS: f64 = 40.0;

// 61953 ns and 513 ns at 150 MHz with the 40 ns offset
const DEFAULT_DELAY_CLOCKS: u16 = 9287;
const DEFAULT_LENGTH_CLOCKS: u16 = 77;

/// Process wide clock description used for every nanosecond/clock conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockParameters {
    period_ns: f64,
    min_delay_offset_ns: f64,
}

impl Default for ClockParameters {
    fn default() -> Self {
        Self {
            period_ns: 1000.0 / DEFAULT_CLOCK_MHZ,
            min_delay_offset_ns: DEFAULT_MIN_DELAY_OFFSET_NS,
        }
    }
}

impl ClockParameters {
    /// Creates clock parameters from a period in nanoseconds.
    ///
    /// # Arguments
    ///
    /// * `period_ns` - Duration of one engine cycle. Must be finite and positive.
    /// * `min_delay_offset_ns` - Minimum achievable trigger delay.
    ///
    /// # Returns
    ///
    /// * `Ok(Self)` - Valid clock description.
    /// * `Err(GlitchError::InvalidParameter)` - Period or offset unusable.
    pub fn new(period_ns: f64, min_delay_offset_ns: f64) -> Result<Self, GlitchError> {
        if !period_ns.is_finite() || period_ns <= 0.0 {
            return Err(GlitchError::invalid(format!(
                "clock period must be positive, got {period_ns} ns"
            )));
        }
        if !min_delay_offset_ns.is_finite() || min_delay_offset_ns < 0.0 {
            return Err(GlitchError::invalid(format!(
                "minimum delay offset must not be negative, got {min_delay_offset_ns} ns"
            )));
        }
        Ok(Self {
            period_ns,
            min_delay_offset_ns,
        })
    }

    /// Creates clock parameters from an engine frequency in MHz.
    pub fn from_frequency_mhz(mhz: f64, min_delay_offset_ns: f64) -> Result<Self, GlitchError> {
        if !mhz.is_finite() || mhz <= 0.0 {
            return Err(GlitchError::invalid(format!(
                "clock frequency must be positive, got {mhz} MHz"
            )));
        }
        Self::new(1000.0 / mhz, min_delay_offset_ns)
    }

    pub fn period_ns(&self) -> f64 {
        self.period_ns
    }

    pub fn min_delay_offset_ns(&self) -> f64 {
        self.min_delay_offset_ns
    }

    /// Number of engine cycles in `micros` microseconds, rounded to the nearest cycle.
    pub fn cycles_per_micros(&self, micros: u64) -> u64 {
        (micros as f64 * 1000.0 / self.period_ns).round() as u64
    }

    /// Converts a nanosecond request into the closest whole number of clocks.
    ///
    /// `round((ns - floor_offset_ns) / period)`, rejected with `OutOfRange` when the
    /// result is negative or exceeds [`MAX_CLOCKS`].
    pub fn to_clocks(&self, ns: f64, floor_offset_ns: f64) -> Result<u32, GlitchError> {
        if !ns.is_finite() {
            return Err(GlitchError::invalid(format!("{ns} is not a duration")));
        }
        let clocks = ((ns - floor_offset_ns) / self.period_ns).round();
        if clocks < 0.0 || clocks > MAX_CLOCKS as f64 {
            return Err(GlitchError::OutOfRange {
                clocks: clocks as i64,
                max: MAX_CLOCKS,
            });
        }
        Ok(clocks as u32)
    }

    /// `clocks * period + floor_offset_ns`
    pub fn to_nanoseconds(&self, clocks: u32, floor_offset_ns: f64) -> f64 {
        clocks as f64 * self.period_ns + floor_offset_ns
    }

    /// Delay request to clocks, including the minimum delay offset.
    pub fn delay_to_clocks(&self, ns: f64) -> Result<u16, GlitchError> {
        match self.to_clocks(ns, self.min_delay_offset_ns) {
            Ok(clocks) => Ok(clocks as u16),
            Err(_) => {
                let (min, max) = self.delay_bounds_ns();
                Err(GlitchError::invalid(format!(
                    "invalid delay {ns} ns: must be between {} ns and {} ns",
                    min.round(),
                    max.round()
                )))
            }
        }
    }

    /// Length request to clocks. Pulse widths carry no offset correction and need at
    /// least one clock.
    pub fn length_to_clocks(&self, ns: f64) -> Result<u16, GlitchError> {
        match self.to_clocks(ns, 0.0) {
            Ok(clocks) if clocks >= 1 => Ok(clocks as u16),
            _ => {
                let (min, max) = self.length_bounds_ns();
                Err(GlitchError::invalid(format!(
                    "invalid length {ns} ns: must be between {} ns and {} ns",
                    min.round(),
                    max.round()
                )))
            }
        }
    }

    pub fn delay_ns(&self, clocks: u16) -> f64 {
        self.to_nanoseconds(clocks as u32, self.min_delay_offset_ns)
    }

    pub fn length_ns(&self, clocks: u16) -> f64 {
        self.to_nanoseconds(clocks as u32, 0.0)
    }

    /// Smallest and largest delay the engine can produce.
    pub fn delay_bounds_ns(&self) -> (f64, f64) {
        (self.delay_ns(0), self.delay_ns(MAX_CLOCKS as u16))
    }

    /// Smallest and largest pulse width the engine can produce.
    pub fn length_bounds_ns(&self) -> (f64, f64) {
        (self.length_ns(1), self.length_ns(MAX_CLOCKS as u16))
    }
}

/// Glitch timing and polarity.
///
/// The clock counts are the single source of truth. Nanosecond values are always
/// derived from them, so what an operator is told is exactly what the engine does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlitchParameters {
    delay_clocks: u16,
    length_clocks: u16,
    pub input_trigger_edge: Edge,
    pub output_polarity: Polarity,
}

impl Default for GlitchParameters {
    fn default() -> Self {
        Self {
            delay_clocks: DEFAULT_DELAY_CLOCKS,
            length_clocks: DEFAULT_LENGTH_CLOCKS,
            input_trigger_edge: Edge::Rising,
            output_polarity: Polarity::ActiveHigh,
        }
    }
}

impl GlitchParameters {
    /// Builds parameters from raw clock counts.
    ///
    /// # Returns
    ///
    /// * `Err(GlitchError::InvalidParameter)` - `length_clocks` is zero.
    pub fn from_clocks(
        delay_clocks: u16,
        length_clocks: u16,
        input_trigger_edge: Edge,
        output_polarity: Polarity,
    ) -> Result<Self, GlitchError> {
        if length_clocks == 0 {
            return Err(GlitchError::invalid("glitch length must be at least one clock"));
        }
        Ok(Self {
            delay_clocks,
            length_clocks,
            input_trigger_edge,
            output_polarity,
        })
    }

    pub fn delay_clocks(&self) -> u16 {
        self.delay_clocks
    }

    pub fn length_clocks(&self) -> u16 {
        self.length_clocks
    }

    pub fn delay_ns(&self, clock: &ClockParameters) -> f64 {
        clock.delay_ns(self.delay_clocks)
    }

    pub fn length_ns(&self, clock: &ClockParameters) -> f64 {
        clock.length_ns(self.length_clocks)
    }

    /// Sets the trigger delay to the closest achievable value.
    ///
    /// # Returns
    ///
    /// * `Ok(f64)` - The delay in ns the engine will actually produce.
    /// * `Err(GlitchError::InvalidParameter)` - Request out of range, nothing changed.
    pub fn set_delay_ns(&mut self, clock: &ClockParameters, ns: f64) -> Result<f64, GlitchError> {
        self.delay_clocks = clock.delay_to_clocks(ns)?;
        let actual = self.delay_ns(clock);
        debug!("Delay request {ns} ns -> {} clocks ({actual:.1} ns)", self.delay_clocks);
        Ok(actual)
    }

    /// Sets the pulse width to the closest achievable value.
    ///
    /// # Returns
    ///
    /// * `Ok(f64)` - The width in ns the engine will actually produce.
    /// * `Err(GlitchError::InvalidParameter)` - Request out of range, nothing changed.
    pub fn set_length_ns(&mut self, clock: &ClockParameters, ns: f64) -> Result<f64, GlitchError> {
        self.length_clocks = clock.length_to_clocks(ns)?;
        let actual = self.length_ns(clock);
        debug!("Length request {ns} ns -> {} clocks ({actual:.1} ns)", self.length_clocks);
        Ok(actual)
    }
}
