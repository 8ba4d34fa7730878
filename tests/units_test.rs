use dfa_glitcher::error::GlitchError;
use dfa_glitcher::prelude::*;
use dfa_glitcher::units::MAX_CLOCKS;

#[test]
/// Default timing of the rig
///
/// 61953 ns delay and 513 ns length at 150 MHz with the 40 ns offset
fn default_parameters() {
    let clock = ClockParameters::default();
    let params = GlitchParameters::default();
    assert_eq!(9287, params.delay_clocks());
    assert_eq!(77, params.length_clocks());
    assert_eq!(9287, clock.delay_to_clocks(61953.0).unwrap());
    assert_eq!(77, clock.length_to_clocks(513.0).unwrap());
    assert_eq!(Edge::Rising, params.input_trigger_edge);
    assert_eq!(Polarity::ActiveHigh, params.output_polarity);
}

#[test]
/// Raw conversion in both directions
fn raw_conversion() {
    let clock = ClockParameters::new(10.0, 0.0).unwrap();
    assert_eq!(5, clock.to_clocks(54.0, 0.0).unwrap());
    assert_eq!(6, clock.to_clocks(56.0, 0.0).unwrap());
    assert_eq!(3, clock.to_clocks(54.0, 20.0).unwrap());
    assert_eq!(50.0, clock.to_nanoseconds(5, 0.0));
    assert_eq!(70.0, clock.to_nanoseconds(5, 20.0));
    assert_eq!(
        Err(GlitchError::OutOfRange {
            clocks: -10,
            max: MAX_CLOCKS
        }),
        clock.to_clocks(-100.0, 0.0)
    );
    assert!(matches!(
        clock.to_clocks(655_360.0, 0.0),
        Err(GlitchError::OutOfRange { .. })
    ));
}

#[test]
/// Setters answer with the quantized value, never the request
fn reply_is_quantized() {
    let clock = ClockParameters::default();
    let mut params = GlitchParameters::default();
    let delay = params.set_delay_ns(&clock, 61953.0).unwrap();
    assert_ne!(61953.0, delay);
    assert!((delay - 61953.333).abs() < 0.01);
    assert_eq!(delay, params.delay_ns(&clock));
    let length = params.set_length_ns(&clock, 513.0).unwrap();
    assert!((length - 513.333).abs() < 0.01);
    assert_eq!(length, params.length_ns(&clock));
}

#[test]
/// Re-applying a reported value does not move it
fn quantization_is_idempotent() {
    let clock = ClockParameters::default();
    let mut params = GlitchParameters::default();
    for request in (40..400_000).step_by(997) {
        let first = params.set_delay_ns(&clock, request as f64).unwrap();
        let second = params.set_delay_ns(&clock, first).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, clock.delay_ns(clock.delay_to_clocks(first).unwrap()));
    }
    for request in (4..400_000).step_by(1009) {
        let first = params.set_length_ns(&clock, request as f64).unwrap();
        let second = params.set_length_ns(&clock, first).unwrap();
        assert_eq!(first, second);
    }
}

#[test]
/// Requests outside the engine range are rejected and change nothing
fn out_of_range_requests() {
    let clock = ClockParameters::default();
    let mut params = GlitchParameters::default();

    // Below the minimum delay offset
    let error = params.set_delay_ns(&clock, 0.0).unwrap_err();
    assert!(matches!(error, GlitchError::InvalidParameter { .. }));
    assert!(error.to_string().contains("40 ns"));
    // Above 65535 clocks
    assert!(params.set_delay_ns(&clock, 500_000.0).is_err());
    // Zero clocks is no pulse
    assert!(params.set_length_ns(&clock, 0.0).is_err());
    assert!(params.set_length_ns(&clock, 3.0).is_err());
    assert!(params.set_length_ns(&clock, 500_000.0).is_err());
    assert_eq!(GlitchParameters::default(), params);

    // Edges of the valid range
    assert_eq!(0, clock.delay_to_clocks(40.0).unwrap());
    assert_eq!(1, clock.length_to_clocks(4.0).unwrap());
    let (_, max_delay) = clock.delay_bounds_ns();
    assert_eq!(MAX_CLOCKS as u16, clock.delay_to_clocks(max_delay).unwrap());
}

#[test]
/// Clock descriptions must have a positive period
fn invalid_clock() {
    assert!(ClockParameters::new(0.0, 40.0).is_err());
    assert!(ClockParameters::new(-1.0, 40.0).is_err());
    assert!(ClockParameters::new(f64::NAN, 40.0).is_err());
    assert!(ClockParameters::from_frequency_mhz(0.0, 40.0).is_err());
    let clock = ClockParameters::from_frequency_mhz(125.0, 0.0).unwrap();
    assert_eq!(8.0, clock.period_ns());
    assert_eq!(125, clock.cycles_per_micros(1));
    assert!(GlitchParameters::from_clocks(10, 0, Edge::Rising, Polarity::ActiveLow).is_err());
}
