//! Lifecycle of the timing engine on its execution unit.

use crossbeam_channel::{bounded, Receiver};
use log::debug;

use crate::engine::{Edge, EngineProgram, EngineVariant, Polarity};
use crate::error::GlitchError;
use crate::hardware::{ExecutionUnit, FiredEvent, Pull, STATUS_MASK};
use crate::units::{ClockParameters, GlitchParameters};

/// Completion handler. Runs on the main loop from [`GlitchController::service_notifications`]
/// and may re-arm through the controller it is given.
pub type FiredHandler<U> = Box<dyn FnMut(&mut GlitchController<U>, FiredEvent)>;

/// Reply to a successful arm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArmAck {
    pub variant: EngineVariant,
    /// Delay the engine will produce, derived from the loaded clocks.
    pub delay_ns: f64,
    /// Pulse width the engine will produce, derived from the loaded clocks.
    pub length_ns: f64,
}

/// Owns one execution unit and the engine program running on it.
pub struct GlitchController<U: ExecutionUnit> {
    unit: U,
    clock: ClockParameters,
    edge: Edge,
    polarity: Polarity,
    auto_rearm: bool,
    configured: bool,
    notifications: Receiver<FiredEvent>,
    handler: Option<FiredHandler<U>>,
}

impl<U: ExecutionUnit> GlitchController<U> {
    /// Takes ownership of `unit` and wires its completion notifier to a single-slot
    /// channel. Nothing is configured until the first [`configure`](Self::configure)
    /// or [`arm`](Self::arm).
    pub fn new(mut unit: U, clock: ClockParameters) -> Self {
        let (sender, notifications) = bounded(1);
        unit.connect_notifier(sender);
        let defaults = GlitchParameters::default();
        Self {
            unit,
            clock,
            edge: defaults.input_trigger_edge,
            polarity: defaults.output_polarity,
            auto_rearm: false,
            configured: false,
            notifications,
            handler: None,
        }
    }

    pub fn clock(&self) -> &ClockParameters {
        &self.clock
    }

    pub fn unit(&self) -> &U {
        &self.unit
    }

    pub fn unit_mut(&mut self) -> &mut U {
        &mut self.unit
    }

    /// Variant the next arm will install.
    pub fn variant(&self) -> EngineVariant {
        EngineVariant::new(self.edge, self.polarity, self.auto_rearm)
    }

    /// Selects trigger edge and pulse polarity.
    ///
    /// Tears down any running engine, biases the trigger input towards its pre-edge
    /// level and parks the outputs at the inactive level of the new polarity.
    ///
    /// # Arguments
    ///
    /// * `edge` - Trigger edge the engine waits for.
    /// * `polarity` - Active level of the glitch pulse.
    pub fn configure(&mut self, edge: Edge, polarity: Polarity) {
        self.teardown();
        self.edge = edge;
        self.polarity = polarity;
        self.unit.configure_trigger_input(Pull::towards(edge.pre_level()));
        self.unit.configure_outputs(polarity.inactive_level());
        self.configured = true;
        debug!("Configured {}", self.variant());
    }

    /// Switches between the one-shot and the auto-rearm program family. Disarms.
    pub fn set_auto_rearm(&mut self, auto_rearm: bool) {
        self.teardown();
        self.auto_rearm = auto_rearm;
    }

    pub fn auto_rearm(&self) -> bool {
        self.auto_rearm
    }

    /// Loads `params` and starts the engine.
    ///
    /// The engine consumes the pulse length first and the delay second. Arming while
    /// armed replaces the running engine.
    ///
    /// # Arguments
    ///
    /// * `params` - Timing and polarity. A differing edge or polarity reconfigures first.
    /// * `on_fired` - Optional completion handler.
    ///
    /// # Returns
    ///
    /// * `Ok(ArmAck)` - Variant and the authoritative nanosecond values.
    /// * `Err(GlitchError)` - Execution unit refused the program or parameters. The
    ///   unit is left disarmed.
    pub fn arm(
        &mut self,
        params: &GlitchParameters,
        on_fired: Option<FiredHandler<U>>,
    ) -> Result<ArmAck, GlitchError> {
        if !self.configured
            || params.input_trigger_edge != self.edge
            || params.output_polarity != self.polarity
        {
            self.configure(params.input_trigger_edge, params.output_polarity);
        }
        self.teardown();

        let variant = self.variant();
        if let Err(error) = self.load(variant, params) {
            self.teardown();
            return Err(error);
        }
        self.handler = on_fired;
        self.unit.set_enabled(true);

        let ack = ArmAck {
            variant,
            delay_ns: params.delay_ns(&self.clock),
            length_ns: params.length_ns(&self.clock),
        };
        debug!(
            "Armed {} delay {:.1} ns ({} clocks) length {:.1} ns ({} clocks)",
            variant,
            ack.delay_ns,
            params.delay_clocks(),
            ack.length_ns,
            params.length_clocks()
        );
        Ok(ack)
    }

    fn load(&mut self, variant: EngineVariant, params: &GlitchParameters) -> Result<(), GlitchError> {
        self.unit.install(&EngineProgram::assemble(variant))?;
        self.unit.push(u32::from(params.length_clocks()))?;
        self.unit.push(u32::from(params.delay_clocks()))
    }

    /// Halts the engine. Safe in any state.
    pub fn disarm(&mut self) {
        if self.is_armed() {
            debug!("Glitcher disarmed");
        }
        self.teardown();
    }

    /// Armed status, read from the execution unit's control register.
    pub fn is_armed(&self) -> bool {
        self.unit.control_register() & STATUS_MASK != 0
    }

    /// Delivers pending completion notifications on the caller's thread.
    ///
    /// One-shot engines are disarmed before their handler runs. Returns the number
    /// of notifications serviced.
    pub fn service_notifications(&mut self) -> usize {
        let events: Vec<FiredEvent> = self.notifications.try_iter().collect();
        for event in &events {
            debug!("Glitch fired at cycle {}", event.cycle);
            let mut handler = self.handler.take();
            if !self.auto_rearm {
                self.teardown();
            }
            if let Some(handler) = handler.as_mut() {
                handler(self, *event);
            }
            // Still running (auto re-arm or re-armed by the handler) and no successor registered
            if self.handler.is_none() && self.is_armed() {
                self.handler = handler;
            }
        }
        events.len()
    }

    fn teardown(&mut self) {
        self.unit.set_enabled(false);
        self.unit.remove();
        self.handler = None;
        let stale = self.notifications.try_iter().count();
        if stale > 0 {
            debug!("Dropped {stale} stale glitch notification(s)");
        }
    }
}
