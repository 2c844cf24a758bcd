// MIT License - Copyright (c) 2026 Peter Wright

use tracing::debug;

/// Alarm condition of one client, mirrored on both sides of the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmState {
    Ok,
    Triggered,
    Breach,
}

impl AlarmState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Triggered => "TRIGGERED",
            Self::Breach => "BREACH",
        }
    }
}

/// What a sensor trigger did to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerEffect {
    /// Whether the trigger had an alarm consequence. False inside the egress
    /// window and for sensors with disarm_delay 0: the event is still
    /// reported, but state and deadline are untouched.
    pub armed: bool,
    /// The breach deadline in force after the trigger, if any.
    pub deadline: Option<u64>,
}

/// The OK / TRIGGERED / BREACH machine with its disarm and egress timers.
///
/// All methods take `now` in unix epoch seconds so both the client and the
/// server's mirror drive the same transition logic deterministically. The
/// client feeds it local signals; the server feeds it received TRIGGERED and
/// DISARMED events and infers BREACH from its own sweep.
#[derive(Debug, Clone)]
pub struct AlarmMachine {
    state: AlarmState,
    /// Once set, only ever moves earlier until cleared by a disarm.
    breach_deadline: Option<u64>,
    /// Start of the egress grace window, set by a temporary disarm.
    last_arm: Option<u64>,
    egress_delay: u64,
}

impl AlarmMachine {
    pub fn new(egress_delay: u64) -> Self {
        Self {
            state: AlarmState::Ok,
            breach_deadline: None,
            last_arm: None,
            egress_delay,
        }
    }

    pub fn state(&self) -> AlarmState {
        self.state
    }

    pub fn breach_deadline(&self) -> Option<u64> {
        self.breach_deadline
    }

    /// Whether `now` falls inside the egress grace window.
    pub fn in_egress_window(&self, now: u64) -> bool {
        self.last_arm
            .is_some_and(|armed_at| now < armed_at.saturating_add(self.egress_delay))
    }

    /// A sensor went active. Computes the alarm consequence, if any.
    ///
    /// The deadline is `now + disarm_delay` unless a sooner pending deadline
    /// already exists, in which case the sooner one is kept.
    pub fn on_trigger(&mut self, disarm_delay: u64, now: u64) -> TriggerEffect {
        if disarm_delay == 0 || self.in_egress_window(now) {
            return TriggerEffect {
                armed: false,
                deadline: None,
            };
        }
        if self.state == AlarmState::Breach {
            // Already breached; the trigger is reported but changes nothing.
            return TriggerEffect {
                armed: true,
                deadline: None,
            };
        }

        let candidate = now.saturating_add(disarm_delay);
        let deadline = match self.breach_deadline {
            Some(existing) if existing <= candidate => existing,
            _ => candidate,
        };
        self.breach_deadline = Some(deadline);
        self.state = AlarmState::Triggered;
        TriggerEffect {
            armed: true,
            deadline: Some(deadline),
        }
    }

    /// Mirror a received TRIGGERED event carrying the client's computed
    /// deadline. An event with no deadline had no alarm consequence.
    pub fn on_remote_trigger(&mut self, deadline: Option<u64>) {
        let Some(candidate) = deadline else {
            return;
        };
        if self.state == AlarmState::Breach {
            return;
        }
        let deadline = match self.breach_deadline {
            Some(existing) if existing <= candidate => existing,
            _ => candidate,
        };
        self.breach_deadline = Some(deadline);
        self.state = AlarmState::Triggered;
    }

    /// A disarm signal. Clears the breach deadline entirely and recovers the
    /// machine even after a breach has already fired. Returns whether the
    /// state actually changed.
    pub fn on_disarm(&mut self) -> bool {
        self.breach_deadline = None;
        match self.state {
            AlarmState::Triggered | AlarmState::Breach => {
                debug!("disarm: {} -> OK", self.state.as_str());
                self.state = AlarmState::Ok;
                true
            }
            AlarmState::Ok => false,
        }
    }

    /// Temporary disarm: opens the egress window. Triggers within
    /// `egress_delay` seconds are reported without alarm consequence.
    pub fn arm_for_egress(&mut self, now: u64) {
        self.last_arm = Some(now);
    }

    /// Timer sweep. Fires the breach transition when the deadline has
    /// elapsed with no disarm; a deadline already in the past fires on the
    /// very next tick. Returns true exactly once per breach.
    pub fn tick(&mut self, now: u64) -> bool {
        if self.state == AlarmState::Triggered
            && self.breach_deadline.is_some_and(|deadline| now >= deadline)
        {
            self.state = AlarmState::Breach;
            self.breach_deadline = None;
            return true;
        }
        false
    }
}
