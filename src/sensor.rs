// MIT License - Copyright (c) 2026 Peter Wright

/// A single physical sensor input.
///
/// Created at configuration load and lives as long as its owning client.
/// `disarm_delay` of 0 means the sensor reports but never causes an alarm.
#[derive(Debug, Clone)]
pub struct Sensor {
    pub id: u32,
    /// Grace period (seconds) after a trigger during which a disarm must
    /// arrive before a breach is declared. 0 disables breach entirely.
    pub disarm_delay: u64,
    pub triggered: bool,
}

impl Sensor {
    pub fn new(id: u32, disarm_delay: u64) -> Self {
        Self {
            id,
            disarm_delay,
            triggered: false,
        }
    }

    /// Mark the sensor active. Returns false when it was already triggered.
    pub fn trigger(&mut self) -> bool {
        let was = self.triggered;
        self.triggered = true;
        !was
    }

    /// Mark the sensor back at rest. Returns false when it was already at rest.
    pub fn restore(&mut self) -> bool {
        let was = self.triggered;
        self.triggered = false;
        was
    }
}
