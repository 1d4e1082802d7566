/// Limits how far a value may move toward its target per step.
#[derive(Debug, Clone, Copy)]
pub struct RampLimiter {
    up: i32,
    down: i32,
    value: i32,
}

impl RampLimiter {
    /// `up` and `down` are the largest increase / decrease per step (> 0)
    pub fn new(up: i32, down: i32) -> Self {
        Self {
            up: up.max(1),
            down: down.max(1),
            value: 0,
        }
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    /// Jump straight to `value` (brake, disable)
    pub fn reset(&mut self, value: i32) {
        self.value = value;
    }

    /// Move toward `target` by at most one step, never past it
    pub fn step(&mut self, target: i32) -> i32 {
        self.value = if target > self.value {
            self.value.saturating_add(self.up).min(target)
        } else {
            self.value.saturating_sub(self.down).max(target)
        };
        self.value
    }
}
