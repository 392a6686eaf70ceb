/// Power in watts that moves `percentage` of a `capacity` kWh battery in
/// `seconds`. A Wh is 3600 J; kWh times percent divided by 100 gives 36000.
pub fn charge_rate(percentage: f64, capacity: f64, seconds: f64) -> Option<f64> {
    if seconds == 0.0 {
        return None;
    }
    Some((percentage * capacity * 36000.0 / seconds).round())
}

/// Charge/discharge rate needed to reach the window target, cached between
/// ticks so the power does not creep up as the window runs out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChargeRate {
    rate: Option<f64>,
    prev_soc: Option<f64>,
}

impl ChargeRate {
    pub fn get(&self) -> Option<f64> {
        self.rate
    }

    pub fn reset(&mut self) {
        self.rate = None;
    }

    /// Recalculate only when nothing is cached or the SoC moved.
    pub fn update(&mut self, soc: f64, seconds: f64, percentage: f64, capacity: f64) {
        if self.rate.is_some() && self.prev_soc == Some(soc) {
            return;
        }
        self.rate = charge_rate(percentage, capacity, seconds);
        if self.rate.is_some() {
            self.prev_soc = Some(soc);
        }
    }
}
