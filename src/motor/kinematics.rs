// Electrical speed to wheel speed conversion
//
// ERPM = mechanical RPM * pole pairs. Wheel speed follows from the wheel
// circumference (hub motors, no gearing).

use std::f32::consts::PI;

/// Wheel speed in km/h for an electrical speed
pub fn erpm_to_kmh(erpm: i32, pole_pairs: u32, wheel_radius_m: f32) -> f32 {
    if pole_pairs == 0 {
        return 0.0;
    }
    let rpm = erpm as f32 / pole_pairs as f32;
    // m/min -> km/h
    rpm * 2.0 * PI * wheel_radius_m * 60.0 / 1000.0
}
