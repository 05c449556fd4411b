//! Yunmai SE/Mini body composition formulas.

use super::{limits, within};
use crate::user::ActivityLevel;

/// Rounds to two decimals the way the scale firmware does (`+0.5` then truncate).
fn round_hundredths(value: f32) -> f32 {
    ((value * 100.0) + 0.5) / 100.0
}

#[derive(Debug, Clone, Copy)]
pub struct YunmaiCalculator {
    /// 1 = male, 0 = female
    sex: i32,
    /// Height in cm
    height: f32,
    fitness_body_type: bool,
}

impl YunmaiCalculator {
    pub fn new(sex: i32, height: f32, activity_level: ActivityLevel) -> Self {
        Self {
            sex,
            height,
            fitness_body_type: Self::activity_flag(activity_level) == 1,
        }
    }

    /// Yunmai only knows "normal" (0) and "fitness" (1) body types.
    pub fn activity_flag(activity_level: ActivityLevel) -> u8 {
        match activity_level {
            ActivityLevel::Heavy | ActivityLevel::Extreme => 1,
            _ => 0,
        }
    }

    pub fn water(&self, body_fat: f32) -> f32 {
        within(((100.0 - body_fat) * 0.726 * 100.0 + 0.5) / 100.0, limits::WATER_PERCENT)
    }

    /// Body fat estimate for firmware that does not report it (protocol < 0x1E).
    /// Returns 0 outside the plausible 5..=75 range.
    pub fn fat(&self, age: i32, weight: f32, resistance: i32) -> f32 {
        let mut r = (resistance as f32 - 100.0) / 100.0;
        let h = self.height / 100.0;
        if r >= 1.0 {
            r = f64::from(r).sqrt() as f32;
        }

        let mut fat = (weight * 1.5 / h / h) + (age as f32 * 0.08);
        if self.sex == 1 {
            fat -= 10.8;
        }
        fat = (fat - 7.4) + r;

        if !(5.0..=75.0).contains(&fat) { 0.0 } else { fat }
    }

    pub fn muscle(&self, body_fat: f32) -> f32 {
        let share = if self.fitness_body_type { 0.7 } else { 0.67 };
        within(round_hundredths((100.0 - body_fat) * share), limits::MUSCLE_PERCENT)
    }

    pub fn skeletal_muscle(&self, body_fat: f32) -> f32 {
        let share = if self.fitness_body_type { 0.6 } else { 0.53 };
        within(round_hundredths((100.0 - body_fat) * share), limits::MUSCLE_PERCENT)
    }

    pub fn bone_mass(&self, muscle: f32, weight: f32) -> f32 {
        let h = self.height - 170.0;
        let factor = if self.sex == 1 { 0.22 * 0.6 } else { 0.34 * 0.45 };
        let bone = ((weight * (muscle / 100.0) * 4.0) / 7.0 * factor) + (h / 100.0);
        within(((bone * 10.0) + 0.5) / 10.0, limits::BONE_KG)
    }

    pub fn lean_body_mass(&self, weight: f32, body_fat: f32) -> f32 {
        within(weight * (100.0 - body_fat) / 100.0, limits::LEAN_MASS_KG)
    }

    pub fn visceral_fat(&self, body_fat: f32, age: i32) -> f32 {
        if self.fitness_body_type {
            let vf = if body_fat > 15.0 {
                (body_fat - 15.0) / 1.1 + 12.0
            } else {
                -(15.0 - body_fat) / 1.4 + 12.0
            };
            return vf.clamp(1.0, 9.0);
        }

        let age = if !(18..=120).contains(&age) { 18 } else { age };
        let offset = match (self.sex == 1, age) {
            (true, a) if a < 40 => 21.0,
            (true, a) if a < 60 => 22.0,
            (true, _) => 24.0,
            (false, a) if a < 40 => 34.0,
            (false, a) if a < 60 => 35.0,
            (false, _) => 36.0,
        };
        let f = body_fat - offset;
        let divisor = if f > 0.0 {
            1.1
        } else if self.sex == 1 {
            1.4
        } else {
            1.8
        };
        ((f / divisor) + 9.5).clamp(1.0, 30.0)
    }
}
