//! Soehnle Shape body composition formulas, driven by two impedance frequencies.
//!
//! The `*_formula` functions are the vendor regressions as is. The public
//! outputs clamp them into [`limits`](super::limits).

use super::{limits, within};

#[derive(Debug, Clone, Copy)]
pub struct SoehnleCalculator {
    is_male: bool,
    age: i32,
    height: f32,
    /// Activity level 1..=5
    activity_level: i32,
}

impl SoehnleCalculator {
    pub fn new(is_male: bool, age: i32, height: f32, activity_level: i32) -> Self {
        Self {
            is_male,
            age,
            height,
            activity_level,
        }
    }

    fn by_sex(&self, male: f32, female: f32) -> f32 {
        if self.is_male { male } else { female }
    }

    pub fn bmi(&self, weight: f32) -> f32 {
        within(10000.0 * weight / (self.height * self.height), limits::BMI)
    }

    /// Body fat in percent from the 50 kHz impedance.
    pub fn fat(&self, weight: f32, imp50: f32) -> f32 {
        within(self.fat_formula(weight, imp50), limits::FAT_PERCENT)
    }

    pub fn water(&self, weight: f32, imp50: f32) -> f32 {
        within(self.water_formula(weight, imp50), limits::WATER_PERCENT)
    }

    /// Muscle in percent. `imp5` is the 5 kHz impedance, normally above `imp50`.
    pub fn muscle(&self, weight: f32, imp50: f32, imp5: f32) -> f32 {
        within(self.muscle_formula(weight, imp50, imp5), limits::MUSCLE_PERCENT)
    }

    fn fat_formula(&self, weight: f32, imp50: f32) -> f32 {
        let activity_corr = match self.activity_level {
            4 => self.by_sex(2.5, 2.3),
            5 => self.by_sex(4.3, 4.1),
            _ => 0.0,
        };
        let sex_corr = self.by_sex(0.250, 0.214);
        let activity_sex_div = self.by_sex(65.5, 55.1);

        1.847 * weight * 10000.0 / (self.height * self.height)
            + sex_corr * self.age as f32
            + 0.062 * imp50
            - (activity_sex_div - activity_corr)
    }

    fn water_formula(&self, weight: f32, imp50: f32) -> f32 {
        let activity_corr = match self.activity_level {
            1..=3 => self.by_sex(2.83, 0.0),
            4 => self.by_sex(3.93, 0.4),
            5 => self.by_sex(5.33, 1.4),
            _ => 0.0,
        };
        (0.3674 * self.height * self.height / imp50 + 0.17530 * weight - 0.11 * self.age as f32
            + (6.53 + activity_corr))
            / weight
            * 100.0
    }

    fn muscle_formula(&self, weight: f32, imp50: f32, imp5: f32) -> f32 {
        let activity_corr = match self.activity_level {
            1..=3 => self.by_sex(3.6224, 0.0),
            4 => self.by_sex(4.3904, 0.0),
            5 => self.by_sex(5.4144, 1.664),
            _ => 0.0,
        };
        ((0.47027 / imp50 - 0.24196 / imp5) * self.height * self.height + 0.13796 * weight
            - 0.1152 * self.age as f32
            + (5.12 + activity_corr))
            / weight
            * 100.0
    }
}
