//! Trisa Body Analyze linear regression formulas.

use super::{limits, within};

#[derive(Debug, Clone, Copy)]
pub struct TrisaCalculator {
    is_male: bool,
    age: i32,
    /// Height in cm
    height: f32,
}

impl TrisaCalculator {
    pub fn new(sex: i32, age: i32, height: f32) -> Self {
        Self {
            is_male: sex == 1,
            age,
            height,
        }
    }

    pub fn bmi(&self, weight: f32) -> f32 {
        within(self.raw_bmi(weight), limits::BMI)
    }

    /// The regressions below take the unclamped index.
    fn raw_bmi(&self, weight: f32) -> f32 {
        weight * 1e4 / (self.height * self.height)
    }

    pub fn water(&self, weight: f32, impedance: f32) -> f32 {
        let bmi = self.raw_bmi(weight);
        let age = self.age as f32;
        let water = if self.is_male {
            87.51 + (-1.162 * bmi - 0.00813 * impedance + 0.07594 * age)
        } else {
            77.721 + (-1.148 * bmi - 0.00573 * impedance + 0.06448 * age)
        };
        within(water, limits::WATER_PERCENT)
    }

    pub fn fat(&self, weight: f32, impedance: f32) -> f32 {
        let bmi = self.raw_bmi(weight);
        let age = self.age as f32;
        let fat = if self.is_male {
            bmi * (1.479 + 4.4e-4 * impedance) + 0.1 * age - 21.764
        } else {
            bmi * (1.506 + 3.908e-4 * impedance) + 0.1 * age - 12.834
        };
        within(fat, limits::FAT_PERCENT)
    }

    pub fn muscle(&self, weight: f32, impedance: f32) -> f32 {
        let bmi = self.raw_bmi(weight);
        let age = self.age as f32;
        let muscle = if self.is_male {
            74.627 + (-0.811 * bmi - 0.00565 * impedance - 0.367 * age)
        } else {
            57.0 + (-0.694 * bmi - 0.00344 * impedance - 0.255 * age)
        };
        within(muscle, limits::MUSCLE_PERCENT)
    }

    pub fn bone(&self, weight: f32, impedance: f32) -> f32 {
        let bmi = self.raw_bmi(weight);
        let age = self.age as f32;
        let bone = if self.is_male {
            7.829 + (-0.0855 * bmi - 5.92e-4 * impedance - 0.0389 * age)
        } else {
            7.98 + (-0.0973 * bmi - 4.84e-4 * impedance - 0.036 * age)
        };
        within(bone, limits::BONE_KG)
    }
}
