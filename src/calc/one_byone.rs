//! 1byone body composition formulas (also used by Eufy C1/P1).

use super::{bounded, limits, water_from_fat, within};

#[derive(Debug, Clone, Copy)]
pub struct OneByoneCalculator {
    /// 1 = male, 0 = female
    sex: i32,
    age: i32,
    /// Height in cm
    height: f32,
    /// 0 = low activity, 1 = medium, 2 = high
    people_type: i32,
}

impl OneByoneCalculator {
    pub fn new(sex: i32, age: i32, height: f32, people_type: i32) -> Self {
        Self {
            sex,
            age,
            height,
            people_type,
        }
    }

    fn people_coeff(&self) -> f32 {
        match self.people_type {
            0 => 1.0,
            1 => 1.0427,
            _ => 1.0958,
        }
    }

    pub fn bmi(&self, weight: f32) -> f32 {
        within(weight / (((self.height * self.height) / 100.0) / 100.0), limits::BMI)
    }

    pub fn lbm(&self, weight: f32, body_fat: f32) -> f32 {
        within(weight - (body_fat / 100.0 * weight), limits::LEAN_MASS_KG)
    }

    pub fn muscle(&self, weight: f32, impedance: f32) -> f32 {
        let h2_over_r = f64::from(self.height * self.height / impedance);
        let smm = (h2_over_r * 0.401) + (f64::from(self.sex) * 3.825)
            - (f64::from(self.age) * 0.071)
            + 5.102;
        within(smm as f32 / weight * 100.0, limits::MUSCLE_PERCENT)
    }

    pub fn water(&self, body_fat: f32) -> f32 {
        within(water_from_fat(body_fat), limits::WATER_PERCENT)
    }

    /// Bone mass in kg, bounded to 0.5..=8.
    pub fn bone_mass(&self, weight: f32, impedance: f32) -> f32 {
        let h = self.height / 100.0;
        let mut bone = (9.058 * h * h + 12.226 + (0.32 * weight)) - (0.0068 * impedance);
        let sex_const = if self.sex == 1 { 3.49305 } else { 4.76325 };
        bone = bone - sex_const - (self.age as f32 * 0.0542) * self.people_coeff();
        bone = if bone <= 2.2 { bone - 0.1 } else { bone + 0.1 };
        bone *= 0.05158;
        bounded(bone, 0.5, 8.0)
    }

    pub fn visceral_fat(&self, weight: f32) -> f32 {
        let h = self.height;
        let age = self.age as f32;
        let visceral_fat = if self.sex == 1 {
            if h < (1.6 * weight) + 63.0 {
                (((weight * 305.0) / (0.0826 * h * h - (0.4 * h) + 48.0)) - 2.9) + (age * 0.15)
            } else {
                ((age * 0.15) + ((weight * (-0.0015 * h + 0.765)) - h * 0.143)) - 5.0
            }
        } else if ((0.5 * h) - 13.0) > weight {
            ((age * 0.07) + ((weight * (-0.0024 * h + 0.691)) - (h * 0.027))) - 10.5
        } else {
            (weight * 500.0) / (((1.45 * h) + 0.1158 * h * h) - 120.0) - 6.0 + (age * 0.07)
        };

        let visceral_fat = if self.people_type == 0 {
            visceral_fat
        } else {
            self.adjust_visceral_fat(visceral_fat)
        };
        within(visceral_fat, limits::VISCERAL_FAT)
    }

    fn adjust_visceral_fat(&self, visceral_fat: f32) -> f32 {
        if visceral_fat < 10.0 {
            visceral_fat - 4.0
        } else if visceral_fat > 20.0 {
            visceral_fat * 0.85
        } else {
            visceral_fat * 0.8
        }
    }

    /// Body fat in percent, bounded to 1..=45.
    pub fn body_fat(&self, weight: f32, impedance: f32) -> f32 {
        let impedance_const = if impedance >= 1200.0 {
            8.16
        } else if impedance >= 200.0 {
            0.0068 * impedance
        } else if impedance >= 50.0 {
            1.36
        } else {
            0.0
        };

        let mut body_var = (9.058 * self.height) / 100.0;
        body_var *= self.height;
        body_var = body_var / 100.0 + 12.226;
        body_var += 0.32 * weight;
        body_var -= impedance_const;

        let age_const = if self.sex == 1 {
            0.8
        } else if self.age > 49 {
            7.25
        } else {
            9.25
        };
        body_var -= age_const;
        body_var -= self.age as f32 * 0.0542;
        body_var *= self.people_coeff();

        if self.sex != 0 {
            if weight < 61.0 {
                body_var *= 0.98;
            }
        } else {
            if weight < 50.0 {
                body_var *= 1.02;
            }
            if weight > 60.0 {
                body_var *= 0.96;
            }
            if self.height > 160.0 {
                body_var *= 1.03;
            }
        }

        bounded(100.0 * (1.0 - body_var / weight), 1.0, 45.0)
    }
}
