//! Xiaomi Mi body composition formulas (Mi Scale 2, S400).

use super::{limits, water_from_fat, within};

#[derive(Debug, Clone, Copy)]
pub struct MiScaleCalculator {
    /// 1 = male, 0 = female
    sex: i32,
    age: i32,
    /// Height in cm
    height: f32,
}

impl MiScaleCalculator {
    pub fn new(sex: i32, age: i32, height: f32) -> Self {
        Self { sex, age, height }
    }

    fn lbm_coefficient(&self, weight: f32, impedance: f32) -> f32 {
        let mut lbm = (self.height * 9.058 / 100.0) * (self.height / 100.0);
        lbm += weight * 0.32 + 12.226;
        lbm -= impedance * 0.0068;
        lbm -= self.age as f32 * 0.0542;
        lbm
    }

    pub fn bmi(&self, weight: f32) -> f32 {
        within(weight / (((self.height * self.height) / 100.0) / 100.0), limits::BMI)
    }

    pub fn lbm(&self, weight: f32, impedance: f32) -> f32 {
        let lbm = weight
            - ((self.body_fat(weight, impedance) * 0.01) * weight)
            - self.bone_mass(weight, impedance);
        let lbm = if (self.sex == 0 && lbm >= 84.0) || (self.sex == 1 && lbm >= 93.5) {
            120.0
        } else {
            lbm
        };
        within(lbm, limits::LEAN_MASS_KG)
    }

    /// Skeletal muscle in percent of body weight, bounded to 10..=60.
    ///
    /// Uses the Janssen skeletal muscle mass equation when impedance is available
    /// and a fixed share of lean body mass otherwise.
    pub fn muscle(&self, weight: f32, impedance: f32) -> f32 {
        if weight <= 0.0 {
            return 0.0;
        }
        let smm = if impedance > 0.0 {
            let h2_over_r = (self.height * self.height) / impedance;
            0.401 * h2_over_r + 3.825 * self.sex as f32 - 0.071 * self.age as f32 + 5.102
        } else {
            let ratio = if self.sex == 1 { 0.52 } else { 0.46 };
            self.lbm(weight, impedance) * ratio
        };
        within((smm / weight) * 100.0, limits::MUSCLE_PERCENT)
    }

    pub fn water(&self, weight: f32, impedance: f32) -> f32 {
        within(water_from_fat(self.body_fat(weight, impedance)), limits::WATER_PERCENT)
    }

    pub fn bone_mass(&self, weight: f32, impedance: f32) -> f32 {
        let base = if self.sex == 0 { 0.245691014 } else { 0.18016894 };
        let mut bone = (base - (self.lbm_coefficient(weight, impedance) * 0.05158)) * -1.0;
        bone = if bone > 2.2 { bone + 0.1 } else { bone - 0.1 };
        let bone = if (self.sex == 0 && bone > 5.1) || (self.sex == 1 && bone > 5.2) {
            8.0
        } else {
            bone
        };
        within(bone, limits::BONE_KG)
    }

    /// Visceral fat rating. Very light builds come out negative and end up on
    /// the lower bound.
    pub fn visceral_fat(&self, weight: f32) -> f32 {
        let h = self.height;
        let age = self.age as f32;
        let rating = if self.sex == 0 {
            if weight > (13.0 - (h * 0.5)) * -1.0 {
                let subsub = ((h * 1.45) + (h * 0.1158) * h) - 120.0;
                let sub = weight * 500.0 / subsub;
                (sub - 6.0) + (age * 0.07)
            } else {
                let sub = 0.691 + (h * -0.0024) + (h * -0.0024);
                (((h * 0.027) - (sub * weight)) * -1.0) + (age * 0.07) - age
            }
        } else if h < weight * 1.6 {
            let sub = ((h * 0.4) - (h * (h * 0.0826))) * -1.0;
            ((weight * 305.0) / (sub + 48.0)) - 2.9 + (age * 0.15)
        } else {
            let sub = 0.765 + h * -0.0015;
            (((h * 0.143) - (weight * sub)) * -1.0) + (age * 0.15) - 5.0
        };
        within(rating, limits::VISCERAL_FAT)
    }

    pub fn body_fat(&self, weight: f32, impedance: f32) -> f32 {
        let lbm_sub = match (self.sex, self.age) {
            (0, age) if age <= 49 => 9.25,
            (0, _) => 7.25,
            _ => 0.8,
        };
        let lbm_coeff = self.lbm_coefficient(weight, impedance);

        let mut coeff = 1.0;
        if self.sex == 1 && weight < 61.0 {
            coeff = 0.98;
        } else if self.sex == 0 && weight > 60.0 {
            coeff = 0.96;
            if self.height > 160.0 {
                coeff *= 1.03;
            }
        } else if self.sex == 0 && weight < 50.0 {
            coeff = 1.02;
            if self.height > 160.0 {
                coeff *= 1.03;
            }
        }

        let body_fat = (1.0 - (((lbm_coeff - lbm_sub) * coeff) / weight)) * 100.0;
        let body_fat = if body_fat > 63.0 { 75.0 } else { body_fat };
        within(body_fat, limits::FAT_PERCENT)
    }
}
