//! Formulas for the newer 1byone firmware. Close to [`super::OneByoneCalculator`]
//! but with integer impedance and bounded outputs.

use super::{bounded, limits, within};

#[derive(Debug, Clone, Copy)]
pub struct OneByoneNewCalculator {
    sex: i32,
    age: i32,
    height: f32,
    #[allow(dead_code)]
    people_type: i32,
}

impl OneByoneNewCalculator {
    pub fn new(sex: i32, age: i32, height: f32, people_type: i32) -> Self {
        Self {
            sex,
            age,
            height,
            people_type,
        }
    }

    pub fn bmi(&self, weight: f32) -> f32 {
        bounded(weight / (((self.height * self.height) / 100.0) / 100.0), 10.0, 90.0)
    }

    pub fn lbm(&self, weight: f32, impedance: i32) -> f32 {
        let mut lbm = self.height / 100.0 * self.height / 100.0 * 9.058;
        lbm += 12.226;
        lbm += (f64::from(weight) * 0.32) as f32;
        lbm -= (f64::from(impedance) * 0.0068) as f32;
        lbm -= (f64::from(self.age) * 0.0542) as f32;
        within(lbm, limits::LEAN_MASS_KG)
    }

    pub fn bmmr_coeff(&self) -> f32 {
        let coeff = match (self.sex == 1, self.age) {
            (true, age) if age < 13 => 36,
            (true, age) if age < 16 => 30,
            (true, age) if age < 18 => 26,
            (true, age) if age < 30 => 23,
            (true, age) if age >= 50 => 20,
            (true, _) => 21,
            (false, age) if age < 13 => 34,
            (false, age) if age < 16 => 29,
            (false, age) if age < 18 => 24,
            (false, age) if age < 30 => 22,
            (false, age) if age >= 50 => 19,
            (false, _) => 20,
        };
        coeff as f32
    }

    /// Basal metabolic rate in kcal, bounded to 500..=1000.
    pub fn bmmr(&self, weight: f32) -> f32 {
        let bmmr = if self.sex == 1 {
            (weight * 14.916 + 877.8) - self.height * 0.726 - (f64::from(self.age) * 8.976) as f32
        } else {
            (weight * 10.2036 + 864.6) - self.height * 0.39336 - (f64::from(self.age) * 6.204) as f32
        };
        bounded(bmmr, 500.0, 1000.0)
    }

    pub fn body_fat_percentage(&self, weight: f32, impedance: i32) -> f32 {
        let mut body_fat = self.lbm(weight, impedance);
        body_fat -= match (self.sex, self.age) {
            (0, age) if age < 50 => 9.25,
            (0, _) => 7.25,
            _ => 0.8,
        };

        if self.sex == 0 {
            if weight < 50.0 {
                body_fat *= 1.02;
            } else if weight > 60.0 {
                body_fat *= 0.96;
            }
            if self.height > 160.0 {
                body_fat *= 1.03;
            }
        } else if weight < 61.0 {
            body_fat *= 0.98;
        }

        within(100.0 * (1.0 - body_fat / weight), limits::FAT_PERCENT)
    }

    pub fn bone_mass(&self, weight: f32, impedance: i32) -> f32 {
        let base = if self.sex == 1 { 0.18016894 } else { 0.245691014 };
        let bone = self.lbm(weight, impedance) * 0.05158 - base;
        let bone = if bone <= 2.2 { bone - 0.1 } else { bone + 0.1 };
        bounded(bone, 0.5, 8.0)
    }

    /// Muscle mass in kg, bounded to 10..=120.
    pub fn muscle_mass(&self, weight: f32, impedance: i32) -> f32 {
        let mut muscle = weight - self.body_fat_percentage(weight, impedance) * 0.01 * weight;
        muscle -= self.bone_mass(weight, impedance);
        bounded(muscle, 10.0, 120.0)
    }

    pub fn skeleton_muscle_percentage(&self, weight: f32, impedance: i32) -> f32 {
        let mut smm = self.water_percentage(weight, impedance);
        smm *= weight;
        smm *= 0.8422 * 0.01;
        smm -= 2.9903;
        smm /= weight;
        within(smm * 100.0, limits::MUSCLE_PERCENT)
    }

    pub fn visceral_fat(&self, weight: f32) -> f32 {
        let h = self.height;
        let age = self.age as f32;
        let visceral_fat = if self.sex == 1 {
            if f64::from(h) < f64::from(weight) * 1.6 + 63.0 {
                age * 0.15 + ((weight * 305.0) / ((h * 0.0826 * h - h * 0.4) + 48.0) - 2.9)
            } else {
                age * 0.15 + (weight * (h * -0.0015 + 0.765) - h * 0.143) - 5.0
            }
        } else if f64::from(weight) <= f64::from(h) * 0.5 - 13.0 {
            age * 0.07 + (weight * (h * -0.0024 + 0.691) - h * 0.027) - 10.5
        } else {
            age * 0.07 + ((weight * 500.0) / ((h * 1.45 + h * 0.1158 * h) - 120.0) - 6.0)
        };
        bounded(visceral_fat, 1.0, 50.0)
    }

    /// Body water in percent, bounded to 35..=75.
    pub fn water_percentage(&self, weight: f32, impedance: i32) -> f32 {
        let mut water = (100.0 - self.body_fat_percentage(weight, impedance)) * 0.7;
        water *= if water > 50.0 { 0.98 } else { 1.02 };
        bounded(water, 35.0, 75.0)
    }

    pub fn protein_percentage(&self, weight: f32, impedance: i32) -> f32 {
        let protein = ((100.0 - self.body_fat_percentage(weight, impedance))
            - self.water_percentage(weight, impedance) * 1.08)
            - (self.bone_mass(weight, impedance) / weight) * 100.0;
        within(protein, limits::PROTEIN_PERCENT)
    }
}
