//! The scale-side view of an application user.

use chrono::{Datelike, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    #[default]
    Male,
    Female,
}

impl Gender {
    pub fn is_male(self) -> bool {
        self == Gender::Male
    }

    /// Sex flag used by the body-composition formulas (1 = male, 0 = female).
    pub fn sex_flag(self) -> i32 {
        if self.is_male() { 1 } else { 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    #[default]
    Sedentary,
    Mild,
    Moderate,
    Heavy,
    Extreme,
}

impl ActivityLevel {
    /// Zero-based ordinal (sedentary = 0 ... extreme = 4).
    pub fn ordinal(self) -> i32 {
        match self {
            ActivityLevel::Sedentary => 0,
            ActivityLevel::Mild => 1,
            ActivityLevel::Moderate => 2,
            ActivityLevel::Heavy => 3,
            ActivityLevel::Extreme => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WeightUnit {
    #[default]
    Kg,
    Lb,
    St,
}

const KG_LB: f32 = 2.20462;
const KG_ST: f32 = 0.157473;

impl WeightUnit {
    pub fn to_kilogram(self, value: f32) -> f32 {
        match self {
            WeightUnit::Kg => value,
            WeightUnit::Lb => value / KG_LB,
            WeightUnit::St => value / KG_ST,
        }
    }

    pub fn from_kilogram(self, kg: f32) -> f32 {
        match self {
            WeightUnit::Kg => kg,
            WeightUnit::Lb => kg * KG_LB,
            WeightUnit::St => kg * KG_ST,
        }
    }
}

impl fmt::Display for WeightUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightUnit::Kg => write!(f, "kg"),
            WeightUnit::Lb => write!(f, "lb"),
            WeightUnit::St => write!(f, "st"),
        }
    }
}

/// User context handed to a session. Read-only for the duration of a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleUser {
    pub id: i32,
    pub user_name: String,
    pub birthday: NaiveDate,
    /// Body height in centimeters, `-1.0` when unknown.
    pub body_height: f32,
    pub gender: Gender,
    /// Initial weight in kg.
    pub initial_weight: f32,
    /// Goal weight in kg.
    pub goal_weight: f32,
    pub scale_unit: WeightUnit,
    pub activity_level: ActivityLevel,
}

impl Default for ScaleUser {
    fn default() -> Self {
        Self {
            id: 0,
            user_name: String::new(),
            birthday: Local::now().date_naive(),
            body_height: -1.0,
            gender: Gender::Male,
            initial_weight: 0.0,
            goal_weight: 0.0,
            scale_unit: WeightUnit::Kg,
            activity_level: ActivityLevel::Sedentary,
        }
    }
}

impl ScaleUser {
    /// Age in whole years as of today.
    pub fn age(&self) -> i32 {
        self.age_at(Local::now().date_naive())
    }

    /// Age in whole years as of `today`; one less while this year's birthday is still ahead.
    pub fn age_at(&self, today: NaiveDate) -> i32 {
        let mut years = today.year() - self.birthday.year();
        if (today.month(), today.day()) < (self.birthday.month(), self.birthday.day()) {
            years -= 1;
        }
        years
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_born(y: i32, m: u32, d: u32) -> ScaleUser {
        ScaleUser {
            birthday: NaiveDate::from_ymd_opt(y, m, d).unwrap(),
            ..ScaleUser::default()
        }
    }

    #[test]
    fn test_age_before_and_after_birthday() {
        let user = user_born(1990, 6, 15);
        let today = NaiveDate::from_ymd_opt(2024, 6, 14).unwrap();
        assert_eq!(user.age_at(today), 33);
        let today = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
        assert_eq!(user.age_at(today), 34);
    }

    #[test]
    fn test_defaults() {
        let user = ScaleUser::default();
        assert_eq!(user.body_height, -1.0);
        assert_eq!(user.gender, Gender::Male);
        assert_eq!(user.scale_unit, WeightUnit::Kg);
        assert_eq!(user.activity_level, ActivityLevel::Sedentary);
        assert_eq!(user.age(), 0);
    }

    #[test]
    fn test_sex_flag_and_ordinal() {
        assert_eq!(Gender::Male.sex_flag(), 1);
        assert_eq!(Gender::Female.sex_flag(), 0);
        assert_eq!(ActivityLevel::Extreme.ordinal(), 4);
        assert_eq!(WeightUnit::St.to_string(), "st");
    }

    #[test]
    fn test_unit_conversion() {
        assert_eq!(WeightUnit::Kg.to_kilogram(70.0), 70.0);
        assert!((WeightUnit::Lb.to_kilogram(154.3234) - 70.0).abs() < 1e-3);
        assert!((WeightUnit::St.from_kilogram(70.0) - 11.02311).abs() < 1e-3);
    }
}
