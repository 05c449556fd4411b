//! Canonical scale measurement and the merge rule for partial readings.

use crate::user::WeightUnit;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A reading from a scale, possibly partial.
///
/// Numeric fields use zero (or any negative value) as "unset". Masses are in
/// the unit given by `weight_unit` (kg when `None`), percentages are 0-100.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScaleMeasurement {
    /// Application user this reading belongs to.
    pub user_id: Option<i32>,
    pub date_time: Option<DateTime<Utc>>,
    pub weight: f32,
    /// Body fat in percent
    pub fat: f32,
    /// Body water in percent
    pub water: f32,
    /// Muscle in percent
    pub muscle: f32,
    /// Visceral fat rating
    pub visceral_fat: f32,
    /// Bone mass
    pub bone: f32,
    /// Lean body mass
    pub lbm: f32,
    /// Basal metabolic rate in kcal
    pub bmr: f32,
    /// Impedance in ohms
    pub impedance: f64,
    /// Height in meters
    pub height: f32,
    pub weight_unit: Option<WeightUnit>,
    /// Heart rate in beats per minute
    pub heart_rate: Option<i32>,
}

/// User index 0xFF, which scales send for readings nobody has claimed.
pub const UNKNOWN_USER_ID: i32 = 255;

/// Copy `other` into `slot` only while `slot` is still unset.
fn fill(slot: &mut f32, other: f32) {
    if other > 0.0 && *slot <= 0.0 {
        *slot = other;
    }
}

impl ScaleMeasurement {
    pub fn with_weight(weight: f32) -> Self {
        Self {
            weight,
            ..Self::default()
        }
    }

    pub fn has_weight(&self) -> bool {
        self.weight > 0.0
    }

    pub fn has_any_body_composition_value(&self) -> bool {
        self.fat > 0.0
            || self.muscle > 0.0
            || self.water > 0.0
            || self.bone > 0.0
            || self.visceral_fat > 0.0
            || self.bmr > 0.0
    }

    /// Merge a partial reading into this one.
    ///
    /// A field is taken from `other` only when `other` carries a positive value and
    /// this reading has none yet; values already set are never replaced. Unit, time
    /// and heart rate fill in when absent, and the user id is adopted only when
    /// `other` names a real user and this reading has none.
    pub fn merge_with(&mut self, other: &ScaleMeasurement) -> &mut Self {
        fill(&mut self.weight, other.weight);
        fill(&mut self.fat, other.fat);
        fill(&mut self.water, other.water);
        fill(&mut self.muscle, other.muscle);
        fill(&mut self.visceral_fat, other.visceral_fat);
        fill(&mut self.bone, other.bone);
        fill(&mut self.lbm, other.lbm);
        fill(&mut self.bmr, other.bmr);
        fill(&mut self.height, other.height);
        if other.impedance > 0.0 && self.impedance <= 0.0 {
            self.impedance = other.impedance;
        }
        if self.weight_unit.is_none() {
            self.weight_unit = other.weight_unit;
        }
        if self.heart_rate.is_none() {
            self.heart_rate = other.heart_rate;
        }
        if self.user_id.is_none() {
            self.user_id = other.user_id.filter(|id| *id >= 0 && *id != UNKNOWN_USER_ID);
        }
        if self.date_time.is_none() {
            self.date_time = other.date_time;
        }
        self
    }

    /// Non-mutating form of [`ScaleMeasurement::merge_with`].
    pub fn merged(mut self, other: &ScaleMeasurement) -> Self {
        self.merge_with(other);
        self
    }
}
