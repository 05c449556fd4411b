//! Body-composition calculators.
//!
//! Each vendor family ships its own empirical formulas. The calculators here are
//! pure: they are parameterized by the person (sex, age, height and sometimes an
//! activity class) at construction and take weight and impedance per call.
//! Constants and branch thresholds are reproduced exactly, including the bounds
//! each family applies to its outputs. On top of those, every public output is
//! clamped into the plausible range of its quantity (see [`limits`]), so callers
//! never see a negative visceral fat rating or a water share above 75 %.

pub mod mi_scale;
pub mod one_byone;
pub mod one_byone_new;
pub mod soehnle;
pub mod trisa;
pub mod yunmai;

pub use mi_scale::MiScaleCalculator;
pub use one_byone::OneByoneCalculator;
pub use one_byone_new::OneByoneNewCalculator;
pub use soehnle::SoehnleCalculator;
pub use trisa::TrisaCalculator;
pub use yunmai::YunmaiCalculator;

/// Plausible `(lower, upper)` range of each reported quantity.
pub mod limits {
    pub const BMI: (f32, f32) = (10.0, 90.0);
    /// Zero is allowed: it is what "no estimate" looks like in a measurement.
    pub const FAT_PERCENT: (f32, f32) = (0.0, 75.0);
    pub const WATER_PERCENT: (f32, f32) = (35.0, 75.0);
    pub const MUSCLE_PERCENT: (f32, f32) = (10.0, 60.0);
    pub const PROTEIN_PERCENT: (f32, f32) = (0.0, 50.0);
    pub const BONE_KG: (f32, f32) = (0.5, 8.0);
    pub const LEAN_MASS_KG: (f32, f32) = (10.0, 150.0);
    pub const VISCERAL_FAT: (f32, f32) = (1.0, 50.0);
}

/// Clamp `value` into one of the [`limits`].
pub(crate) fn within(value: f32, (lower, upper): (f32, f32)) -> f32 {
    bounded(value, lower, upper)
}

/// Clamp `value` into `[lower, upper]`. NaN, from a zero impedance divided
/// into itself, lands on the lower bound.
pub(crate) fn bounded(value: f32, lower: f32, upper: f32) -> f32 {
    if value.is_nan() || value < lower {
        lower
    } else if value > upper {
        upper
    } else {
        value
    }
}

/// Body water from body fat, shared by the Xiaomi and 1byone families.
pub(crate) fn water_from_fat(body_fat: f32) -> f32 {
    let water = (100.0 - body_fat) * 0.7;
    let coeff = if water < 50.0 { 1.02 } else { 0.98 };
    coeff * water
}
