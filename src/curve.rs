//! Temperature to PWM policy
//!
//! Per-class drive statistics are mapped through step curves, with a
//! single-drive override and a fallback duty when no drive reports a
//! temperature.

use crate::drives::{DriveClass, DriveRecord};
use crate::errors::{BridgeError, Result};
use serde::{Deserialize, Serialize};

/// Upper bound of a duty percentage
pub const MAX_DUTY: i32 = 100;

/// Aggregated temperatures of one drive class.
///
/// `count == 0` means no data and all other fields are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassStats {
    #[serde(rename = "avg")]
    pub average: i32,
    #[serde(rename = "min")]
    pub minimum: i32,
    #[serde(rename = "max")]
    pub maximum: i32,
    pub count: usize,
}

impl ClassStats {
    /// Stats over non-excluded drives of `class` that report a temperature
    pub fn from_drives(drives: &[DriveRecord], class: DriveClass) -> Self {
        let temps: Vec<i32> = drives
            .iter()
            .filter_map(|d| d.contributing_temp(class))
            .collect();
        Self::from_temps(&temps)
    }

    pub fn from_temps(temps: &[i32]) -> Self {
        let (Some(&minimum), Some(&maximum)) = (temps.iter().min(), temps.iter().max()) else {
            return Self::default();
        };
        let sum: i64 = temps.iter().map(|&t| i64::from(t)).sum();
        Self {
            // truncating mean
            average: (sum / temps.len() as i64) as i32,
            minimum,
            maximum,
            count: temps.len(),
        }
    }

    pub fn has_data(&self) -> bool {
        self.count > 0
    }
}

/// Step function from temperature thresholds to duty percentages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurveTable {
    thresholds: Vec<i32>,
    duties: Vec<i32>,
}

impl CurveTable {
    /// Build a validated table for `class`
    pub fn new(class: DriveClass, thresholds: Vec<i32>, duties: Vec<i32>) -> Result<Self> {
        validate_curve(class, &thresholds, &duties)?;
        Ok(Self { thresholds, duties })
    }

    /// Duty for `temp`; see [`map_temperature_to_duty`]
    pub fn duty_for(&self, temp: i32) -> i32 {
        map_temperature_to_duty(temp, &self.thresholds, &self.duties)
    }
}

/// Reject tables the engine cannot use
pub fn validate_curve(class: DriveClass, thresholds: &[i32], duties: &[i32]) -> Result<()> {
    let invalid = |reason: String| BridgeError::InvalidCurve {
        class: class.to_string(),
        reason,
    };

    if thresholds.is_empty() {
        return Err(invalid("no thresholds".to_string()));
    }
    if thresholds.len() != duties.len() {
        return Err(invalid(format!(
            "{} thresholds but {} pwm values",
            thresholds.len(),
            duties.len()
        )));
    }
    if let Some(pair) = thresholds.windows(2).find(|w| w[0] > w[1]) {
        return Err(invalid(format!(
            "thresholds must not decrease: {} > {}",
            pair[0], pair[1]
        )));
    }
    if let Some(duty) = duties.iter().find(|d| !(0..=MAX_DUTY).contains(*d)) {
        return Err(invalid(format!("pwm value {} outside 0-100", duty)));
    }
    Ok(())
}

/// Map a temperature onto a step curve.
///
/// Returns the duty of the highest threshold not above `temp`. When `temp`
/// is below every threshold the first duty is used, so the first entry acts
/// as the idle floor.
pub fn map_temperature_to_duty(temp: i32, thresholds: &[i32], duties: &[i32]) -> i32 {
    let mut step = 0;
    for (i, &threshold) in thresholds.iter().enumerate() {
        if temp >= threshold {
            step = i;
        } else {
            break;
        }
    }
    duties.get(step).copied().unwrap_or(0)
}

/// Single-drive override thresholds and fixed duties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverridePolicy {
    pub hdd_override_c: i32,
    pub ssd_override_c: i32,
    pub override_duty: i32,
    pub fallback_duty: i32,
}

impl Default for OverridePolicy {
    fn default() -> Self {
        Self {
            hdd_override_c: 45,
            ssd_override_c: 60,
            override_duty: 100,
            fallback_duty: 10,
        }
    }
}

/// Output of the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub duty: u8,
    pub override_triggered: bool,
}

/// Combine both classes into one recommended duty
pub fn compute_recommended_duty(
    hdd: &ClassStats,
    ssd: &ClassStats,
    hdd_curve: &CurveTable,
    ssd_curve: &CurveTable,
    policy: &OverridePolicy,
) -> Recommendation {
    // The hottest single drive decides, not the pool average.
    let override_triggered = (hdd.has_data() && hdd.maximum >= policy.hdd_override_c)
        || (ssd.has_data() && ssd.maximum >= policy.ssd_override_c);

    let duty = if override_triggered {
        policy.override_duty
    } else if !hdd.has_data() && !ssd.has_data() {
        policy.fallback_duty
    } else {
        let hdd_duty = if hdd.has_data() { hdd_curve.duty_for(hdd.average) } else { 0 };
        let ssd_duty = if ssd.has_data() { ssd_curve.duty_for(ssd.average) } else { 0 };
        hdd_duty.max(ssd_duty)
    };

    Recommendation {
        duty: clamp_duty(i64::from(duty)),
        override_triggered,
    }
}

/// Clamp any integer into a 0-100 duty
pub fn clamp_duty(value: i64) -> u8 {
    value.clamp(0, i64::from(MAX_DUTY)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdd_curve() -> CurveTable {
        CurveTable::new(DriveClass::Hdd, vec![30, 35, 40], vec![20, 50, 90]).unwrap()
    }

    fn ssd_curve() -> CurveTable {
        CurveTable::new(DriveClass::Ssd, vec![40, 50, 60], vec![20, 60, 100]).unwrap()
    }

    fn policy() -> OverridePolicy {
        OverridePolicy {
            hdd_override_c: 45,
            ssd_override_c: 60,
            override_duty: 100,
            fallback_duty: 10,
        }
    }

    fn recommend(drives: &[DriveRecord]) -> Recommendation {
        compute_recommended_duty(
            &ClassStats::from_drives(drives, DriveClass::Hdd),
            &ClassStats::from_drives(drives, DriveClass::Ssd),
            &hdd_curve(),
            &ssd_curve(),
            &policy(),
        )
    }

    #[test]
    fn step_curve_lookup() {
        let curve = hdd_curve();
        assert_eq!(curve.duty_for(30), 20);
        assert_eq!(curve.duty_for(34), 20);
        assert_eq!(curve.duty_for(35), 50);
        assert_eq!(curve.duty_for(39), 50);
        assert_eq!(curve.duty_for(40), 90);
        assert_eq!(curve.duty_for(85), 90);
    }

    #[test]
    fn below_all_thresholds_uses_first_duty() {
        assert_eq!(hdd_curve().duty_for(-10), 20);
        assert_eq!(map_temperature_to_duty(5, &[25], &[35]), 35);
    }

    #[test]
    fn monotonic_tables_give_monotonic_duties() {
        let curve = CurveTable::new(DriveClass::Hdd, vec![25, 30, 30, 38, 44], vec![0, 15, 30, 60, 100])
            .unwrap();
        let duties: Vec<i32> = (0..=60).map(|t| curve.duty_for(t)).collect();
        assert!(duties.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn malformed_tables_do_not_panic() {
        assert_eq!(map_temperature_to_duty(50, &[30, 40], &[]), 0);
        assert_eq!(map_temperature_to_duty(50, &[30, 40, 45], &[10, 20]), 0);
    }

    #[test]
    fn stats_use_truncating_mean_and_skip_unknowns() {
        let drives = vec![
            DriveRecord::new("sda", DriveClass::Hdd, Some(35)),
            DriveRecord::new("sdb", DriveClass::Hdd, Some(36)),
            DriveRecord::new("sdc", DriveClass::Hdd, None),
            DriveRecord::new("sdd", DriveClass::Hdd, Some(60)).excluded(true),
            DriveRecord::new("nvme0n1", DriveClass::Ssd, Some(44)),
        ];
        let hdd = ClassStats::from_drives(&drives, DriveClass::Hdd);
        assert_eq!(
            hdd,
            ClassStats {
                average: 35,
                minimum: 35,
                maximum: 36,
                count: 2,
            }
        );
        assert_eq!(ClassStats::from_drives(&drives, DriveClass::Ssd).count, 1);
        assert_eq!(ClassStats::from_temps(&[]), ClassStats::default());
    }

    #[test]
    fn single_hot_drive_overrides_cool_average() {
        let drives = vec![
            DriveRecord::new("sda", DriveClass::Hdd, Some(30)),
            DriveRecord::new("sdb", DriveClass::Hdd, Some(30)),
            DriveRecord::new("sdc", DriveClass::Hdd, Some(30)),
            DriveRecord::new("sdd", DriveClass::Hdd, Some(45)),
        ];
        let rec = recommend(&drives);
        assert!(rec.override_triggered);
        assert_eq!(rec.duty, 100);
    }

    #[test]
    fn excluded_drives_never_trigger_override() {
        for class in [DriveClass::Hdd, DriveClass::Ssd] {
            let drives = vec![
                DriveRecord::new("hot", class, Some(99)).excluded(true),
                DriveRecord::new("cool", DriveClass::Hdd, Some(31)),
            ];
            let rec = recommend(&drives);
            assert!(!rec.override_triggered, "{class} exclusion leaked");
            assert_eq!(rec.duty, 20);
        }
    }

    #[test]
    fn hottest_class_wins() {
        let drives = vec![
            DriveRecord::new("sda", DriveClass::Hdd, Some(31)),
            DriveRecord::new("nvme0n1", DriveClass::Ssd, Some(52)),
        ];
        assert_eq!(recommend(&drives).duty, 60);
    }

    #[test]
    fn no_data_uses_fallback() {
        let drives = vec![
            DriveRecord::new("sda", DriveClass::Hdd, None),
            DriveRecord::new("sdb", DriveClass::Ssd, Some(70)).excluded(true),
        ];
        let rec = recommend(&drives);
        assert!(!rec.override_triggered);
        assert_eq!(rec.duty, 10);
        assert_eq!(recommend(&[]).duty, 10);
    }

    #[test]
    fn policy_duties_are_clamped() {
        let wild = OverridePolicy {
            override_duty: 250,
            fallback_duty: -4,
            ..policy()
        };
        let none = ClassStats::default();
        let hot = ClassStats::from_temps(&[50]);
        let fallback = compute_recommended_duty(&none, &none, &hdd_curve(), &ssd_curve(), &wild);
        let forced = compute_recommended_duty(&hot, &none, &hdd_curve(), &ssd_curve(), &wild);
        assert_eq!(fallback.duty, 0);
        assert_eq!(forced.duty, 100);
    }

    #[test]
    fn validation_rejects_bad_tables() {
        assert!(CurveTable::new(DriveClass::Hdd, vec![], vec![]).is_err());
        assert!(CurveTable::new(DriveClass::Hdd, vec![30, 40], vec![20]).is_err());
        assert!(CurveTable::new(DriveClass::Ssd, vec![40, 30], vec![20, 30]).is_err());
        assert!(CurveTable::new(DriveClass::Ssd, vec![40], vec![120]).is_err());
        assert!(CurveTable::new(DriveClass::Ssd, vec![40, 40], vec![20, 30]).is_ok());
    }
}
