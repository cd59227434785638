//! Fuses the three per-class engine severities and the accident detector's
//! status into a single risk code (spec.md §4.7).

use helmet_risk_accident_detection::AccidentStatus;
use helmet_risk_common::Severity;

pub const MATERIAL_OFFSET: u8 = 0;
pub const FALL_ZONE_OFFSET: u8 = 3;
pub const VEHICLE_OFFSET: u8 = 6;
pub const UNKNOWN_ACCIDENT_CODE: u8 = 10;

/// The three per-class engine outputs for one frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineSeverities {
    pub material: Severity,
    pub fall_zone: Severity,
    pub vehicle: Severity,
}

/// `offset + severity` when the engine fired, `0` (SAFE) otherwise.
fn contribution(offset: u8, severity: Severity) -> u8 {
    match severity {
        Severity::Safe => 0,
        Severity::Warning => offset + 1,
        Severity::Danger => offset + 2,
    }
}

/// Fuses engine severities and accident status into the final risk code
/// (spec.md §4.7 steps 3-5). Ties between the dominant engine and an
/// in-progress accident are broken fall-zone > vehicle > material, per the
/// Open Question resolution in DESIGN.md.
#[must_use]
pub fn fuse(severities: EngineSeverities, accident: AccidentStatus) -> u8 {
    let material_c = contribution(MATERIAL_OFFSET, severities.material);
    let fall_zone_c = contribution(FALL_ZONE_OFFSET, severities.fall_zone);
    let vehicle_c = contribution(VEHICLE_OFFSET, severities.vehicle);
    let risk_code = material_c.max(fall_zone_c).max(vehicle_c);

    if accident != AccidentStatus::Incident {
        return risk_code;
    }
    if risk_code == 0 {
        return UNKNOWN_ACCIDENT_CODE;
    }
    if fall_zone_c == risk_code {
        FALL_ZONE_OFFSET + 3
    } else if vehicle_c == risk_code {
        VEHICLE_OFFSET + 3
    } else {
        MATERIAL_OFFSET + 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sev(material: Severity, fall_zone: Severity, vehicle: Severity) -> EngineSeverities {
        EngineSeverities { material, fall_zone, vehicle }
    }

    #[test]
    fn all_safe_no_accident_is_zero() {
        let out = fuse(sev(Severity::Safe, Severity::Safe, Severity::Safe), AccidentStatus::Safe);
        assert_eq!(out, 0);
    }

    #[test]
    fn material_warning_maps_to_one() {
        let out = fuse(sev(Severity::Warning, Severity::Safe, Severity::Safe), AccidentStatus::Safe);
        assert_eq!(out, 1);
    }

    #[test]
    fn material_danger_maps_to_two() {
        let out = fuse(sev(Severity::Danger, Severity::Safe, Severity::Safe), AccidentStatus::Safe);
        assert_eq!(out, 2);
    }

    #[test]
    fn fall_zone_warning_and_danger_map_to_four_and_five() {
        assert_eq!(fuse(sev(Severity::Safe, Severity::Warning, Severity::Safe), AccidentStatus::Safe), 4);
        assert_eq!(fuse(sev(Severity::Safe, Severity::Danger, Severity::Safe), AccidentStatus::Safe), 5);
    }

    #[test]
    fn vehicle_warning_and_danger_map_to_seven_and_eight() {
        assert_eq!(fuse(sev(Severity::Safe, Severity::Safe, Severity::Warning), AccidentStatus::Safe), 7);
        assert_eq!(fuse(sev(Severity::Safe, Severity::Safe, Severity::Danger), AccidentStatus::Safe), 8);
    }

    #[test]
    fn accident_with_no_engine_firing_is_unknown() {
        let out = fuse(sev(Severity::Safe, Severity::Safe, Severity::Safe), AccidentStatus::Incident);
        assert_eq!(out, UNKNOWN_ACCIDENT_CODE);
    }

    #[test]
    fn accident_plus_material_warning_is_three() {
        let out = fuse(sev(Severity::Warning, Severity::Safe, Severity::Safe), AccidentStatus::Incident);
        assert_eq!(out, 3);
    }

    #[test]
    fn accident_plus_fall_zone_is_six() {
        let out = fuse(sev(Severity::Safe, Severity::Warning, Severity::Safe), AccidentStatus::Incident);
        assert_eq!(out, 6);
    }

    #[test]
    fn accident_plus_vehicle_is_nine() {
        let out = fuse(sev(Severity::Safe, Severity::Safe, Severity::Danger), AccidentStatus::Incident);
        assert_eq!(out, 9);
    }

    #[test]
    fn dominant_engine_tie_break_prefers_fall_zone_over_vehicle_over_material() {
        // Danger-level vehicle (8) outranks warning-level fall-zone (4), so
        // vehicle is dominant here regardless of tie-break order.
        let out = fuse(sev(Severity::Warning, Severity::Warning, Severity::Danger), AccidentStatus::Incident);
        assert_eq!(out, VEHICLE_OFFSET + 3);
    }

    #[test]
    fn risk_code_domain_stays_within_zero_to_ten() {
        for material in [Severity::Safe, Severity::Warning, Severity::Danger] {
            for fall_zone in [Severity::Safe, Severity::Warning, Severity::Danger] {
                for vehicle in [Severity::Safe, Severity::Warning, Severity::Danger] {
                    for accident in [AccidentStatus::Safe, AccidentStatus::Incident] {
                        let code = fuse(sev(material, fall_zone, vehicle), accident);
                        assert!(code <= 10);
                    }
                }
            }
        }
    }
}
