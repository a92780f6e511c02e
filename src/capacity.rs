//! Capacity-unit estimator.
//!
//! Not an ETSI table: a pragmatic estimate good enough for UI guidance and
//! for refusing obviously over-allocated ensembles before anything spawns.
//! Base CU ~= bitrate * 0.75 (88 kbps -> 66 CU), scaled by a protection
//! multiplier.

use crate::model::Service;

/// Fixed ceiling of one DAB ensemble.
pub const MAX_ENSEMBLE_CU: u32 = 864;

fn protection_multiplier(level: u8) -> f64 {
    match level {
        1 => 1.45,
        2 => 1.25,
        3 => 1.10,
        4 => 1.00,
        _ => 1.10,
    }
}

pub fn estimate_cu(bitrate_kbps: u32, protection_level: u8) -> u32 {
    let base = (bitrate_kbps as f64 * 0.75).round();
    (base * protection_multiplier(protection_level)).round() as u32
}

/// Aggregate over enabled services only; disabled ones cost nothing.
pub fn sum_cu(services: &[Service]) -> u32 {
    services
        .iter()
        .filter(|s| s.enabled)
        .map(|s| estimate_cu(s.dab.bitrate_kbps, s.dab.protection_level))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewService, Service};

    fn svc(bitrate: u32, protection: u8, enabled: bool) -> Service {
        let mut s = Service::from_spec(&NewService::default(), "s".into(), 9001, 1);
        s.dab.bitrate_kbps = bitrate;
        s.dab.protection_level = protection;
        s.enabled = enabled;
        s
    }

    #[test]
    fn documented_reference_point() {
        // 88 kbps -> base 66 CU, protection 3 -> 66 * 1.10 = 72.6 -> 73.
        assert_eq!(estimate_cu(88, 3), 73);
        assert_eq!(estimate_cu(88, 4), 66);
    }

    #[test]
    fn monotonic_in_bitrate() {
        let mut prev = 0;
        for kbps in (8..=192).step_by(8) {
            let cu = estimate_cu(kbps, 3);
            assert!(cu >= prev, "cu not monotonic at {kbps} kbps");
            prev = cu;
        }
    }

    #[test]
    fn stronger_protection_costs_more() {
        let costs: Vec<u32> = (1..=4).map(|p| estimate_cu(128, p)).collect();
        for pair in costs.windows(2) {
            assert!(pair[0] > pair[1], "protection ordering violated: {costs:?}");
        }
    }

    #[test]
    fn sum_counts_enabled_services_only() {
        let services = vec![svc(88, 3, true), svc(128, 2, true), svc(192, 1, false)];
        assert_eq!(
            sum_cu(&services),
            estimate_cu(88, 3) + estimate_cu(128, 2)
        );
        assert_eq!(sum_cu(&[]), 0);
    }
}
