//! Stream health probing and failover decisions.
//!
//! The watchdog loop itself lives in the runtime core; this module holds the
//! two pieces worth testing in isolation: the reachability probe and the
//! per-service assessment that turns probe results into WARNING/switch
//! decisions while maintaining the runtime timers.

use std::time::Duration;

use reqwest::StatusCode;

use crate::model::{InputConfig, ServiceRuntime, ServiceStatus, WatchdogConfig};

pub const PROBE_TIMEOUT: Duration = Duration::from_millis(2500);

/// Lightweight reachability check: a HEAD request within the timeout.
/// Servers that reject HEAD outright (405) still count as reachable.
pub async fn probe_ok(client: &reqwest::Client, url: Option<&str>) -> bool {
    let Some(url) = url else { return false };
    if url.is_empty() {
        return false;
    }
    match client.head(url).timeout(PROBE_TIMEOUT).send().await {
        Ok(resp) => {
            resp.status() == StatusCode::METHOD_NOT_ALLOWED || resp.status().is_success()
        }
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeOutcome {
    pub main_ok: bool,
    pub backup_ok: bool,
}

/// One watchdog evaluation for one service. Updates the runtime's last-ok
/// stamps, failure/warning timers and status, and returns the URI to switch
/// to when a failover (or return-to-main) should happen now. Process
/// handling is the caller's job.
pub fn assess(
    cfg: &WatchdogConfig,
    input: &InputConfig,
    probes: ProbeOutcome,
    rt: &mut ServiceRuntime,
    now_ms: u64,
) -> Option<String> {
    if probes.main_ok {
        rt.last_ok_main_ms = now_ms;
    }
    if probes.backup_ok {
        rt.last_ok_backup_ms = now_ms;
    }

    let active_is_main = rt.active_uri == input.uri;
    let active_ok = if active_is_main { probes.main_ok } else { probes.backup_ok };

    if active_ok {
        rt.failures_since_ms = 0;
        rt.warning_since_ms = 0;
        if rt.status != ServiceStatus::Running {
            rt.status = ServiceStatus::Running;
        }
        // Healthy on backup: go home once the configured delay has passed
        // since the switch and the primary answers again.
        if !active_is_main && cfg.return_to_main_after_sec > 0 {
            let back_ms = u64::from(cfg.return_to_main_after_sec) * 1000;
            if now_ms.saturating_sub(rt.last_switch_ms) >= back_ms && probes.main_ok {
                return input.uri.clone();
            }
        }
        return None;
    }

    // Active source is failing: start the clocks on first observation.
    if rt.failures_since_ms == 0 {
        rt.failures_since_ms = now_ms;
    }
    if rt.warning_since_ms == 0 {
        rt.warning_since_ms = now_ms;
    }

    // Early operator visibility at roughly half the threshold, bounded to
    // 1-2 s so short thresholds still warn before they fire.
    let warn_sec = u64::from(cfg.silence_threshold_sec / 2).clamp(1, 2);
    if now_ms.saturating_sub(rt.warning_since_ms) >= warn_sec * 1000
        && rt.status != ServiceStatus::Warning
    {
        rt.status = ServiceStatus::Warning;
    }

    let threshold_ms = u64::from(cfg.silence_threshold_sec) * 1000;
    if now_ms.saturating_sub(rt.failures_since_ms) >= threshold_ms
        && cfg.switch_to_backup_on_silence
        && input.backup_uri.is_some()
    {
        let (target, target_ok) = if active_is_main {
            (input.backup_uri.clone(), probes.backup_ok)
        } else {
            (input.uri.clone(), probes.main_ok)
        };
        if target_ok {
            // No healthy target -> no switch; the timers keep accumulating
            // and the next tick tries again.
            return target;
        }
    }

    None
}
