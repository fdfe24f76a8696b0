//! Pushes the recommended duty to the controller behind two gates
//!
//! A duty is only sent when it differs enough from the last applied one
//! (hysteresis) and enough time has passed since that apply (interval).

use crate::curve::clamp_duty;
use crate::serial::SerialExchangeResult;
use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Full scale of the comparison unit
const INTERNAL_SCALE: i32 = 255;

/// Convert a duty percentage into the comparison unit
pub fn to_internal(duty_percent: u8) -> i32 {
    i32::from(duty_percent) * INTERNAL_SCALE / 100
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoApplyState {
    pub enabled: bool,
    pub last_duty: Option<u8>,
    pub last_applied_at: Option<DateTime<Utc>>,
    pub min_interval_s: u64,
    /// Minimum change, in 0..255 comparison units
    pub hysteresis_duty: u32,
}

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoApplyOutcome {
    pub applied: bool,
    pub duty: u8,
    /// Why nothing was sent, when nothing was
    pub reason: Option<String>,
    pub state: AutoApplyState,
}

#[derive(Debug, Default)]
pub struct AutoApplyController {
    state: Mutex<AutoApplyState>,
}

impl AutoApplyController {
    pub fn new(enabled: bool, min_interval_s: u64, hysteresis_duty: u32) -> Self {
        Self {
            state: Mutex::new(AutoApplyState {
                enabled,
                min_interval_s,
                hysteresis_duty,
                ..AutoApplyState::default()
            }),
        }
    }

    /// Update the gates, keeping the last applied duty and time
    pub fn configure(&self, enabled: bool, min_interval_s: u64, hysteresis_duty: u32) {
        let mut state = self.state.lock();
        state.enabled = enabled;
        state.min_interval_s = min_interval_s;
        state.hysteresis_duty = hysteresis_duty;
    }

    pub fn state(&self) -> AutoApplyState {
        self.state.lock().clone()
    }

    /// Decide whether to send `recommended` and send it through `send`.
    ///
    /// `send` receives the clamped percentage. The applied duty and time only
    /// move when the send succeeds.
    pub fn tick<F>(&self, recommended: i64, connected: bool, now: DateTime<Utc>, send: F) -> AutoApplyOutcome
    where
        F: FnOnce(u8) -> SerialExchangeResult,
    {
        let duty = clamp_duty(recommended);
        let snapshot = self.state();

        if !snapshot.enabled {
            return Self::paused(duty, "auto-apply disabled", snapshot);
        }
        if !connected {
            return Self::paused(duty, "controller not connected", snapshot);
        }
        if let Some(last) = snapshot.last_duty {
            let delta = (to_internal(duty) - to_internal(last)).unsigned_abs();
            if delta < snapshot.hysteresis_duty {
                debug!("auto-apply: {}% within hysteresis of {}%", duty, last);
                return Self::paused(duty, "within hysteresis", snapshot);
            }
        }
        if let Some(at) = snapshot.last_applied_at {
            let min_interval_ms = i64::try_from(snapshot.min_interval_s)
                .unwrap_or(i64::MAX)
                .saturating_mul(1000);
            if now.signed_duration_since(at).num_milliseconds() < min_interval_ms {
                debug!("auto-apply: {}% held back, last apply at {}", duty, at);
                return Self::paused(duty, "min interval not elapsed", snapshot);
            }
        }

        let res = send(duty);
        if !res.ok {
            let reason = res.error_message();
            debug!("auto-apply: sending {}% failed: {}", duty, reason);
            return Self::paused(duty, reason, self.state());
        }

        let state = {
            let mut state = self.state.lock();
            state.last_duty = Some(duty);
            state.last_applied_at = Some(now);
            state.clone()
        };
        info!(
            "auto-apply: set duty {}% on {}",
            duty,
            res.port.as_deref().unwrap_or("unknown port")
        );
        AutoApplyOutcome {
            applied: true,
            duty,
            reason: None,
            state,
        }
    }

    fn paused(duty: u8, reason: impl Into<String>, state: AutoApplyState) -> AutoApplyOutcome {
        AutoApplyOutcome {
            applied: false,
            duty,
            reason: Some(reason.into()),
            state,
        }
    }
}
