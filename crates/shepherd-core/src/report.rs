//! Notification attribute filtering.
//!
//! Decides whether a value arriving on an observed path is worth reporting,
//! given the path's `pmin/pmax/gt/lt/stp` attributes and the previously
//! reported value.
//!
//! ```text
//!            offer(value)
//!                 │
//!      ┌──────────┼───────────┐
//!   disabled    muted      should_report?
//!      │          │         yes │    no
//!    Drop       Defer    Report │   Drop
//!                 │             ▼
//!          on_min_period   muted until pmin
//!          re-evaluates    pmax forces a report
//! ```
//!
//! Timers are not owned here. The caller arms pmin/pmax timers and calls
//! [`ReportState::on_min_period`] / [`ReportState::on_max_period`] when they
//! fire.

use crate::error::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Attribute names accepted by writeAttrs. `step` is an alias of `stp`.
pub const ALLOWED_ATTRS: [&str; 6] = ["pmin", "pmax", "gt", "lt", "stp", "step"];

// ============================================================================
// Report Attributes
// ============================================================================

/// Notification attributes of one observed path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportAttrs {
    /// Minimum seconds between two reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmin: Option<u64>,
    /// Maximum seconds without a report
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmax: Option<u64>,
    /// Greater-than threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<f64>,
    /// Less-than threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<f64>,
    /// Minimum change since the last report
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stp: Option<f64>,
}

impl ReportAttrs {
    /// Builds attributes from name/value pairs, rejecting unknown names.
    pub fn from_pairs<'a, I>(pairs: I) -> DomainResult<Self>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut attrs = Self::default();
        for (key, value) in pairs {
            match key {
                "pmin" => attrs.pmin = Some(non_negative(key, value)?),
                "pmax" => attrs.pmax = Some(non_negative(key, value)?),
                "gt" => attrs.gt = Some(value),
                "lt" => attrs.lt = Some(value),
                "stp" | "step" => attrs.stp = Some(value),
                other => return Err(DomainError::AttributeNotAllowed(other.to_string())),
            }
        }
        Ok(attrs)
    }

    /// Fills absent periods with process-wide defaults.
    #[must_use]
    pub fn with_defaults(mut self, default_pmin: u64, default_pmax: u64) -> Self {
        self.pmin = self.pmin.or(Some(default_pmin));
        self.pmax = self.pmax.or(Some(default_pmax));
        self
    }

    /// Overlays the attributes set in `other`.
    #[must_use]
    pub fn merged(mut self, other: &ReportAttrs) -> Self {
        self.pmin = other.pmin.or(self.pmin);
        self.pmax = other.pmax.or(self.pmax);
        self.gt = other.gt.or(self.gt);
        self.lt = other.lt.or(self.lt);
        self.stp = other.stp.or(self.stp);
        self
    }

    /// Encodes the attributes as a writeAttrs query (`pmin=10&pmax=60`).
    pub fn to_query(&self) -> String {
        let mut parts = Vec::new();
        if let Some(v) = self.pmin {
            parts.push(format!("pmin={v}"));
        }
        if let Some(v) = self.pmax {
            parts.push(format!("pmax={v}"));
        }
        if let Some(v) = self.gt {
            parts.push(format!("gt={v}"));
        }
        if let Some(v) = self.lt {
            parts.push(format!("lt={v}"));
        }
        if let Some(v) = self.stp {
            parts.push(format!("stp={v}"));
        }
        parts.join("&")
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn non_negative(key: &str, value: f64) -> DomainResult<u64> {
    if value.is_finite() && value >= 0.0 {
        Ok(value as u64)
    } else {
        Err(DomainError::InvalidFieldValue {
            field: key.to_string(),
            value: value.to_string(),
            expected: "a non-negative number of seconds".to_string(),
        })
    }
}

// ============================================================================
// Decision Function
// ============================================================================

/// Pure reporting decision for one arriving value.
///
/// `last` is the previously reported value, if any.
pub fn should_report(attrs: &ReportAttrs, last: Option<&Value>, value: &Value) -> bool {
    match value {
        Value::Object(_) | Value::Array(_) => match last {
            Some(prev @ (Value::Object(_) | Value::Array(_))) => any_leaf_differs(prev, value),
            _ => true,
        },
        Value::Number(number) => {
            let Some(current) = number.as_f64() else {
                return last != Some(value);
            };
            let previous = last.and_then(Value::as_f64);

            if let Some(stp) = attrs.stp {
                return match previous {
                    Some(previous) => (current - previous).abs() > stp,
                    None => true,
                };
            }

            let differs = previous != Some(current);
            match (attrs.gt, attrs.lt) {
                (Some(gt), Some(lt)) if lt > gt => differs && current > gt && current < lt,
                (Some(gt), Some(lt)) => differs && (current > gt || current < lt),
                (Some(gt), None) => differs && current > gt,
                (None, Some(lt)) => differs && current < lt,
                (None, None) => differs,
            }
        }
        _ => last != Some(value),
    }
}

fn any_leaf_differs(prev: &Value, next: &Value) -> bool {
    match next {
        Value::Object(fields) => fields.iter().any(|(key, leaf)| match prev.get(key) {
            Some(old) => any_leaf_differs(old, leaf),
            None => true,
        }),
        Value::Array(items) => items.iter().enumerate().any(|(idx, leaf)| match prev.get(idx) {
            Some(old) => any_leaf_differs(old, leaf),
            None => true,
        }),
        leaf => prev != leaf,
    }
}

// ============================================================================
// Per-Path Report State
// ============================================================================

/// Outcome of offering a value to a [`ReportState`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReportDecision {
    /// Report this value now
    Report(Value),
    /// Muted; the value is kept and re-evaluated when pmin elapses
    Defer,
    /// Not worth reporting
    Drop,
}

/// Mutable filtering state of one observed path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportState {
    attrs: ReportAttrs,
    muted: bool,
    enabled: bool,
    last_reported: Option<Value>,
    latest: Option<Value>,
}

impl ReportState {
    pub fn new(attrs: ReportAttrs) -> Self {
        Self {
            attrs,
            ..Self::default()
        }
    }

    pub fn attrs(&self) -> &ReportAttrs {
        &self.attrs
    }

    pub fn set_attrs(&mut self, attrs: ReportAttrs) {
        self.attrs = attrs;
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn last_value(&self) -> Option<&Value> {
        self.last_reported.as_ref()
    }

    /// Starts filtering with the value of the initial observe response.
    pub fn enable(&mut self, initial: Option<Value>) {
        self.enabled = true;
        self.muted = false;
        self.latest = initial.clone();
        self.last_reported = initial;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.muted = false;
    }

    /// Offers a newly arrived value.
    pub fn offer(&mut self, value: Value) -> ReportDecision {
        self.latest = Some(value.clone());

        if !self.enabled {
            return ReportDecision::Drop;
        }
        if self.muted {
            return ReportDecision::Defer;
        }
        if should_report(&self.attrs, self.last_reported.as_ref(), &value) {
            self.mark_reported(value.clone());
            ReportDecision::Report(value)
        } else {
            ReportDecision::Drop
        }
    }

    /// Called when pmin elapses after a report.
    ///
    /// Unmutes, and returns the deferred value if it now qualifies.
    pub fn on_min_period(&mut self) -> Option<Value> {
        self.muted = false;
        if !self.enabled {
            return None;
        }
        let candidate = self.latest.clone()?;
        if self.last_reported.as_ref() == Some(&candidate) {
            return None;
        }
        if should_report(&self.attrs, self.last_reported.as_ref(), &candidate) {
            self.mark_reported(candidate.clone());
            Some(candidate)
        } else {
            None
        }
    }

    /// Called when pmax elapses without a report; forces the latest value out.
    pub fn on_max_period(&mut self) -> Option<Value> {
        if !self.enabled {
            return None;
        }
        let value = self.latest.clone().or_else(|| self.last_reported.clone())?;
        self.mark_reported(value.clone());
        Some(value)
    }

    fn mark_reported(&mut self, value: Value) {
        self.last_reported = Some(value);
        self.muted = self.attrs.pmin.unwrap_or(0) > 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn band(gt: f64, lt: f64) -> ReportAttrs {
        ReportAttrs {
            gt: Some(gt),
            lt: Some(lt),
            ..ReportAttrs::default()
        }
    }

    #[test]
    fn test_inside_band_reports() {
        let attrs = band(10.0, 20.0);
        assert!(should_report(&attrs, Some(&json!(9)), &json!(12)));
        assert!(!should_report(&attrs, Some(&json!(9)), &json!(25)));
    }

    #[test]
    fn test_outside_band_when_inverted() {
        let attrs = band(20.0, 10.0);
        assert!(should_report(&attrs, Some(&json!(15)), &json!(25)));
        assert!(should_report(&attrs, Some(&json!(15)), &json!(5)));
        assert!(!should_report(&attrs, Some(&json!(15)), &json!(15)));
    }

    #[test]
    fn test_step_overrides_thresholds() {
        let attrs = ReportAttrs {
            stp: Some(5.0),
            gt: Some(1000.0),
            ..ReportAttrs::default()
        };
        assert!(!should_report(&attrs, Some(&json!(100)), &json!(104)));
        assert!(should_report(&attrs, Some(&json!(100)), &json!(106)));
    }

    #[test]
    fn test_single_threshold() {
        let gt_only = ReportAttrs {
            gt: Some(10.0),
            ..ReportAttrs::default()
        };
        assert!(should_report(&gt_only, Some(&json!(5)), &json!(11)));
        assert!(!should_report(&gt_only, Some(&json!(5)), &json!(9)));

        let lt_only = ReportAttrs {
            lt: Some(10.0),
            ..ReportAttrs::default()
        };
        assert!(should_report(&lt_only, Some(&json!(15)), &json!(9)));
        assert!(!should_report(&lt_only, Some(&json!(9)), &json!(9)));
    }

    #[test]
    fn test_non_numeric_reports_on_change() {
        let attrs = ReportAttrs::default();
        assert!(should_report(&attrs, Some(&json!("on")), &json!("off")));
        assert!(!should_report(&attrs, Some(&json!("on")), &json!("on")));
        assert!(should_report(&attrs, None, &json!(true)));
    }

    #[test]
    fn test_composite_reports_on_leaf_change() {
        let attrs = ReportAttrs::default();
        let prev = json!({"0": {"5700": 21.0, "5701": "Cel"}});
        assert!(!should_report(&attrs, Some(&prev), &json!({"0": {"5700": 21.0}})));
        assert!(should_report(&attrs, Some(&prev), &json!({"0": {"5700": 22.0}})));
        assert!(should_report(&attrs, Some(&json!(3)), &json!({"0": {}})));
    }

    #[test]
    fn test_from_pairs_rejects_unknown() {
        let err = ReportAttrs::from_pairs([("pmin", 1.0), ("foo", 2.0)]).unwrap_err();
        assert_eq!(err, DomainError::AttributeNotAllowed("foo".to_string()));
    }

    #[test]
    fn test_step_alias_and_query() {
        let attrs = ReportAttrs::from_pairs([("pmin", 10.0), ("step", 2.0)]).unwrap();
        assert_eq!(attrs.stp, Some(2.0));
        assert_eq!(attrs.to_query(), "pmin=10&stp=2");
    }

    #[test]
    fn test_state_mutes_until_min_period() {
        let mut state = ReportState::new(ReportAttrs {
            pmin: Some(5),
            ..ReportAttrs::default()
        });
        state.enable(Some(json!(1)));

        assert_eq!(state.offer(json!(2)), ReportDecision::Report(json!(2)));
        assert!(state.is_muted());
        assert_eq!(state.offer(json!(3)), ReportDecision::Defer);

        assert_eq!(state.on_min_period(), Some(json!(3)));
        assert_eq!(state.last_value(), Some(&json!(3)));
    }

    #[test]
    fn test_state_max_period_forces_report() {
        let mut state = ReportState::new(ReportAttrs::default().with_defaults(0, 60));
        state.enable(Some(json!(7)));
        assert_eq!(state.offer(json!(7)), ReportDecision::Drop);
        assert_eq!(state.on_max_period(), Some(json!(7)));
    }

    #[test]
    fn test_disabled_state_drops() {
        let mut state = ReportState::new(ReportAttrs::default());
        assert_eq!(state.offer(json!(1)), ReportDecision::Drop);
        assert_eq!(state.on_max_period(), None);
    }
}
