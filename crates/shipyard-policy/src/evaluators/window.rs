use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use rrule::RRuleSet;
use shipyard_core::{RuleType, SharedClock};

use crate::error::{PolicyError, PolicyResult};
use crate::evaluator::{Evaluator, RuleEvaluation, complexity_of};
use crate::scope::{EvaluatorScope, ScopeFields};

/// Anchor used when a rule carries neither a DTSTART nor a dtstart field.
fn default_anchor() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2020, 1, 1)
        .unwrap_or_default()
        .and_time(NaiveTime::MIN)
}

/// Distance between two anchors that yield the same occurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Seconds(i64),
    Months(u32),
}

/// The recurrence period of `rule`, or `None` when moving the anchor
/// would change its occurrences (COUNT, unknown FREQ).
fn anchor_step(rule: &str) -> Option<Step> {
    let mut freq = None;
    let mut interval: i64 = 1;
    for part in rule.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = part.split_once('=')?;
        match key.trim().to_ascii_uppercase().as_str() {
            "FREQ" => freq = Some(value.trim().to_ascii_uppercase()),
            "INTERVAL" => interval = value.trim().parse().ok().filter(|n| *n > 0)?,
            "COUNT" => return None,
            _ => {}
        }
    }
    let unit = match freq?.as_str() {
        "SECONDLY" => 1,
        "MINUTELY" => 60,
        "HOURLY" => 3_600,
        "DAILY" => 86_400,
        "WEEKLY" => 604_800,
        "MONTHLY" => return u32::try_from(interval).ok().map(Step::Months),
        "YEARLY" => {
            return u32::try_from(interval)
                .ok()
                .and_then(|n| n.checked_mul(12))
                .map(Step::Months);
        }
        _ => return None,
    };
    interval.checked_mul(unit).map(Step::Seconds)
}

/// Moves `anchor` forward by whole steps to at least one step before
/// `target`. Anchors on days a shorter month lacks never move by months.
fn advance(anchor: NaiveDateTime, step: Step, target: NaiveDateTime) -> NaiveDateTime {
    match step {
        Step::Seconds(step) => {
            let periods = (target - anchor).num_seconds() / step - 1;
            if periods <= 0 {
                return anchor;
            }
            periods
                .checked_mul(step)
                .and_then(Duration::try_seconds)
                .and_then(|d| anchor.checked_add_signed(d))
                .unwrap_or(anchor)
        }
        Step::Months(step) => {
            if anchor.day() > 28 {
                return anchor;
            }
            let months = i64::from(target.year() - anchor.year()) * 12
                + i64::from(target.month())
                - i64::from(anchor.month());
            let periods = months / i64::from(step) - 1;
            if periods <= 0 {
                return anchor;
            }
            u32::try_from(periods)
                .ok()
                .and_then(|p| p.checked_mul(step))
                .and_then(|m| anchor.checked_add_months(Months::new(m)))
                .unwrap_or(anchor)
        }
    }
}

/// An RRULE whose DTSTART is supplied separately and may be moved
/// forward along the recurrence.
#[derive(Debug)]
struct AnchoredRule {
    rule: String,
    tz: Tz,
    /// Wall-clock time in `tz`.
    anchor: NaiveDateTime,
    step: Option<Step>,
}

impl AnchoredRule {
    fn rule_set(&self, anchor: NaiveDateTime) -> Result<RRuleSet, String> {
        let stamp = anchor.format("%Y%m%dT%H%M%S");
        let start = if self.tz == chrono_tz::UTC {
            format!("DTSTART:{stamp}Z")
        } else {
            format!("DTSTART;TZID={}:{stamp}", self.tz.name())
        };
        format!("{start}\nRRULE:{}", self.rule)
            .parse::<RRuleSet>()
            .map_err(|e| e.to_string())
    }

    /// The rule set re-anchored close to `from`, so iteration starts
    /// near the instants of interest.
    fn rule_set_near(&self, from: DateTime<Utc>) -> Result<RRuleSet, String> {
        let anchor = match self.step {
            Some(step) => advance(self.anchor, step, from.with_timezone(&self.tz).naive_local()),
            None => self.anchor,
        };
        self.rule_set(anchor)
    }
}

enum Schedule {
    /// The rule text carries its own DTSTART.
    Fixed(RRuleSet),
    Anchored(AnchoredRule),
}

/// Parses the recurrence, anchoring a plain RRULE in the rule's timezone.
fn build_schedule(
    rrule: &str,
    dtstart: Option<DateTime<Utc>>,
    timezone: &str,
) -> Result<Schedule, String> {
    let body = rrule.trim();
    if body.contains("DTSTART") {
        return body
            .parse::<RRuleSet>()
            .map(Schedule::Fixed)
            .map_err(|e| e.to_string());
    }
    let rule = body.strip_prefix("RRULE:").unwrap_or(body).to_string();
    let tz: Tz = timezone
        .parse()
        .map_err(|_| format!("unknown timezone: {timezone}"))?;
    let anchor = match dtstart {
        Some(at) => at.with_timezone(&tz).naive_local(),
        None => default_anchor(),
    };
    let anchored = AnchoredRule {
        step: anchor_step(&rule),
        rule,
        tz,
        anchor,
    };
    anchored.rule_set(anchor)?;
    Ok(Schedule::Anchored(anchored))
}

/// Allow-window or blackout-window rule over an RRULE recurrence.
pub struct DeploymentWindowEvaluator {
    rule_id: String,
    schedule: Result<Schedule, String>,
    duration: Duration,
    allow_window: bool,
    clock: SharedClock,
}

impl DeploymentWindowEvaluator {
    pub fn new(
        rule_id: impl Into<String>,
        rrule: &str,
        dtstart: Option<DateTime<Utc>>,
        duration_minutes: u32,
        timezone: &str,
        allow_window: bool,
        clock: SharedClock,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            schedule: build_schedule(rrule, dtstart, timezone),
            duration: Duration::minutes(i64::from(duration_minutes)),
            allow_window,
            clock,
        }
    }

    /// A rule set whose iteration starts shortly before the window that
    /// could contain `now`.
    fn rule_set(&self, now: DateTime<Utc>) -> PolicyResult<RRuleSet> {
        let built = match &self.schedule {
            Ok(Schedule::Fixed(set)) => Ok(set.clone()),
            Ok(Schedule::Anchored(rule)) => {
                rule.rule_set_near(now - self.duration - Duration::seconds(1))
            }
            Err(reason) => Err(reason.clone()),
        };
        built.map_err(|reason| PolicyError::InvalidRule {
            rule_id: self.rule_id.clone(),
            reason,
        })
    }

    /// The window instance containing `now`, as `(start, end)`.
    fn current_window(
        &self,
        set: &RRuleSet,
        now: DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let from = now - self.duration - Duration::seconds(1);
        let to = now + Duration::seconds(1);
        set.clone()
            .after(from.with_timezone(&rrule::Tz::UTC))
            .before(to.with_timezone(&rrule::Tz::UTC))
            .all(u16::MAX)
            .dates
            .into_iter()
            .map(|d| d.with_timezone(&Utc))
            .map(|start| (start, start + self.duration))
            .filter(|(start, end)| *start <= now && now < *end)
            .max_by_key(|(_, end)| *end)
    }

    fn next_start(&self, set: &RRuleSet, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        set.clone()
            .after(now.with_timezone(&rrule::Tz::UTC))
            .all(2)
            .dates
            .into_iter()
            .map(|d| d.with_timezone(&Utc))
            .find(|start| *start > now)
    }
}

impl Evaluator for DeploymentWindowEvaluator {
    fn rule_type(&self) -> RuleType {
        RuleType::DeploymentWindow
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u8 {
        complexity_of(RuleType::DeploymentWindow)
    }

    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::NONE
    }

    fn evaluate(&self, _scope: &EvaluatorScope) -> PolicyResult<RuleEvaluation> {
        let now = self.clock.now();
        let set = self.rule_set(now)?;
        let window = self.current_window(&set, now);

        let evaluation = match (self.allow_window, window) {
            (true, Some((start, end))) => RuleEvaluation::allow("inside deployment window")
                .detail("windowStart", start.to_rfc3339())
                .detail("windowEnd", end.to_rfc3339()),
            (true, None) => {
                let denial = RuleEvaluation::deny("outside deployment window");
                match self.next_start(&set, now) {
                    Some(next) => denial
                        .retry_at(next)
                        .detail("nextWindowStart", next.to_rfc3339()),
                    None => denial,
                }
            }
            (false, Some((start, end))) => RuleEvaluation::deny("inside blackout window")
                .retry_at(end)
                .detail("windowStart", start.to_rfc3339())
                .detail("windowEnd", end.to_rfc3339()),
            (false, None) => RuleEvaluation::allow("outside blackout window"),
        };
        Ok(evaluation.detail("allowWindow", self.allow_window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_core::ManualClock;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn naive(rfc3339: &str) -> NaiveDateTime {
        at(rfc3339).naive_utc()
    }

    fn anchored(rrule: &str, timezone: &str) -> AnchoredRule {
        match build_schedule(rrule, None, timezone).unwrap() {
            Schedule::Anchored(rule) => rule,
            Schedule::Fixed(_) => panic!("expected an anchored rule"),
        }
    }

    #[test]
    fn anchors_plain_rrule_at_default_dtstart() {
        let rule = anchored("FREQ=DAILY;BYHOUR=9", "UTC");
        let dates = rule.rule_set(rule.anchor).unwrap().all(1).dates;
        assert_eq!(dates[0].with_timezone(&Utc), at("2020-01-01T09:00:00Z"));
    }

    #[test]
    fn steps_follow_frequency_and_interval() {
        assert_eq!(anchor_step("FREQ=MINUTELY;INTERVAL=10"), Some(Step::Seconds(600)));
        assert_eq!(anchor_step("FREQ=WEEKLY;BYDAY=MO"), Some(Step::Seconds(604_800)));
        assert_eq!(anchor_step("FREQ=YEARLY;INTERVAL=2"), Some(Step::Months(24)));
        assert_eq!(anchor_step("FREQ=DAILY;COUNT=5"), None);
        assert_eq!(anchor_step("INTERVAL=3"), None);
    }

    #[test]
    fn advance_stays_on_the_grid() {
        let anchor = default_anchor();
        let moved = advance(anchor, Step::Seconds(600), naive("2090-06-01T12:03:00Z"));
        assert_eq!(moved, naive("2090-06-01T11:50:00Z"));

        let quarterly = advance(anchor, Step::Months(3), naive("2031-05-10T00:00:00Z"));
        assert_eq!(quarterly, naive("2031-01-01T00:00:00Z"));

        let late = naive("2020-01-31T00:00:00Z");
        assert_eq!(advance(late, Step::Months(1), naive("2030-01-01T00:00:00Z")), late);
        assert_eq!(advance(anchor, Step::Seconds(600), anchor), anchor);
    }

    #[test]
    fn rejects_garbage_rrule() {
        let clock = ManualClock::shared(at("2024-03-04T10:00:00Z"));
        let eval = DeploymentWindowEvaluator::new("w", "FREQ=NOPE", None, 60, "UTC", true, clock);
        assert!(eval.rule_set(at("2024-03-04T10:00:00Z")).is_err());
    }
}
