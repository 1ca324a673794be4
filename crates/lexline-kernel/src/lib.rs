//! Pure domain logic for the consultation marketplace: lifecycle
//! transitions, quota arithmetic, access policy, and metrics math.
//! No I/O here; the server applies the transitions this module produces
//! as conditional updates against its store.

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
};
use lexline_contracts::{
    Actor, ConsultationMetrics, ConsultationRecord, ConsultationStatus, MetricsSnapshot, PlanTier,
    QuotaSnapshot, QuotaView, Role, TrendPoint, UserMetrics, UserRecord, UserStatus,
};
use std::collections::BTreeMap;
use thiserror::Error;

/// Title applied when a customer submits a consultation without one.
pub const DEFAULT_TITLE: &str = "Consultoria Jurídica";

/// Unlimited-quota sentinel surfaced in raw snapshots.
pub const UNLIMITED: i64 = -1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("consultation must be {expected} (currently {actual})")]
    WrongStatus {
        expected: ConsultationStatus,
        actual: ConsultationStatus,
    },
    #[error("consultation is not active (currently {actual})")]
    NotActive { actual: ConsultationStatus },
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("message text cannot be empty")]
    EmptyMessage,
}

/// Field changes a transition wants to apply. `None` leaves a column
/// untouched; `status` is always written.
#[derive(Debug, Clone, Default)]
pub struct ConsultationPatch {
    pub lawyer_id: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub session_duration_minutes: Option<i64>,
}

/// A guarded state change: the store must apply `patch` only if the
/// record still has status `expect` (compare-and-swap), so racing
/// commands produce exactly one winner.
#[derive(Debug, Clone)]
pub struct Transition {
    pub expect: ConsultationStatus,
    pub to: ConsultationStatus,
    pub patch: ConsultationPatch,
}

/// Lawyer takes a REQUESTED consultation. The sync API path moves it to
/// ACCEPTED; the live path starts the session immediately (IN_PROGRESS
/// with start/activity timestamps).
pub fn accept_transition(
    actor: &Actor,
    consultation: &ConsultationRecord,
    live: bool,
    now: DateTime<Utc>,
) -> Result<Transition, TransitionError> {
    if actor.role != Role::Lawyer {
        return Err(TransitionError::Forbidden(
            "only lawyers can accept consultations",
        ));
    }
    require_status(consultation, ConsultationStatus::Requested)?;

    let (to, patch) = if live {
        (
            ConsultationStatus::InProgress,
            ConsultationPatch {
                lawyer_id: Some(actor.id.clone()),
                start_at: Some(now),
                last_activity_at: Some(now),
                ..ConsultationPatch::default()
            },
        )
    } else {
        (
            ConsultationStatus::Accepted,
            ConsultationPatch {
                lawyer_id: Some(actor.id.clone()),
                ..ConsultationPatch::default()
            },
        )
    };
    Ok(Transition {
        expect: ConsultationStatus::Requested,
        to,
        patch,
    })
}

pub fn reject_transition(
    actor: &Actor,
    consultation: &ConsultationRecord,
    reason: Option<String>,
) -> Result<Transition, TransitionError> {
    if actor.role != Role::Lawyer {
        return Err(TransitionError::Forbidden(
            "only lawyers can reject consultations",
        ));
    }
    require_status(consultation, ConsultationStatus::Requested)?;
    Ok(Transition {
        expect: ConsultationStatus::Requested,
        to: ConsultationStatus::Rejected,
        patch: ConsultationPatch {
            lawyer_id: Some(actor.id.clone()),
            rejection_reason: reason,
            ..ConsultationPatch::default()
        },
    })
}

/// Withdrawal is only open to the owning customer and only before anyone
/// has taken the request.
pub fn cancel_transition(
    actor: &Actor,
    consultation: &ConsultationRecord,
) -> Result<Transition, TransitionError> {
    if actor.id != consultation.customer_id {
        return Err(TransitionError::Forbidden(
            "only the owning customer can cancel",
        ));
    }
    require_status(consultation, ConsultationStatus::Requested)?;
    Ok(Transition {
        expect: ConsultationStatus::Requested,
        to: ConsultationStatus::Cancelled,
        patch: ConsultationPatch::default(),
    })
}

/// End an IN_PROGRESS session. The duration is frozen here; a second end
/// command loses the compare-and-swap and surfaces a state conflict.
pub fn finish_transition(
    actor: &Actor,
    consultation: &ConsultationRecord,
    now: DateTime<Utc>,
) -> Result<Transition, TransitionError> {
    if !can_end(actor, consultation) {
        return Err(TransitionError::Forbidden(
            "only participants can end this consultation",
        ));
    }
    require_status(consultation, ConsultationStatus::InProgress)?;
    let started = consultation.start_at.unwrap_or(now);
    Ok(Transition {
        expect: ConsultationStatus::InProgress,
        to: ConsultationStatus::Finished,
        patch: ConsultationPatch {
            end_at: Some(now),
            session_duration_minutes: Some(session_duration_minutes(started, now)),
            ..ConsultationPatch::default()
        },
    })
}

/// Validate a chat message: sender must be a participant, the
/// consultation must be ACCEPTED or IN_PROGRESS, and the text must be
/// non-empty after trimming. Returns the trimmed text.
pub fn message_guard(
    actor: &Actor,
    consultation: &ConsultationRecord,
    text: &str,
) -> Result<String, TransitionError> {
    if !is_participant(actor, consultation) {
        return Err(TransitionError::Forbidden(
            "only participants can send messages",
        ));
    }
    if !matches!(
        consultation.status,
        ConsultationStatus::Accepted | ConsultationStatus::InProgress
    ) {
        return Err(TransitionError::NotActive {
            actual: consultation.status,
        });
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(TransitionError::EmptyMessage);
    }
    Ok(trimmed.to_string())
}

fn require_status(
    consultation: &ConsultationRecord,
    expected: ConsultationStatus,
) -> Result<(), TransitionError> {
    if consultation.status != expected {
        return Err(TransitionError::WrongStatus {
            expected,
            actual: consultation.status,
        });
    }
    Ok(())
}

fn is_participant(actor: &Actor, consultation: &ConsultationRecord) -> bool {
    actor.id == consultation.customer_id || consultation.lawyer_id.as_deref() == Some(&actor.id)
}

/// Single-record visibility: the owning customer, the assigned lawyer,
/// or an admin.
pub fn can_view(actor: &Actor, consultation: &ConsultationRecord) -> bool {
    actor.role == Role::Admin || is_participant(actor, consultation)
}

/// Who may issue the end command: either participant or an admin.
pub fn can_end(actor: &Actor, consultation: &ConsultationRecord) -> bool {
    actor.role == Role::Admin || is_participant(actor, consultation)
}

/// Listing visibility, resolved once per request so each store backend
/// applies identical rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListScope {
    All,
    ForCustomer(String),
    RequestedPool,
    AssignedTo(String),
    /// Lawyer default view: the unassigned pool plus their own cases.
    PoolOrAssigned(String),
}

#[derive(Debug, Clone)]
pub struct ConsultationFilter {
    pub scope: ListScope,
    pub status: Option<ConsultationStatus>,
}

pub fn list_filter(actor: &Actor, status: Option<ConsultationStatus>) -> ConsultationFilter {
    match actor.role {
        Role::Customer => ConsultationFilter {
            scope: ListScope::ForCustomer(actor.id.clone()),
            status,
        },
        Role::Lawyer => match status {
            Some(ConsultationStatus::Requested) => ConsultationFilter {
                scope: ListScope::RequestedPool,
                status: None,
            },
            Some(other) => ConsultationFilter {
                scope: ListScope::AssignedTo(actor.id.clone()),
                status: Some(other),
            },
            None => ConsultationFilter {
                scope: ListScope::PoolOrAssigned(actor.id.clone()),
                status: None,
            },
        },
        Role::Admin => ConsultationFilter {
            scope: ListScope::All,
            status,
        },
    }
}

pub fn filter_matches(filter: &ConsultationFilter, consultation: &ConsultationRecord) -> bool {
    let scope_ok = match &filter.scope {
        ListScope::All => true,
        ListScope::ForCustomer(id) => consultation.customer_id == *id,
        ListScope::RequestedPool => consultation.status == ConsultationStatus::Requested,
        ListScope::AssignedTo(id) => consultation.lawyer_id.as_deref() == Some(id),
        ListScope::PoolOrAssigned(id) => {
            consultation.status == ConsultationStatus::Requested
                || consultation.lawyer_id.as_deref() == Some(id)
        }
    };
    scope_ok && filter.status.is_none_or(|s| consultation.status == s)
}

#[derive(Debug, Clone, Default)]
pub struct UserFilter {
    pub role: Option<Role>,
    pub status: Option<UserStatus>,
    pub plan: Option<PlanTier>,
}

pub fn user_filter_matches(filter: &UserFilter, user: &UserRecord) -> bool {
    filter.role.is_none_or(|r| user.role == r)
        && filter.status.is_none_or(|s| user.status == s)
        && filter.plan.is_none_or(|p| user.plan == Some(p))
}

/// Monthly consultation allowance per plan tier; `None` is uncapped.
pub fn monthly_quota(plan: PlanTier) -> Option<i64> {
    match plan {
        PlanTier::Basic => Some(3),
        PlanTier::Plus => Some(5),
        PlanTier::Premium => None,
    }
}

/// Quota decision for a capped or uncapped tier. Usage is not tracked
/// for unlimited tiers, so `used` reports 0 there.
pub fn evaluate_quota(plan: PlanTier, used: i64) -> QuotaSnapshot {
    match monthly_quota(plan) {
        Some(limit) => QuotaSnapshot {
            has_quota: used < limit,
            used,
            limit,
        },
        None => QuotaSnapshot {
            has_quota: true,
            used: 0,
            limit: UNLIMITED,
        },
    }
}

/// Fails closed: a principal that does not resolve to an active customer
/// has no quota.
pub fn quota_denied() -> QuotaSnapshot {
    QuotaSnapshot {
        has_quota: false,
        used: 0,
        limit: 0,
    }
}

pub fn quota_view(snapshot: &QuotaSnapshot) -> QuotaView {
    if snapshot.limit == UNLIMITED {
        QuotaView {
            used: snapshot.used,
            limit: None,
            remaining: None,
            is_unlimited: true,
        }
    } else {
        QuotaView {
            used: snapshot.used,
            limit: Some(snapshot.limit),
            remaining: Some(snapshot.limit - snapshot.used),
            is_unlimited: false,
        }
    }
}

/// First instant of the current calendar month in the caller's timezone
/// (quota windows follow the local server clock).
pub fn month_start<Tz: TimeZone>(now: DateTime<Tz>) -> DateTime<Tz> {
    let first = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .unwrap_or_else(|| now.date_naive());
    let midnight = NaiveDateTime::new(first, NaiveTime::MIN);
    match now.timezone().from_local_datetime(&midnight) {
        LocalResult::Single(v) => v,
        LocalResult::Ambiguous(earliest, _) => earliest,
        // Midnight falls into a DST gap; the month effectively starts now.
        LocalResult::None => now,
    }
}

/// SLA deadline: set once at creation, immutable afterwards.
pub fn response_deadline(created_at: DateTime<Utc>, response_hours: i64) -> DateTime<Utc> {
    created_at + Duration::hours(response_hours)
}

/// A breach is a still-unresolved request past its deadline.
pub fn is_sla_breach(
    status: ConsultationStatus,
    response_by: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    status == ConsultationStatus::Requested && response_by < now
}

/// Session length in whole minutes, rounded half away from zero.
pub fn session_duration_minutes(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let millis = (end - start).num_milliseconds();
    (millis as f64 / 60_000.0).round() as i64
}

pub fn max_end_time(start: DateTime<Utc>, max_duration_minutes: i64) -> DateTime<Utc> {
    start + Duration::minutes(max_duration_minutes)
}

/// Mean time from creation to session start, in hours to one decimal,
/// over consultations that were taken up and carry both timestamps.
pub fn average_response_time_hours(consultations: &[ConsultationRecord]) -> f64 {
    let mut total_ms: i64 = 0;
    let mut count: i64 = 0;
    for c in consultations {
        if !matches!(
            c.status,
            ConsultationStatus::Accepted
                | ConsultationStatus::InProgress
                | ConsultationStatus::Finished
        ) {
            continue;
        }
        if let Some(start) = c.start_at {
            total_ms += (start - c.created_at).num_milliseconds();
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    let average_hours = total_ms as f64 / count as f64 / 3_600_000.0;
    (average_hours * 10.0).round() / 10.0
}

pub fn pending_count(consultations: &[ConsultationRecord]) -> i64 {
    consultations
        .iter()
        .filter(|c| c.status == ConsultationStatus::Requested)
        .count() as i64
}

pub fn sla_breach_count(consultations: &[ConsultationRecord], now: DateTime<Utc>) -> i64 {
    consultations
        .iter()
        .filter(|c| is_sla_breach(c.status, c.response_by, now))
        .count() as i64
}

/// Histogram over every status, zero-filled so dashboards always see all
/// six buckets.
pub fn status_histogram(
    consultations: &[ConsultationRecord],
) -> BTreeMap<ConsultationStatus, i64> {
    let mut map: BTreeMap<ConsultationStatus, i64> =
        ConsultationStatus::ALL.iter().map(|s| (*s, 0)).collect();
    for c in consultations {
        *map.entry(c.status).or_insert(0) += 1;
    }
    map
}

/// Daily creation counts over the trailing 30 days, ascending by date;
/// days without activity are omitted.
pub fn creation_trend(consultations: &[ConsultationRecord], now: DateTime<Utc>) -> Vec<TrendPoint> {
    let cutoff = now - Duration::days(30);
    let mut by_day: BTreeMap<String, i64> = BTreeMap::new();
    for c in consultations {
        if c.created_at >= cutoff {
            let day = c.created_at.format("%Y-%m-%d").to_string();
            *by_day.entry(day).or_insert(0) += 1;
        }
    }
    by_day
        .into_iter()
        .map(|(date, count)| TrendPoint { date, count })
        .collect()
}

/// Mean frozen session length over FINISHED consultations, whole minutes.
pub fn average_session_duration(consultations: &[ConsultationRecord]) -> i64 {
    let durations: Vec<i64> = consultations
        .iter()
        .filter(|c| c.status == ConsultationStatus::Finished)
        .filter_map(|c| c.session_duration_minutes)
        .collect();
    if durations.is_empty() {
        return 0;
    }
    let total: i64 = durations.iter().sum();
    (total as f64 / durations.len() as f64).round() as i64
}

pub fn user_stats(users: &[UserRecord]) -> UserMetrics {
    let mut by_role: BTreeMap<Role, i64> = [Role::Admin, Role::Lawyer, Role::Customer]
        .iter()
        .map(|r| (*r, 0))
        .collect();
    let mut customers_by_plan: BTreeMap<PlanTier, i64> =
        [PlanTier::Basic, PlanTier::Plus, PlanTier::Premium]
            .iter()
            .map(|p| (*p, 0))
            .collect();
    let mut pending_lawyers = 0;
    for user in users {
        *by_role.entry(user.role).or_insert(0) += 1;
        if user.role == Role::Lawyer && user.status == UserStatus::Pending {
            pending_lawyers += 1;
        }
        if user.role == Role::Customer {
            if let Some(plan) = user.plan {
                *customers_by_plan.entry(plan).or_insert(0) += 1;
            }
        }
    }
    UserMetrics {
        by_role,
        pending_lawyers,
        customers_by_plan,
    }
}

/// One-shot dashboard snapshot; recomputed from current state per call,
/// no caching.
pub fn metrics_snapshot(
    consultations: &[ConsultationRecord],
    users: &[UserRecord],
    now: DateTime<Utc>,
) -> MetricsSnapshot {
    MetricsSnapshot {
        consultations: ConsultationMetrics {
            average_response_time_hours: average_response_time_hours(consultations),
            pending_count: pending_count(consultations),
            sla_breaches: sla_breach_count(consultations, now),
            by_status: status_histogram(consultations),
            average_session_duration_minutes: average_session_duration(consultations),
            trend: creation_trend(consultations, now),
        },
        users: user_stats(users),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("valid rfc3339")
            .with_timezone(&Utc)
    }

    fn actor(id: &str, role: Role) -> Actor {
        Actor {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            role,
            status: UserStatus::Active,
            plan: None,
        }
    }

    fn consultation(status: ConsultationStatus) -> ConsultationRecord {
        ConsultationRecord {
            id: "con_1".to_string(),
            customer_id: "usr_c".to_string(),
            lawyer_id: None,
            status,
            title: DEFAULT_TITLE.to_string(),
            description: "Preciso de ajuda".to_string(),
            attachments: vec![],
            response_by: at("2026-03-11T12:00:00Z"),
            start_at: None,
            end_at: None,
            last_activity_at: None,
            rejection_reason: None,
            session_duration_minutes: None,
            created_at: at("2026-03-10T12:00:00Z"),
        }
    }

    #[test]
    fn quota_limits_per_tier() {
        assert_eq!(monthly_quota(PlanTier::Basic), Some(3));
        assert_eq!(monthly_quota(PlanTier::Plus), Some(5));
        assert_eq!(monthly_quota(PlanTier::Premium), None);

        let q = evaluate_quota(PlanTier::Basic, 3);
        assert!(!q.has_quota);
        assert_eq!((q.used, q.limit), (3, 3));

        // Premium never runs out and reports no usage.
        let q = evaluate_quota(PlanTier::Premium, 999);
        assert!(q.has_quota);
        assert_eq!((q.used, q.limit), (0, UNLIMITED));
    }

    #[test]
    fn quota_view_translates_unlimited_to_nulls() {
        let view = quota_view(&evaluate_quota(PlanTier::Premium, 0));
        assert!(view.is_unlimited);
        assert_eq!(view.limit, None);
        assert_eq!(view.remaining, None);

        let view = quota_view(&evaluate_quota(PlanTier::Basic, 1));
        assert_eq!(view.limit, Some(3));
        assert_eq!(view.remaining, Some(2));
        assert!(!view.is_unlimited);
    }

    #[test]
    fn month_start_is_first_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 3, 17, 15, 42, 9).unwrap();
        assert_eq!(
            month_start(now),
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn response_deadline_is_exactly_24h_after_creation() {
        let created = at("2026-03-10T12:00:00Z");
        assert_eq!(response_deadline(created, 24), at("2026-03-11T12:00:00Z"));
    }

    #[test]
    fn session_duration_rounds_to_nearest_minute() {
        let start = at("2026-03-10T12:00:00Z");
        assert_eq!(session_duration_minutes(start, at("2026-03-10T12:10:29Z")), 10);
        assert_eq!(session_duration_minutes(start, at("2026-03-10T12:10:30Z")), 11);
        assert_eq!(session_duration_minutes(start, start), 0);
    }

    #[test]
    fn sync_accept_sets_lawyer_without_starting_session() {
        let lawyer = actor("usr_l", Role::Lawyer);
        let c = consultation(ConsultationStatus::Requested);
        let t = accept_transition(&lawyer, &c, false, at("2026-03-10T13:00:00Z")).unwrap();
        assert_eq!(t.expect, ConsultationStatus::Requested);
        assert_eq!(t.to, ConsultationStatus::Accepted);
        assert_eq!(t.patch.lawyer_id.as_deref(), Some("usr_l"));
        assert!(t.patch.start_at.is_none());
    }

    #[test]
    fn live_accept_starts_the_session() {
        let lawyer = actor("usr_l", Role::Lawyer);
        let c = consultation(ConsultationStatus::Requested);
        let now = at("2026-03-10T13:00:00Z");
        let t = accept_transition(&lawyer, &c, true, now).unwrap();
        assert_eq!(t.to, ConsultationStatus::InProgress);
        assert_eq!(t.patch.start_at, Some(now));
        assert_eq!(t.patch.last_activity_at, Some(now));
    }

    #[test]
    fn customers_cannot_accept() {
        let customer = actor("usr_c", Role::Customer);
        let c = consultation(ConsultationStatus::Requested);
        let err = accept_transition(&customer, &c, false, Utc::now()).unwrap_err();
        assert!(matches!(err, TransitionError::Forbidden(_)));
    }

    #[test]
    fn accept_requires_requested_status() {
        let lawyer = actor("usr_l", Role::Lawyer);
        let c = consultation(ConsultationStatus::Accepted);
        let err = accept_transition(&lawyer, &c, false, Utc::now()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::WrongStatus {
                expected: ConsultationStatus::Requested,
                actual: ConsultationStatus::Accepted,
            }
        );
    }

    #[test]
    fn reject_records_lawyer_and_reason() {
        let lawyer = actor("usr_l", Role::Lawyer);
        let c = consultation(ConsultationStatus::Requested);
        let t = reject_transition(&lawyer, &c, Some("fora da minha área".to_string())).unwrap();
        assert_eq!(t.to, ConsultationStatus::Rejected);
        assert_eq!(t.patch.lawyer_id.as_deref(), Some("usr_l"));
        assert_eq!(t.patch.rejection_reason.as_deref(), Some("fora da minha área"));
    }

    #[test]
    fn cancel_is_owner_only_and_pre_acceptance_only() {
        let owner = actor("usr_c", Role::Customer);
        let stranger = actor("usr_x", Role::Customer);

        let c = consultation(ConsultationStatus::Requested);
        assert!(cancel_transition(&owner, &c).is_ok());
        assert!(matches!(
            cancel_transition(&stranger, &c).unwrap_err(),
            TransitionError::Forbidden(_)
        ));

        // Cancel after acceptance loses to the state guard.
        let mut accepted = consultation(ConsultationStatus::Accepted);
        accepted.lawyer_id = Some("usr_l".to_string());
        assert!(matches!(
            cancel_transition(&owner, &accepted).unwrap_err(),
            TransitionError::WrongStatus { .. }
        ));
    }

    #[test]
    fn finish_freezes_rounded_duration() {
        let owner = actor("usr_c", Role::Customer);
        let mut c = consultation(ConsultationStatus::InProgress);
        c.lawyer_id = Some("usr_l".to_string());
        c.start_at = Some(at("2026-03-10T13:00:00Z"));

        let t = finish_transition(&owner, &c, at("2026-03-10T13:42:20Z")).unwrap();
        assert_eq!(t.to, ConsultationStatus::Finished);
        assert_eq!(t.patch.session_duration_minutes, Some(42));

        // A finished consultation cannot be ended again.
        let mut done = c.clone();
        done.status = ConsultationStatus::Finished;
        assert!(matches!(
            finish_transition(&owner, &done, Utc::now()).unwrap_err(),
            TransitionError::WrongStatus { .. }
        ));
    }

    #[test]
    fn admin_may_end_a_session() {
        let admin = actor("usr_a", Role::Admin);
        let mut c = consultation(ConsultationStatus::InProgress);
        c.lawyer_id = Some("usr_l".to_string());
        c.start_at = Some(at("2026-03-10T13:00:00Z"));
        assert!(finish_transition(&admin, &c, at("2026-03-10T13:30:00Z")).is_ok());
    }

    #[test]
    fn message_guard_rejects_blank_text_and_non_participants() {
        let owner = actor("usr_c", Role::Customer);
        let stranger = actor("usr_x", Role::Customer);
        let mut c = consultation(ConsultationStatus::Accepted);
        c.lawyer_id = Some("usr_l".to_string());

        assert_eq!(
            message_guard(&owner, &c, "  Olá  ").unwrap(),
            "Olá".to_string()
        );
        assert_eq!(
            message_guard(&owner, &c, "   ").unwrap_err(),
            TransitionError::EmptyMessage
        );
        assert!(matches!(
            message_guard(&stranger, &c, "oi").unwrap_err(),
            TransitionError::Forbidden(_)
        ));

        let requested = consultation(ConsultationStatus::Requested);
        assert!(matches!(
            message_guard(&owner, &requested, "oi").unwrap_err(),
            TransitionError::NotActive { .. }
        ));
    }

    #[test]
    fn lawyer_default_listing_covers_pool_and_own_cases() {
        let lawyer = actor("usr_l", Role::Lawyer);
        let filter = list_filter(&lawyer, None);
        assert_eq!(filter.scope, ListScope::PoolOrAssigned("usr_l".to_string()));

        let pool = consultation(ConsultationStatus::Requested);
        assert!(filter_matches(&filter, &pool));

        let mut mine = consultation(ConsultationStatus::Finished);
        mine.lawyer_id = Some("usr_l".to_string());
        assert!(filter_matches(&filter, &mine));

        let mut other = consultation(ConsultationStatus::Accepted);
        other.lawyer_id = Some("usr_z".to_string());
        assert!(!filter_matches(&filter, &other));

        // Status filter REQUESTED selects the whole unassigned pool.
        let filter = list_filter(&lawyer, Some(ConsultationStatus::Requested));
        assert_eq!(filter.scope, ListScope::RequestedPool);
        // Any other status narrows to their own cases.
        let filter = list_filter(&lawyer, Some(ConsultationStatus::Finished));
        assert_eq!(filter.scope, ListScope::AssignedTo("usr_l".to_string()));
    }

    #[test]
    fn average_session_duration_over_finished_sessions() {
        let mut records = vec![];
        for minutes in [10, 20, 30] {
            let mut c = consultation(ConsultationStatus::Finished);
            c.session_duration_minutes = Some(minutes);
            records.push(c);
        }
        assert_eq!(average_session_duration(&records), 20);
        assert_eq!(average_session_duration(&[]), 0);
    }

    #[test]
    fn average_response_time_in_hours_one_decimal() {
        let mut a = consultation(ConsultationStatus::Accepted);
        a.start_at = Some(a.created_at + Duration::hours(1));
        let mut b = consultation(ConsultationStatus::Finished);
        b.start_at = Some(b.created_at + Duration::hours(2));
        // CANCELLED records never qualify.
        let c = consultation(ConsultationStatus::Cancelled);

        assert_eq!(average_response_time_hours(&[a, b, c]), 1.5);
        assert_eq!(average_response_time_hours(&[]), 0.0);
    }

    #[test]
    fn sla_breaches_count_only_overdue_requests() {
        let now = at("2026-03-12T00:00:00Z");
        let overdue = consultation(ConsultationStatus::Requested); // due 03-11
        let mut handled = consultation(ConsultationStatus::Accepted);
        handled.lawyer_id = Some("usr_l".to_string());
        let mut fresh = consultation(ConsultationStatus::Requested);
        fresh.response_by = at("2026-03-13T00:00:00Z");

        assert_eq!(sla_breach_count(&[overdue, handled, fresh], now), 1);
    }

    #[test]
    fn trend_buckets_by_day_within_30_days() {
        let now = at("2026-03-31T12:00:00Z");
        let mut old = consultation(ConsultationStatus::Requested);
        old.created_at = at("2026-01-01T12:00:00Z");
        let mut d1 = consultation(ConsultationStatus::Requested);
        d1.created_at = at("2026-03-10T08:00:00Z");
        let mut d2 = consultation(ConsultationStatus::Requested);
        d2.created_at = at("2026-03-10T19:00:00Z");
        let mut d3 = consultation(ConsultationStatus::Requested);
        d3.created_at = at("2026-03-11T09:00:00Z");

        let trend = creation_trend(&[old, d1, d2, d3], now);
        assert_eq!(trend.len(), 2);
        assert_eq!((trend[0].date.as_str(), trend[0].count), ("2026-03-10", 2));
        assert_eq!((trend[1].date.as_str(), trend[1].count), ("2026-03-11", 1));
    }

    #[test]
    fn user_stats_zero_fill_roles_and_plans() {
        let users = vec![
            UserRecord {
                id: "usr_1".to_string(),
                email: "l@example.com".to_string(),
                phone: None,
                role: Role::Lawyer,
                status: UserStatus::Pending,
                plan: None,
                plan_expires_at: None,
                trial_expires_at: None,
                is_on_trial: false,
                token: String::new(),
                created_at: Utc::now(),
            },
            UserRecord {
                id: "usr_2".to_string(),
                email: "c@example.com".to_string(),
                phone: None,
                role: Role::Customer,
                status: UserStatus::Active,
                plan: Some(PlanTier::Plus),
                plan_expires_at: None,
                trial_expires_at: None,
                is_on_trial: false,
                token: String::new(),
                created_at: Utc::now(),
            },
        ];
        let stats = user_stats(&users);
        assert_eq!(stats.by_role[&Role::Admin], 0);
        assert_eq!(stats.by_role[&Role::Lawyer], 1);
        assert_eq!(stats.pending_lawyers, 1);
        assert_eq!(stats.customers_by_plan[&PlanTier::Plus], 1);
        assert_eq!(stats.customers_by_plan[&PlanTier::Basic], 0);
    }
}
