use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::error::ApiError;
use crate::models::{ConflictView, SlotView};
use crate::policy::PolicyStore;

/// Half-open UTC interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Interval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The part of `self` inside `window`, if any.
    fn clip(&self, window: &Interval) -> Option<Interval> {
        let start = self.start.max(window.start);
        let end = self.end.min(window.end);
        (start < end).then_some(Interval { start, end })
    }
}

// ── Pure interval core ──

/// Merge possibly overlapping intervals into a sorted disjoint list.
fn merge(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.sort_by_key(|i| i.start);
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match merged.last_mut() {
            Some(last) if interval.start <= last.end => {
                last.end = last.end.max(interval.end);
            }
            _ => merged.push(interval),
        }
    }
    merged
}

/// Free gaps inside `window` after removing `blocked` (must be merged and
/// sorted).
fn subtract(window: &Interval, blocked: &[Interval]) -> Vec<Interval> {
    let mut gaps = Vec::new();
    let mut cursor = window.start;
    for b in blocked {
        if b.end <= cursor {
            continue;
        }
        if b.start >= window.end {
            break;
        }
        if b.start > cursor {
            gaps.push(Interval::new(cursor, b.start));
        }
        cursor = cursor.max(b.end);
    }
    if cursor < window.end {
        gaps.push(Interval::new(cursor, window.end));
    }
    gaps
}

fn gaps_for_window(window: &Interval, breaks: &[Interval], busy: &[Interval]) -> Vec<Interval> {
    let blocked: Vec<Interval> = breaks
        .iter()
        .chain(busy.iter())
        .filter_map(|i| i.clip(window))
        .collect();
    subtract(window, &merge(blocked))
}

/// Legal starts for one local day: walk each working window on the slot
/// grid (aligned to the window's opening) and keep every start whose full
/// interval fits a free gap and obeys the policy horizon.
fn day_slots(
    windows: &[Interval],
    breaks: &[Interval],
    busy: &[Interval],
    duration: Duration,
    grid: Duration,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    let mut slots = Vec::new();
    for window in windows {
        let gaps = gaps_for_window(window, breaks, busy);
        let mut t = window.start;
        while t + duration <= window.end {
            if t >= not_before
                && t <= not_after
                && gaps.iter().any(|g| g.start <= t && t + duration <= g.end)
            {
                slots.push(t);
            }
            t += grid;
        }
    }
    slots.sort_unstable();
    slots
}

/// If `[start, start+duration)` fits the schedule, the end of the free gap
/// containing it (the next occupied boundary). Used by the any-staff
/// tie-break: farther boundary = more contiguous room kept free.
fn free_room_after(
    windows: &[Interval],
    breaks: &[Interval],
    busy: &[Interval],
    start: DateTime<Utc>,
    duration: Duration,
) -> Option<DateTime<Utc>> {
    let end = start + duration;
    for window in windows {
        if !(window.start <= start && end <= window.end) {
            continue;
        }
        return gaps_for_window(window, breaks, busy)
            .into_iter()
            .find(|g| g.start <= start && end <= g.end)
            .map(|g| g.end);
    }
    None
}

// ── Local-time plumbing ──

/// Resolve a minute-of-day on a local calendar date to a UTC instant.
/// Ambiguous local times (DST folds) take the earliest mapping.
pub(crate) fn local_instant(tz: Tz, date: NaiveDate, minute_of_day: i32) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(0, 0, 0)? + Duration::minutes(minute_of_day as i64);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn schedule_intervals(tz: Tz, date: NaiveDate, pairs: &[(i32, i32)]) -> Vec<Interval> {
    pairs
        .iter()
        .filter_map(|(from, to)| {
            let start = local_instant(tz, date, *from)?;
            let end = local_instant(tz, date, *to)?;
            (start < end).then_some(Interval { start, end })
        })
        .collect()
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    next.and_then(|d| d.pred_opt()).map(|d| d.day()).unwrap_or(28)
}

fn weekday_index(date: NaiveDate) -> i16 {
    date.weekday().num_days_from_monday() as i16
}

// ── Engine ──

pub struct CheckOutcome {
    pub available: bool,
    pub conflict: Option<ConflictView>,
    pub reason: Option<&'static str>,
}

/// Read-only availability queries. Pure function of the store snapshot at
/// call time; callers must re-verify at booking time (the state machine
/// re-checks under its advisory locks).
pub struct AvailabilityEngine {
    db: PgPool,
    catalog: Arc<Catalog>,
    policy: Arc<PolicyStore>,
    tz: Tz,
    grid_minutes: i64,
}

impl AvailabilityEngine {
    pub fn new(
        db: PgPool,
        catalog: Arc<Catalog>,
        policy: Arc<PolicyStore>,
        tz: Tz,
        grid_minutes: i64,
    ) -> Self {
        Self {
            db,
            catalog,
            policy,
            tz,
            grid_minutes: grid_minutes.max(1),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Legal starts for a bundle on one staff member and local date.
    pub async fn slots(
        &self,
        staff_id: i64,
        date: NaiveDate,
        bundle_ids: &[i64],
    ) -> Result<Vec<DateTime<Utc>>, ApiError> {
        let snap = self.catalog.snapshot().await?;
        let bundle = snap.resolve_bundle(bundle_ids)?;
        if snap.staff_member(staff_id).is_none() {
            return Err(ApiError::NotFound("staff member"));
        }
        if !snap.can_perform(staff_id, bundle_ids) {
            return Err(ApiError::NoSkillMatch);
        }
        let duration = Duration::minutes(snap.effective_duration_min(Some(staff_id), &bundle)?);
        let policy = self.policy.current().await?;
        let now = Utc::now();

        let (window_mins, break_mins) = snap.day_schedule(staff_id, weekday_index(date));
        let windows = schedule_intervals(self.tz, date, &window_mins);
        if windows.is_empty() {
            return Ok(Vec::new());
        }
        let breaks = schedule_intervals(self.tz, date, &break_mins);

        let busy = self
            .busy_intervals(staff_id, padded_span(&windows), now)
            .await?;

        Ok(day_slots(
            &windows,
            &breaks,
            &busy,
            duration,
            Duration::minutes(self.grid_minutes),
            now + Duration::minutes(policy.lead_time_minutes),
            now + Duration::days(policy.future_window_days),
        ))
    }

    /// Any-staff mode: the union of per-staff slots, each instant carrying
    /// the staff member chosen by the free-room tie-break.
    pub async fn slots_any(
        &self,
        date: NaiveDate,
        bundle_ids: &[i64],
    ) -> Result<Vec<SlotView>, ApiError> {
        let snap = self.catalog.snapshot().await?;
        snap.resolve_bundle(bundle_ids)?;
        let capable = snap.capable_staff(bundle_ids);
        if capable.is_empty() {
            return Err(ApiError::NoSkillMatch);
        }
        let policy = self.policy.current().await?;
        let now = Utc::now();

        // instant → (staff, free room after); ascending staff order makes
        // "strictly more room" implement the lowest-id tie-break.
        let mut best: BTreeMap<DateTime<Utc>, (i64, DateTime<Utc>)> = BTreeMap::new();
        for staff_id in capable {
            let bundle = snap.resolve_bundle(bundle_ids)?;
            let duration =
                Duration::minutes(snap.effective_duration_min(Some(staff_id), &bundle)?);
            let (window_mins, break_mins) = snap.day_schedule(staff_id, weekday_index(date));
            let windows = schedule_intervals(self.tz, date, &window_mins);
            if windows.is_empty() {
                continue;
            }
            let breaks = schedule_intervals(self.tz, date, &break_mins);
            let busy = self
                .busy_intervals(staff_id, padded_span(&windows), now)
                .await?;

            for slot in day_slots(
                &windows,
                &breaks,
                &busy,
                duration,
                Duration::minutes(self.grid_minutes),
                now + Duration::minutes(policy.lead_time_minutes),
                now + Duration::days(policy.future_window_days),
            ) {
                let Some(room) = free_room_after(&windows, &breaks, &busy, slot, duration) else {
                    continue;
                };
                match best.get(&slot) {
                    Some((_, prev_room)) if *prev_room >= room => {}
                    _ => {
                        best.insert(slot, (staff_id, room));
                    }
                }
            }
        }

        Ok(best
            .into_iter()
            .map(|(start, (staff_id, _))| SlotView { start, staff_id })
            .collect())
    }

    /// Days of the month with at least one legal start.
    pub async fn available_days(
        &self,
        staff_id: Option<i64>,
        year: i32,
        month: u32,
        bundle_ids: &[i64],
    ) -> Result<Vec<u32>, ApiError> {
        if !(1..=12).contains(&month) || !(2000..=2100).contains(&year) {
            return Err(ApiError::BadInput("invalid year/month".into()));
        }
        let snap = self.catalog.snapshot().await?;
        let bundle = snap.resolve_bundle(bundle_ids)?;
        let staff_ids = match staff_id {
            Some(id) => {
                if snap.staff_member(id).is_none() {
                    return Err(ApiError::NotFound("staff member"));
                }
                if !snap.can_perform(id, bundle_ids) {
                    return Err(ApiError::NoSkillMatch);
                }
                vec![id]
            }
            None => {
                let capable = snap.capable_staff(bundle_ids);
                if capable.is_empty() {
                    return Err(ApiError::NoSkillMatch);
                }
                capable
            }
        };

        let policy = self.policy.current().await?;
        let now = Utc::now();
        let not_before = now + Duration::minutes(policy.lead_time_minutes);
        let not_after = now + Duration::days(policy.future_window_days);
        let grid = Duration::minutes(self.grid_minutes);

        // One busy query for the whole month across all relevant staff.
        let first = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| ApiError::BadInput("invalid year/month".into()))?;
        let last_day = days_in_month(year, month);
        let month_start = local_instant(self.tz, first, 0)
            .ok_or_else(|| ApiError::BadInput("month start is not representable".into()))?;
        let month_span = Interval::new(
            month_start - Duration::days(1),
            month_start + Duration::days(last_day as i64 + 1),
        );
        let mut busy_by_staff: BTreeMap<i64, Vec<Interval>> = BTreeMap::new();
        for (staff, interval) in self
            .busy_intervals_for_staff(&staff_ids, month_span, now)
            .await?
        {
            busy_by_staff.entry(staff).or_default().push(interval);
        }

        let mut days = Vec::new();
        for day in 1..=last_day {
            let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
                continue;
            };
            let weekday = weekday_index(date);
            let found = staff_ids.iter().any(|&sid| {
                let duration = match snap.effective_duration_min(Some(sid), &bundle) {
                    Ok(minutes) => Duration::minutes(minutes),
                    Err(_) => return false,
                };
                let (window_mins, break_mins) = snap.day_schedule(sid, weekday);
                let windows = schedule_intervals(self.tz, date, &window_mins);
                if windows.is_empty() {
                    return false;
                }
                let breaks = schedule_intervals(self.tz, date, &break_mins);
                let busy = busy_by_staff.get(&sid).map(Vec::as_slice).unwrap_or(&[]);
                !day_slots(&windows, &breaks, busy, duration, grid, not_before, not_after)
                    .is_empty()
            });
            if found {
                days.push(day);
            }
        }
        Ok(days)
    }

    /// Advisory pre-check for one exact start. Mirrors the Hold gate
    /// (policy + overlap); the state machine re-verifies under locks.
    pub async fn check_slot(
        &self,
        staff_id: Option<i64>,
        start: DateTime<Utc>,
        bundle_ids: &[i64],
    ) -> Result<CheckOutcome, ApiError> {
        let snap = self.catalog.snapshot().await?;
        let bundle = snap.resolve_bundle(bundle_ids)?;
        let policy = self.policy.current().await?;
        let now = Utc::now();

        if let Err(e) = policy.can_start(now, start) {
            return Ok(CheckOutcome {
                available: false,
                conflict: None,
                reason: Some(e.tag()),
            });
        }

        match staff_id {
            Some(id) => {
                if !snap.can_perform(id, bundle_ids) {
                    return Err(ApiError::NoSkillMatch);
                }
                let duration =
                    Duration::minutes(snap.effective_duration_min(Some(id), &bundle)?);
                let proposed = Interval::new(start, start + duration);
                let conflict = self.first_conflict(id, proposed, now).await?;
                let reason = conflict.as_ref().map(|_| "SlotUnavailable");
                Ok(CheckOutcome {
                    available: conflict.is_none(),
                    conflict,
                    reason,
                })
            }
            None => match self.resolve_staff(start, bundle_ids).await {
                Ok(_) => Ok(CheckOutcome {
                    available: true,
                    conflict: None,
                    reason: None,
                }),
                Err(ApiError::SlotUnavailable) => Ok(CheckOutcome {
                    available: false,
                    conflict: None,
                    reason: Some("SlotUnavailable"),
                }),
                Err(e) => Err(e),
            },
        }
    }

    /// Any-staff resolution for an exact start: among capable staff free at
    /// that instant, pick the one whose next occupied boundary is farthest
    /// (ties → lowest id).
    pub async fn resolve_staff(
        &self,
        start: DateTime<Utc>,
        bundle_ids: &[i64],
    ) -> Result<i64, ApiError> {
        let snap = self.catalog.snapshot().await?;
        let bundle = snap.resolve_bundle(bundle_ids)?;
        let capable = snap.capable_staff(bundle_ids);
        if capable.is_empty() {
            return Err(ApiError::NoSkillMatch);
        }
        let now = Utc::now();
        let date = start.with_timezone(&self.tz).date_naive();

        let mut best: Option<(i64, DateTime<Utc>)> = None;
        for staff_id in capable {
            let duration =
                Duration::minutes(snap.effective_duration_min(Some(staff_id), &bundle)?);
            let (window_mins, break_mins) = snap.day_schedule(staff_id, weekday_index(date));
            let windows = schedule_intervals(self.tz, date, &window_mins);
            if windows.is_empty() {
                continue;
            }
            let breaks = schedule_intervals(self.tz, date, &break_mins);
            let busy = self
                .busy_intervals(staff_id, padded_span(&windows), now)
                .await?;
            if let Some(room) = free_room_after(&windows, &breaks, &busy, start, duration) {
                match best {
                    Some((_, prev)) if prev >= room => {}
                    _ => best = Some((staff_id, room)),
                }
            }
        }
        best.map(|(id, _)| id).ok_or(ApiError::SlotUnavailable)
    }

    // ── Store reads ──

    async fn busy_intervals(
        &self,
        staff_id: i64,
        span: Interval,
        now: DateTime<Utc>,
    ) -> Result<Vec<Interval>, ApiError> {
        let rows = sqlx::query_as::<_, (DateTime<Utc>, DateTime<Utc>)>(
            "SELECT starts_at, ends_at FROM bookings
             WHERE staff_id = $1 AND starts_at < $2 AND ends_at > $3
               AND (status IN ('confirmed', 'paid', 'done')
                    OR (status IN ('reserved', 'pending_payment') AND hold_expires_at > $4))
             ORDER BY starts_at",
        )
        .bind(staff_id)
        .bind(span.end)
        .bind(span.start)
        .bind(now)
        .fetch_all(&self.db)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(start, end)| Interval::new(start, end))
            .collect())
    }

    async fn busy_intervals_for_staff(
        &self,
        staff_ids: &[i64],
        span: Interval,
        now: DateTime<Utc>,
    ) -> Result<Vec<(i64, Interval)>, ApiError> {
        let rows = sqlx::query_as::<_, (i64, DateTime<Utc>, DateTime<Utc>)>(
            "SELECT staff_id, starts_at, ends_at FROM bookings
             WHERE staff_id = ANY($1) AND starts_at < $2 AND ends_at > $3
               AND (status IN ('confirmed', 'paid', 'done')
                    OR (status IN ('reserved', 'pending_payment') AND hold_expires_at > $4))
             ORDER BY starts_at",
        )
        .bind(staff_ids)
        .bind(span.end)
        .bind(span.start)
        .bind(now)
        .fetch_all(&self.db)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(staff, start, end)| (staff, Interval::new(start, end)))
            .collect())
    }

    async fn first_conflict(
        &self,
        staff_id: i64,
        proposed: Interval,
        now: DateTime<Utc>,
    ) -> Result<Option<ConflictView>, ApiError> {
        let busy = self.busy_intervals(staff_id, proposed, now).await?;
        Ok(busy.first().map(|i| ConflictView {
            starts_at: i.start,
            ends_at: i.end,
        }))
    }
}

/// The union span of a day's windows, padded so bookings hanging over the
/// day edges are still subtracted.
fn padded_span(windows: &[Interval]) -> Interval {
    let start = windows.iter().map(|w| w.start).min().unwrap_or_default();
    let end = windows.iter().map(|w| w.end).max().unwrap_or_default();
    Interval::new(start - Duration::days(1), end + Duration::days(1))
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 10, h, m, 0).unwrap()
    }

    fn iv(from: (u32, u32), to: (u32, u32)) -> Interval {
        Interval::new(at(from.0, from.1), at(to.0, to.1))
    }

    fn far_past() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn far_future() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap()
    }

    fn walk(
        windows: &[Interval],
        breaks: &[Interval],
        busy: &[Interval],
        duration_min: i64,
    ) -> Vec<DateTime<Utc>> {
        day_slots(
            windows,
            breaks,
            busy,
            Duration::minutes(duration_min),
            Duration::minutes(15),
            far_past(),
            far_future(),
        )
    }

    // merge / subtract

    #[test]
    fn test_merge_overlapping() {
        let merged = merge(vec![iv((11, 0), (12, 0)), iv((11, 30), (13, 0))]);
        assert_eq!(merged, vec![iv((11, 0), (13, 0))]);
    }

    #[test]
    fn test_merge_adjacent_and_disjoint() {
        let merged = merge(vec![
            iv((14, 0), (15, 0)),
            iv((9, 0), (10, 0)),
            iv((10, 0), (11, 0)),
        ]);
        assert_eq!(merged, vec![iv((9, 0), (11, 0)), iv((14, 0), (15, 0))]);
    }

    #[test]
    fn test_subtract_middle_block() {
        let gaps = subtract(&iv((9, 0), (18, 0)), &[iv((11, 0), (12, 0))]);
        assert_eq!(gaps, vec![iv((9, 0), (11, 0)), iv((12, 0), (18, 0))]);
    }

    #[test]
    fn test_subtract_blocked_edges() {
        let gaps = subtract(
            &iv((9, 0), (18, 0)),
            &[iv((8, 0), (9, 30)), iv((17, 30), (19, 0))],
        );
        assert_eq!(gaps, vec![iv((9, 30), (17, 30))]);
    }

    #[test]
    fn test_subtract_fully_blocked() {
        let gaps = subtract(&iv((9, 0), (18, 0)), &[iv((8, 0), (19, 0))]);
        assert!(gaps.is_empty());
    }

    // day_slots

    #[test]
    fn test_empty_day_full_grid() {
        // 09:00–18:00, 60-minute service, 15-minute grid → 09:00 … 17:00
        let slots = walk(&[iv((9, 0), (18, 0))], &[], &[], 60);
        assert_eq!(slots.len(), 33);
        assert_eq!(slots[0], at(9, 0));
        assert_eq!(slots[1], at(9, 15));
        assert_eq!(*slots.last().unwrap(), at(17, 0));
    }

    #[test]
    fn test_booking_removes_covering_starts() {
        // booking 11:00–12:00: every start in (10:00, 12:00) is illegal
        let slots = walk(&[iv((9, 0), (18, 0))], &[], &[iv((11, 0), (12, 0))], 60);
        assert!(slots.contains(&at(10, 0)));
        assert!(!slots.contains(&at(10, 15)));
        assert!(!slots.contains(&at(10, 45)));
        assert!(!slots.contains(&at(11, 0)));
        assert!(!slots.contains(&at(11, 45)));
        assert!(slots.contains(&at(12, 0)));
    }

    #[test]
    fn test_break_subtracted_like_booking() {
        let slots = walk(&[iv((9, 0), (13, 0))], &[iv((12, 0), (12, 30))], &[], 30);
        assert!(slots.contains(&at(11, 30)));
        assert!(!slots.contains(&at(11, 45)));
        assert!(!slots.contains(&at(12, 0)));
        assert!(slots.contains(&at(12, 30)));
    }

    #[test]
    fn test_grid_aligned_to_window_open() {
        let slots = walk(&[iv((9, 10), (11, 0))], &[], &[], 60);
        assert_eq!(slots[0], at(9, 10));
        assert_eq!(slots[1], at(9, 25));
        // 10:10 would run past close; 09:55 + 60min = 10:55 still fits
        assert_eq!(*slots.last().unwrap(), at(9, 55));
    }

    #[test]
    fn test_duration_must_fit_before_close() {
        let slots = walk(&[iv((9, 0), (10, 0))], &[], &[], 45);
        assert_eq!(slots, vec![at(9, 0), at(9, 15)]);
    }

    #[test]
    fn test_duration_longer_than_window() {
        let slots = walk(&[iv((9, 0), (10, 0))], &[], &[], 90);
        assert!(slots.is_empty());
    }

    #[test]
    fn test_two_windows_each_aligned() {
        let slots = walk(&[iv((9, 0), (10, 0)), iv((14, 5), (15, 5))], &[], &[], 60);
        assert_eq!(slots, vec![at(9, 0), at(14, 5)]);
    }

    #[test]
    fn test_not_before_filter() {
        let slots = day_slots(
            &[iv((9, 0), (12, 0))],
            &[],
            &[],
            Duration::minutes(60),
            Duration::minutes(15),
            at(10, 20),
            far_future(),
        );
        assert_eq!(slots[0], at(10, 30));
    }

    #[test]
    fn test_not_after_filter() {
        let slots = day_slots(
            &[iv((9, 0), (12, 0))],
            &[],
            &[],
            Duration::minutes(60),
            Duration::minutes(15),
            far_past(),
            at(9, 30),
        );
        assert_eq!(slots, vec![at(9, 0), at(9, 15), at(9, 30)]);
    }

    #[test]
    fn test_busy_overhanging_day_edge() {
        // booking started before the window opens and ends inside it
        let slots = walk(&[iv((9, 0), (12, 0))], &[], &[iv((7, 0), (10, 0))], 60);
        assert_eq!(slots[0], at(10, 0));
    }

    // free_room_after

    #[test]
    fn test_free_room_reports_gap_end() {
        let windows = [iv((9, 0), (18, 0))];
        let busy = [iv((14, 0), (15, 0))];
        let room = free_room_after(&windows, &[], &busy, at(10, 0), Duration::minutes(60));
        assert_eq!(room, Some(at(14, 0)));
        let room = free_room_after(&windows, &[], &busy, at(15, 0), Duration::minutes(60));
        assert_eq!(room, Some(at(18, 0)));
    }

    #[test]
    fn test_free_room_none_when_occupied() {
        let windows = [iv((9, 0), (18, 0))];
        let busy = [iv((10, 30), (11, 30))];
        assert!(free_room_after(&windows, &[], &busy, at(10, 0), Duration::minutes(60)).is_none());
    }

    #[test]
    fn test_free_room_none_outside_windows() {
        let windows = [iv((9, 0), (18, 0))];
        assert!(free_room_after(&windows, &[], &[], at(17, 30), Duration::minutes(60)).is_none());
    }

    // calendar helpers

    #[test]
    fn test_days_in_month() {
        assert_eq!(days_in_month(2026, 2), 28);
        assert_eq!(days_in_month(2028, 2), 29);
        assert_eq!(days_in_month(2026, 12), 31);
        assert_eq!(days_in_month(2026, 6), 30);
    }

    #[test]
    fn test_weekday_index_monday_zero() {
        // 2026-06-10 is a Wednesday
        assert_eq!(weekday_index(NaiveDate::from_ymd_opt(2026, 6, 10).unwrap()), 2);
        assert_eq!(weekday_index(NaiveDate::from_ymd_opt(2026, 6, 8).unwrap()), 0);
        assert_eq!(weekday_index(NaiveDate::from_ymd_opt(2026, 6, 14).unwrap()), 6);
    }

    #[test]
    fn test_local_instant_kyiv_summer_offset() {
        let tz: Tz = "Europe/Kyiv".parse().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 6, 10).unwrap();
        // 09:00 local = 06:00 UTC during EEST
        let instant = local_instant(tz, date, 9 * 60).unwrap();
        assert_eq!(instant, Utc.with_ymd_and_hms(2026, 6, 10, 6, 0, 0).unwrap());
    }
}
