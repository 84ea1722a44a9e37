use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::ApiError;
use crate::models::{BreakWindow, Service, Staff, WorkingWindow};

/// Immutable read model of the service catalog: services, staff, the
/// staff↔service junction with per-staff pace, and weekly schedules.
/// Consumed by the availability and pricing engines; never written through.
#[derive(Debug)]
pub struct CatalogSnapshot {
    pub services: Vec<Service>,
    pub staff: Vec<Staff>,
    /// staff_id → service_id → speed_percent
    skills: HashMap<i64, HashMap<i64, i32>>,
    windows: HashMap<i64, Vec<WorkingWindow>>,
    breaks: HashMap<i64, Vec<BreakWindow>>,
}

impl CatalogSnapshot {
    pub fn service(&self, id: i64) -> Option<&Service> {
        self.services.iter().find(|s| s.id == id)
    }

    pub fn staff_member(&self, id: i64) -> Option<&Staff> {
        self.staff.iter().find(|s| s.id == id)
    }

    /// Resolve a bundle into service rows, preserving order. Empty bundles
    /// and unknown or inactive services are rejected.
    pub fn resolve_bundle(&self, ids: &[i64]) -> Result<Vec<&Service>, ApiError> {
        if ids.is_empty() {
            return Err(ApiError::BadInput("bundle must not be empty".into()));
        }
        ids.iter()
            .map(|id| {
                self.service(*id)
                    .ok_or_else(|| ApiError::BadInput(format!("unknown service {id}")))
            })
            .collect()
    }

    pub fn can_perform(&self, staff_id: i64, bundle_ids: &[i64]) -> bool {
        match self.skills.get(&staff_id) {
            Some(services) => bundle_ids.iter().all(|id| services.contains_key(id)),
            None => false,
        }
    }

    /// Active staff able to perform the whole bundle, ascending by id.
    pub fn capable_staff(&self, bundle_ids: &[i64]) -> Vec<i64> {
        let mut out: Vec<i64> = self
            .staff
            .iter()
            .filter(|s| self.can_perform(s.id, bundle_ids))
            .map(|s| s.id)
            .collect();
        out.sort_unstable();
        out
    }

    /// Effective bundle duration in minutes. With a staff member the
    /// per-service speed applies; without one, base durations are summed.
    pub fn effective_duration_min(
        &self,
        staff_id: Option<i64>,
        bundle: &[&Service],
    ) -> Result<i64, ApiError> {
        match staff_id {
            None => Ok(bundle.iter().map(|s| s.duration_min).sum()),
            Some(id) => {
                let skills = self.skills.get(&id).ok_or(ApiError::NoSkillMatch)?;
                bundle
                    .iter()
                    .map(|s| {
                        skills
                            .get(&s.id)
                            .map(|pct| scaled_duration(s.duration_min, *pct))
                            .ok_or(ApiError::NoSkillMatch)
                    })
                    .sum()
            }
        }
    }

    /// Working windows and breaks for a staff member on a weekday
    /// (0 = Monday), as minutes from local midnight.
    pub fn day_schedule(&self, staff_id: i64, weekday: i16) -> (Vec<(i32, i32)>, Vec<(i32, i32)>) {
        let windows = self
            .windows
            .get(&staff_id)
            .map(|ws| {
                ws.iter()
                    .filter(|w| w.weekday == weekday)
                    .map(|w| (w.open_min, w.close_min))
                    .collect()
            })
            .unwrap_or_default();
        let breaks = self
            .breaks
            .get(&staff_id)
            .map(|bs| {
                bs.iter()
                    .filter(|b| b.weekday == weekday)
                    .map(|b| (b.start_min, b.end_min))
                    .collect()
            })
            .unwrap_or_default();
        (windows, breaks)
    }
}

/// Per-staff duration scaling in integer arithmetic, rounded to the
/// nearest minute, never below one minute.
pub fn scaled_duration(duration_min: i64, speed_percent: i32) -> i64 {
    ((duration_min * speed_percent as i64 + 50) / 100).max(1)
}

/// TTL-cached catalog loader. `invalidate` is wired to the
/// CatalogInvalidated admin flow.
pub struct Catalog {
    db: PgPool,
    ttl: Duration,
    cached: RwLock<Option<(Instant, Arc<CatalogSnapshot>)>>,
}

impl Catalog {
    pub fn new(db: PgPool, ttl: Duration) -> Self {
        Self {
            db,
            ttl,
            cached: RwLock::new(None),
        }
    }

    pub async fn snapshot(&self) -> Result<Arc<CatalogSnapshot>, ApiError> {
        {
            let guard = self.cached.read().await;
            if let Some((loaded_at, snapshot)) = guard.as_ref() {
                if loaded_at.elapsed() < self.ttl {
                    return Ok(snapshot.clone());
                }
            }
        }

        let snapshot = Arc::new(self.load().await?);
        *self.cached.write().await = Some((Instant::now(), snapshot.clone()));
        Ok(snapshot)
    }

    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
        tracing::info!("catalog cache invalidated");
    }

    async fn load(&self) -> Result<CatalogSnapshot, ApiError> {
        let services = sqlx::query_as::<_, Service>(
            "SELECT id, name, duration_min, price_minor, currency, is_active, sort_order
             FROM services WHERE is_active = TRUE ORDER BY sort_order ASC, id ASC",
        )
        .fetch_all(&self.db)
        .await?;

        let staff = sqlx::query_as::<_, Staff>(
            "SELECT id, name, is_active FROM staff WHERE is_active = TRUE ORDER BY id ASC",
        )
        .fetch_all(&self.db)
        .await?;

        let junction = sqlx::query_as::<_, (i64, i64, i32)>(
            "SELECT staff_id, service_id, speed_percent FROM staff_services",
        )
        .fetch_all(&self.db)
        .await?;

        let mut skills: HashMap<i64, HashMap<i64, i32>> = HashMap::new();
        for (staff_id, service_id, speed_percent) in junction {
            skills
                .entry(staff_id)
                .or_default()
                .insert(service_id, speed_percent);
        }

        let window_rows = sqlx::query_as::<_, WorkingWindow>(
            "SELECT staff_id, weekday, open_min, close_min FROM working_windows
             ORDER BY staff_id, weekday, open_min",
        )
        .fetch_all(&self.db)
        .await?;

        let mut windows: HashMap<i64, Vec<WorkingWindow>> = HashMap::new();
        for row in window_rows {
            windows.entry(row.staff_id).or_default().push(row);
        }

        let break_rows = sqlx::query_as::<_, BreakWindow>(
            "SELECT staff_id, weekday, start_min, end_min FROM breaks
             ORDER BY staff_id, weekday, start_min",
        )
        .fetch_all(&self.db)
        .await?;

        let mut breaks: HashMap<i64, Vec<BreakWindow>> = HashMap::new();
        for row in break_rows {
            breaks.entry(row.staff_id).or_default().push(row);
        }

        tracing::debug!(
            services = services.len(),
            staff = staff.len(),
            "catalog snapshot loaded"
        );

        Ok(CatalogSnapshot {
            services,
            staff,
            skills,
            windows,
            breaks,
        })
    }
}

// ── Test fixture ──

/// Small catalog shared by unit tests across modules: two staff, two
/// services; staff 1 performs both (service 11 at double speed), staff 2
/// performs only service 10, half again slower.
#[cfg(test)]
pub(crate) fn snapshot_fixture() -> CatalogSnapshot {
    fn make_service(id: i64, duration_min: i64, price_minor: i64) -> Service {
        Service {
            id,
            name: format!("service-{id}"),
            duration_min,
            price_minor,
            currency: "UAH".into(),
            is_active: true,
            sort_order: id,
        }
    }

    let mut skills: HashMap<i64, HashMap<i64, i32>> = HashMap::new();
    skills.insert(1, HashMap::from([(10, 100), (11, 50)]));
    skills.insert(2, HashMap::from([(10, 150)]));
    CatalogSnapshot {
        services: vec![make_service(10, 60, 80_000), make_service(11, 30, 40_000)],
        staff: vec![
            Staff {
                id: 1,
                name: "Alla".into(),
                is_active: true,
            },
            Staff {
                id: 2,
                name: "Vira".into(),
                is_active: true,
            },
        ],
        skills,
        windows: HashMap::new(),
        breaks: HashMap::new(),
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn make_snapshot() -> CatalogSnapshot {
        snapshot_fixture()
    }

    #[test]
    fn test_scaled_duration_rounds_to_nearest() {
        assert_eq!(scaled_duration(60, 100), 60);
        assert_eq!(scaled_duration(60, 50), 30);
        assert_eq!(scaled_duration(60, 150), 90);
        assert_eq!(scaled_duration(45, 110), 50); // 49.5 → 50
        assert_eq!(scaled_duration(45, 109), 49); // 49.05 → 49
    }

    #[test]
    fn test_scaled_duration_floors_at_one_minute() {
        assert_eq!(scaled_duration(1, 10), 1);
    }

    #[test]
    fn test_resolve_bundle_rejects_empty() {
        let snap = make_snapshot();
        assert!(matches!(
            snap.resolve_bundle(&[]),
            Err(ApiError::BadInput(_))
        ));
    }

    #[test]
    fn test_resolve_bundle_rejects_unknown() {
        let snap = make_snapshot();
        assert!(matches!(
            snap.resolve_bundle(&[10, 99]),
            Err(ApiError::BadInput(_))
        ));
    }

    #[test]
    fn test_resolve_bundle_preserves_order() {
        let snap = make_snapshot();
        let bundle = snap.resolve_bundle(&[11, 10]).unwrap();
        assert_eq!(bundle[0].id, 11);
        assert_eq!(bundle[1].id, 10);
    }

    #[test]
    fn test_can_perform_requires_all_services() {
        let snap = make_snapshot();
        assert!(snap.can_perform(1, &[10, 11]));
        assert!(snap.can_perform(2, &[10]));
        assert!(!snap.can_perform(2, &[10, 11]));
        assert!(!snap.can_perform(3, &[10]));
    }

    #[test]
    fn test_capable_staff_sorted() {
        let snap = make_snapshot();
        assert_eq!(snap.capable_staff(&[10]), vec![1, 2]);
        assert_eq!(snap.capable_staff(&[10, 11]), vec![1]);
    }

    #[test]
    fn test_effective_duration_applies_speed() {
        let snap = make_snapshot();
        let bundle = snap.resolve_bundle(&[10, 11]).unwrap();
        // staff 1: 60×1.0 + 30×0.5 = 75
        assert_eq!(snap.effective_duration_min(Some(1), &bundle).unwrap(), 75);
        // no staff: base durations
        assert_eq!(snap.effective_duration_min(None, &bundle).unwrap(), 90);
    }

    #[test]
    fn test_effective_duration_no_skill() {
        let snap = make_snapshot();
        let bundle = snap.resolve_bundle(&[10, 11]).unwrap();
        assert!(matches!(
            snap.effective_duration_min(Some(2), &bundle),
            Err(ApiError::NoSkillMatch)
        ));
    }
}
