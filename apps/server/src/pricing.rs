use crate::catalog::CatalogSnapshot;
use crate::error::ApiError;
use crate::models::{PaymentMethod, PricingSnapshot};
use crate::policy::Policy;

/// Build the pricing snapshot for a bundle. All arithmetic is integer on
/// minor units; the online discount is floored.
pub fn quote(
    snapshot: &CatalogSnapshot,
    policy: &Policy,
    bundle_ids: &[i64],
    staff_id: Option<i64>,
    payment_method: PaymentMethod,
    process_currency: &str,
) -> Result<PricingSnapshot, ApiError> {
    let bundle = snapshot.resolve_bundle(bundle_ids)?;

    for service in &bundle {
        if service.currency != process_currency {
            return Err(ApiError::MixedCurrency);
        }
    }

    let original_minor: i64 = bundle.iter().map(|s| s.price_minor).sum();
    let duration_min = snapshot.effective_duration_min(staff_id, &bundle)?;

    let discount_percent = online_discount_percent(policy, payment_method);
    let discount = discount_minor(original_minor, discount_percent);

    Ok(PricingSnapshot {
        original_minor,
        discount_minor: discount,
        final_minor: original_minor - discount,
        discount_percent,
        currency: process_currency.to_string(),
        duration_min,
        payment_method,
    })
}

/// Recompute the discount portion of an existing snapshot when the payment
/// method changes at finalize time (the snapshot freezes afterwards).
pub fn reprice(
    original_minor: i64,
    policy: &Policy,
    payment_method: PaymentMethod,
) -> (i64, i64, i64) {
    let percent = online_discount_percent(policy, payment_method);
    let discount = discount_minor(original_minor, percent);
    (discount, original_minor - discount, percent)
}

fn online_discount_percent(policy: &Policy, payment_method: PaymentMethod) -> i64 {
    if payment_method == PaymentMethod::Online
        && policy.online_enabled
        && policy.online_discount_percent > 0
    {
        policy.online_discount_percent
    } else {
        0
    }
}

pub fn discount_minor(original_minor: i64, percent: i64) -> i64 {
    original_minor * percent.clamp(0, 100) / 100
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::snapshot_fixture;
    use crate::policy::Policy;

    fn policy(discount: i64, enabled: bool) -> Policy {
        Policy {
            online_discount_percent: discount,
            online_enabled: enabled,
            ..Policy::test_default()
        }
    }

    #[test]
    fn test_cash_has_no_discount() {
        let snap = snapshot_fixture();
        let quote = quote(&snap, &policy(10, true), &[10, 11], Some(1), PaymentMethod::Cash, "UAH")
            .unwrap();
        assert_eq!(quote.original_minor, 120_000);
        assert_eq!(quote.discount_minor, 0);
        assert_eq!(quote.final_minor, 120_000);
        assert_eq!(quote.duration_min, 75);
    }

    #[test]
    fn test_online_discount_applies() {
        let snap = snapshot_fixture();
        let quote = quote(&snap, &policy(10, true), &[10, 11], Some(1), PaymentMethod::Online, "UAH")
            .unwrap();
        assert_eq!(quote.discount_percent, 10);
        assert_eq!(quote.discount_minor, 12_000);
        assert_eq!(quote.final_minor, 108_000);
    }

    #[test]
    fn test_online_discount_disabled() {
        let snap = snapshot_fixture();
        let quote = quote(&snap, &policy(10, false), &[10], Some(1), PaymentMethod::Online, "UAH")
            .unwrap();
        assert_eq!(quote.discount_minor, 0);
        assert_eq!(quote.final_minor, quote.original_minor);
    }

    #[test]
    fn test_discount_floors() {
        // 3% of 99 999 = 2 999.97 → floor 2 999
        assert_eq!(discount_minor(99_999, 3), 2_999);
        assert_eq!(discount_minor(0, 50), 0);
        assert_eq!(discount_minor(100, 100), 100);
    }

    #[test]
    fn test_round_trip_invariant() {
        for original in [0i64, 1, 99, 12_345, 99_999] {
            for percent in [0i64, 1, 5, 33, 100] {
                let d = discount_minor(original, percent);
                assert!(d >= 0 && d <= original);
                assert_eq!(original - d + d, original);
            }
        }
    }

    #[test]
    fn test_mixed_currency_rejected() {
        let snap = snapshot_fixture();
        let err = quote(&snap, &policy(0, false), &[10], Some(1), PaymentMethod::Cash, "EUR")
            .unwrap_err();
        assert!(matches!(err, ApiError::MixedCurrency));
    }

    #[test]
    fn test_quote_without_staff_uses_base_duration() {
        let snap = snapshot_fixture();
        let quote =
            quote(&snap, &policy(0, false), &[10, 11], None, PaymentMethod::Cash, "UAH").unwrap();
        assert_eq!(quote.duration_min, 90);
    }

    #[test]
    fn test_reprice_switches_discount() {
        let (d, f, p) = reprice(120_000, &policy(5, true), PaymentMethod::Online);
        assert_eq!((d, f, p), (6_000, 114_000, 5));
        let (d, f, p) = reprice(120_000, &policy(5, true), PaymentMethod::Cash);
        assert_eq!((d, f, p), (0, 120_000, 0));
    }
}
