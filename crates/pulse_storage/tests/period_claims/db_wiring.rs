#![forbid(unsafe_code)]

use pulse_kernel_contracts::grant::{Grant, GrantInput};
use pulse_kernel_contracts::{Address, UnixTimeSec};
use pulse_storage::repo::{GrantRepo, PeriodClaimRepo, RedemptionLedgerRepo};
use pulse_storage::{PeriodClaimRequest, PulseStore, StorageError};

const LEASE: u64 = 900;

fn addr(n: u8) -> Address {
    Address::new(format!("0x{:040x}", n)).unwrap()
}

fn seeded(cap: u128, expires_at: Option<u64>) -> (PulseStore, Grant) {
    let mut s = PulseStore::new_in_memory();
    let g = s
        .upsert_grant_row(
            GrantInput::v1(
                addr(1),
                addr(0xa0),
                "0xctx".to_string(),
                "0xmgr".to_string(),
                cap,
                86_400,
                expires_at.map(UnixTimeSec),
            )
            .unwrap(),
            UnixTimeSec(0),
        )
        .unwrap();
    (s, g)
}

fn req(g: &Grant, requested: Option<u128>) -> PeriodClaimRequest {
    PeriodClaimRequest {
        user: g.user.clone(),
        asset: g.asset.clone(),
        granted_at: g.granted_at,
        period_start: UnixTimeSec(0),
        period_cap: g.period_cap,
        requested,
    }
}

#[test]
fn at_claims_db_01_second_reserve_conflicts_while_first_is_live() {
    let (mut s, g) = seeded(1_000, None);
    let claim = s
        .reserve_period_claim_row(req(&g, None), UnixTimeSec(10), LEASE)
        .unwrap();
    assert_eq!(claim.amount, 1_000);
    assert_eq!(
        s.in_flight_amount_in_period(&g.user, &g.asset, UnixTimeSec(0), UnixTimeSec(11)),
        1_000
    );

    let err = s
        .reserve_period_claim_row(req(&g, None), UnixTimeSec(11), LEASE)
        .unwrap_err();
    assert!(matches!(err, StorageError::ClaimConflict { .. }));
}

#[test]
fn at_claims_db_02_settle_records_and_exhausts_period() {
    let (mut s, g) = seeded(1_000, None);
    let claim = s
        .reserve_period_claim_row(req(&g, None), UnixTimeSec(10), LEASE)
        .unwrap();
    let rec = s
        .settle_period_claim_row(&claim, "tx-1".to_string(), UnixTimeSec(20))
        .unwrap();
    assert_eq!(rec.amount, 1_000);
    assert_eq!(rec.period_start, UnixTimeSec(0));
    assert!(s.live_period_claim_rows(UnixTimeSec(21)).is_empty());

    let err = s
        .reserve_period_claim_row(req(&g, None), UnixTimeSec(30), LEASE)
        .unwrap_err();
    assert!(matches!(err, StorageError::NothingAvailable { .. }));
}

#[test]
fn at_claims_db_03_release_reopens_period_with_same_idempotency_key() {
    let (mut s, g) = seeded(1_000, None);
    let first = s
        .reserve_period_claim_row(req(&g, None), UnixTimeSec(10), LEASE)
        .unwrap();
    assert!(s.release_period_claim_row(&first));
    assert!(!s.release_period_claim_row(&first));

    let retry = s
        .reserve_period_claim_row(req(&g, None), UnixTimeSec(15), LEASE)
        .unwrap();
    assert_ne!(first.claim_id, retry.claim_id);
    assert_eq!(first.idempotency_key, retry.idempotency_key);
    assert!(s.redemption_ledger_rows().is_empty());
}

#[test]
fn at_claims_db_04_partial_request_checks_remaining_allowance() {
    let (mut s, g) = seeded(1_000, None);
    let first = s
        .reserve_period_claim_row(req(&g, Some(300)), UnixTimeSec(10), LEASE)
        .unwrap();
    s.settle_period_claim_row(&first, "tx-1".to_string(), UnixTimeSec(11))
        .unwrap();

    let err = s
        .reserve_period_claim_row(req(&g, Some(800)), UnixTimeSec(12), LEASE)
        .unwrap_err();
    assert_eq!(
        err,
        StorageError::InsufficientAllowance {
            requested: 800,
            available: 700
        }
    );

    let second = s
        .reserve_period_claim_row(req(&g, Some(700)), UnixTimeSec(13), LEASE)
        .unwrap();
    assert_ne!(first.idempotency_key, second.idempotency_key);
}

#[test]
fn at_claims_db_05_expired_lease_can_be_reclaimed() {
    let (mut s, g) = seeded(1_000, None);
    let stale = s
        .reserve_period_claim_row(req(&g, None), UnixTimeSec(10), LEASE)
        .unwrap();
    let fresh = s
        .reserve_period_claim_row(req(&g, None), UnixTimeSec(10 + LEASE), LEASE)
        .unwrap();
    assert_ne!(stale.claim_id, fresh.claim_id);
    assert!(!s.release_period_claim_row(&stale));
    assert!(s.release_period_claim_row(&fresh));
}

#[test]
fn at_claims_db_06_stale_inactive_and_expired_grants_are_refused() {
    let (mut s, g) = seeded(1_000, Some(100));

    let mut changed = req(&g, None);
    changed.period_cap = 2_000;
    assert!(matches!(
        s.reserve_period_claim_row(changed, UnixTimeSec(10), LEASE),
        Err(StorageError::StaleGrant { .. })
    ));

    assert!(matches!(
        s.reserve_period_claim_row(req(&g, None), UnixTimeSec(100), LEASE),
        Err(StorageError::GrantExpired { .. })
    ));

    s.deactivate_grant_row(&g.user, &g.asset, UnixTimeSec(50))
        .unwrap();
    assert!(matches!(
        s.reserve_period_claim_row(req(&g, None), UnixTimeSec(60), LEASE),
        Err(StorageError::GrantInactive { .. })
    ));
}

#[test]
fn at_claims_db_07_released_partial_and_later_full_claim_do_not_share_a_key() {
    let (mut s, g) = seeded(1_000, None);
    let partial = s
        .reserve_period_claim_row(req(&g, Some(600)), UnixTimeSec(10), LEASE)
        .unwrap();
    assert!(s.release_period_claim_row(&partial));

    let full = s
        .reserve_period_claim_row(req(&g, None), UnixTimeSec(20), LEASE)
        .unwrap();
    assert_eq!(full.amount, 1_000);
    assert_ne!(partial.idempotency_key, full.idempotency_key);

    assert!(s.release_period_claim_row(&full));
    let partial_again = s
        .reserve_period_claim_row(req(&g, Some(600)), UnixTimeSec(30), LEASE)
        .unwrap();
    assert_eq!(partial.idempotency_key, partial_again.idempotency_key);
}
