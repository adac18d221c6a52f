#![forbid(unsafe_code)]

use pulse_kernel_contracts::grant::GrantInput;
use pulse_kernel_contracts::{Address, UnixTimeSec};
use pulse_storage::repo::GrantRepo;
use pulse_storage::{PulseStore, StorageError};

fn addr(n: u8) -> Address {
    Address::new(format!("0x{:040x}", n)).unwrap()
}

fn grant_input(user: u8, asset: Address, cap: u128, len: u64) -> GrantInput {
    GrantInput::v1(
        addr(user),
        asset,
        "0xdelegation-context".to_string(),
        "0xmanager".to_string(),
        cap,
        len,
        None,
    )
    .unwrap()
}

#[test]
fn at_grants_db_01_upsert_replaces_and_resets_anchor() {
    let mut s = PulseStore::new_in_memory();
    let asset = addr(0xa0);

    let first = s
        .upsert_grant_row(grant_input(1, asset.clone(), 1_000, 86_400), UnixTimeSec(100))
        .unwrap();
    assert_eq!(first.granted_at, UnixTimeSec(100));

    let second = s
        .upsert_grant_row(grant_input(1, asset.clone(), 5_000, 3_600), UnixTimeSec(500))
        .unwrap();
    assert_eq!(second.granted_at, UnixTimeSec(500));

    let stored = s.grant_row(&addr(1), &asset).unwrap();
    assert_eq!(stored.period_cap, 5_000);
    assert_eq!(stored.period_length_seconds, 3_600);
    assert!(stored.active);
    assert_eq!(s.active_grant_rows_for_user(&addr(1)).len(), 1);
}

#[test]
fn at_grants_db_02_deactivate_keeps_row_and_hides_it_from_active_reads() {
    let mut s = PulseStore::new_in_memory();
    let asset = addr(0xa0);
    s.upsert_grant_row(grant_input(1, asset.clone(), 1_000, 60), UnixTimeSec(10))
        .unwrap();

    let g = s
        .deactivate_grant_row(&addr(1), &asset, UnixTimeSec(20))
        .unwrap();
    assert!(!g.active);
    assert_eq!(g.updated_at, UnixTimeSec(20));
    assert!(s.grant_row(&addr(1), &asset).is_some());
    assert!(s.active_grant_rows_for_user(&addr(1)).is_empty());
    assert!(s.users_with_active_grant_rows().is_empty());
}

#[test]
fn at_grants_db_03_deactivate_missing_grant_is_not_found() {
    let mut s = PulseStore::new_in_memory();
    let err = s
        .deactivate_grant_row(&addr(1), &addr(0xa0), UnixTimeSec(20))
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound { table: "grants", .. }));
}

#[test]
fn at_grants_db_04_deactivate_all_counts_only_active_rows() {
    let mut s = PulseStore::new_in_memory();
    s.upsert_grant_row(grant_input(1, addr(0xa0), 1_000, 60), UnixTimeSec(10))
        .unwrap();
    s.upsert_grant_row(grant_input(1, Address::native_asset(), 1_000, 60), UnixTimeSec(10))
        .unwrap();
    s.upsert_grant_row(grant_input(2, addr(0xa0), 1_000, 60), UnixTimeSec(10))
        .unwrap();
    s.deactivate_grant_row(&addr(1), &addr(0xa0), UnixTimeSec(11))
        .unwrap();

    assert_eq!(
        s.deactivate_all_grant_rows(&addr(1), UnixTimeSec(12)).unwrap(),
        1
    );
    assert_eq!(s.users_with_active_grant_rows(), vec![addr(2)]);
}

#[test]
fn at_grants_db_05_users_listed_once_in_address_order() {
    let mut s = PulseStore::new_in_memory();
    s.upsert_grant_row(grant_input(3, addr(0xa0), 1, 60), UnixTimeSec(1))
        .unwrap();
    s.upsert_grant_row(grant_input(1, addr(0xa0), 1, 60), UnixTimeSec(1))
        .unwrap();
    s.upsert_grant_row(grant_input(1, addr(0xa1), 1, 60), UnixTimeSec(1))
        .unwrap();
    assert_eq!(s.users_with_active_grant_rows(), vec![addr(1), addr(3)]);
}
