#![forbid(unsafe_code)]

use pulse_kernel_contracts::redemption::RedemptionRecordInput;
use pulse_kernel_contracts::{Address, UnixTimeSec};
use pulse_storage::repo::RedemptionLedgerRepo;
use pulse_storage::{PulseStore, StorageError};

fn addr(n: u8) -> Address {
    Address::new(format!("0x{:040x}", n)).unwrap()
}

fn record(amount: u128, redeemed_at: u64, period_start: u64, r: &str) -> RedemptionRecordInput {
    RedemptionRecordInput::v1(
        addr(1),
        addr(0xa0),
        amount,
        r.to_string(),
        UnixTimeSec(redeemed_at),
        UnixTimeSec(period_start),
    )
    .unwrap()
}

#[test]
fn at_redemptions_db_01_sum_per_period_is_capped() {
    let mut s = PulseStore::new_in_memory();
    s.append_redemption_row(record(600, 10, 0, "tx-1"), 1_000)
        .unwrap();
    s.append_redemption_row(record(400, 11, 0, "tx-2"), 1_000)
        .unwrap();

    let err = s
        .append_redemption_row(record(1, 12, 0, "tx-3"), 1_000)
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::PeriodCapExceeded {
            already: 1_000,
            attempted: 1,
            ..
        }
    ));
    assert_eq!(s.redemption_ledger_rows().len(), 2);
    assert_eq!(
        s.redeemed_amount_in_period(&addr(1), &addr(0xa0), UnixTimeSec(0)),
        1_000
    );
}

#[test]
fn at_redemptions_db_02_periods_are_accounted_separately() {
    let mut s = PulseStore::new_in_memory();
    s.append_redemption_row(record(1_000, 10, 0, "tx-1"), 1_000)
        .unwrap();
    s.append_redemption_row(record(1_000, 100, 86_400, "tx-2"), 1_000)
        .unwrap();
    assert_eq!(
        s.redeemed_amount_in_period(&addr(1), &addr(0xa0), UnixTimeSec(86_400)),
        1_000
    );
    assert_eq!(
        s.redemption_rows_in_period(&addr(1), &addr(0xa0), UnixTimeSec(0))
            .len(),
        1
    );
}

#[test]
fn at_redemptions_db_03_user_history_is_newest_first() {
    let mut s = PulseStore::new_in_memory();
    s.append_redemption_row(record(1, 10, 0, "tx-old"), 100)
        .unwrap();
    s.append_redemption_row(record(1, 30, 0, "tx-new"), 100)
        .unwrap();
    s.append_redemption_row(record(1, 20, 0, "tx-mid"), 100)
        .unwrap();

    let refs: Vec<&str> = s
        .redemption_rows_for_user(&addr(1))
        .into_iter()
        .map(|r| r.settlement_ref.as_str())
        .collect();
    assert_eq!(refs, vec!["tx-new", "tx-mid", "tx-old"]);
    assert!(s.redemption_rows_for_user(&addr(2)).is_empty());
}

#[test]
fn at_redemptions_db_04_ids_are_sequential() {
    let mut s = PulseStore::new_in_memory();
    let a = s
        .append_redemption_row(record(1, 10, 0, "tx-1"), 100)
        .unwrap();
    let b = s
        .append_redemption_row(record(1, 11, 0, "tx-2"), 100)
        .unwrap();
    assert_eq!(a.redemption_id.0 + 1, b.redemption_id.0);
}
