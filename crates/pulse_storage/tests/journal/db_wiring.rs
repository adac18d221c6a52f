#![forbid(unsafe_code)]

use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use pulse_kernel_contracts::grant::GrantInput;
use pulse_kernel_contracts::{Address, UnixTimeSec};
use pulse_storage::repo::{GrantRepo, PeriodClaimRepo, RedemptionLedgerRepo};
use pulse_storage::{PeriodClaimRequest, PulseStore, StorageError};

fn addr(n: u8) -> Address {
    Address::new(format!("0x{:040x}", n)).unwrap()
}

fn journal_path(tag: &str) -> PathBuf {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!(
        "pulse_storage_journal_{tag}_{}_{seed}.jsonl",
        std::process::id()
    ))
}

fn grant_input(cap: u128) -> GrantInput {
    GrantInput::v1(
        addr(1),
        addr(0xa0),
        "0xctx".to_string(),
        "0xmgr".to_string(),
        cap,
        86_400,
        None,
    )
    .unwrap()
}

#[test]
fn at_journal_db_01_replay_restores_grants_and_ledger() {
    let path = journal_path("replay");
    {
        let mut s = PulseStore::open_with_journal(&path).unwrap();
        let g = s.upsert_grant_row(grant_input(1_000), UnixTimeSec(5)).unwrap();
        let claim = s
            .reserve_period_claim_row(
                PeriodClaimRequest {
                    user: g.user.clone(),
                    asset: g.asset.clone(),
                    granted_at: g.granted_at,
                    period_start: g.granted_at,
                    period_cap: g.period_cap,
                    requested: Some(400),
                },
                UnixTimeSec(10),
                900,
            )
            .unwrap();
        s.settle_period_claim_row(&claim, "tx-1".to_string(), UnixTimeSec(12))
            .unwrap();
        s.upsert_grant_row(
            GrantInput::v1(
                addr(1),
                Address::native_asset(),
                "0xctx".to_string(),
                "0xmgr".to_string(),
                7,
                60,
                None,
            )
            .unwrap(),
            UnixTimeSec(20),
        )
        .unwrap();
        s.deactivate_grant_row(&addr(1), &Address::native_asset(), UnixTimeSec(30))
            .unwrap();
    }

    let reopened = PulseStore::open_with_journal(&path).unwrap();
    let g = reopened.grant_row(&addr(1), &addr(0xa0)).unwrap();
    assert_eq!(g.period_cap, 1_000);
    assert_eq!(g.granted_at, UnixTimeSec(5));
    assert_eq!(
        reopened.redeemed_amount_in_period(&addr(1), &addr(0xa0), UnixTimeSec(5)),
        400
    );
    assert_eq!(reopened.redemption_ledger_rows().len(), 1);
    assert!(
        !reopened
            .grant_row(&addr(1), &Address::native_asset())
            .unwrap()
            .active
    );
    assert!(reopened.live_period_claim_rows(UnixTimeSec(13)).is_empty());

    let _ = fs::remove_file(&path);
}

#[test]
fn at_journal_db_02_redemption_ids_continue_after_replay() {
    let path = journal_path("ids");
    let first_id = {
        let mut s = PulseStore::open_with_journal(&path).unwrap();
        s.upsert_grant_row(grant_input(1_000), UnixTimeSec(0)).unwrap();
        s.append_redemption_row(
            pulse_kernel_contracts::redemption::RedemptionRecordInput::v1(
                addr(1),
                addr(0xa0),
                10,
                "tx-1".to_string(),
                UnixTimeSec(1),
                UnixTimeSec(0),
            )
            .unwrap(),
            1_000,
        )
        .unwrap()
        .redemption_id
    };

    let mut s = PulseStore::open_with_journal(&path).unwrap();
    let next = s
        .append_redemption_row(
            pulse_kernel_contracts::redemption::RedemptionRecordInput::v1(
                addr(1),
                addr(0xa0),
                10,
                "tx-2".to_string(),
                UnixTimeSec(2),
                UnixTimeSec(0),
            )
            .unwrap(),
            1_000,
        )
        .unwrap();
    assert!(next.redemption_id > first_id);

    let _ = fs::remove_file(&path);
}

#[test]
fn at_journal_db_03_corrupt_line_fails_open() {
    let path = journal_path("corrupt");
    fs::write(&path, "{not json}\n").unwrap();
    let err = PulseStore::open_with_journal(&path).unwrap_err();
    match err {
        StorageError::Journal(msg) => assert!(msg.contains("line 1")),
        other => panic!("unexpected error: {other:?}"),
    }
    let _ = fs::remove_file(&path);
}
