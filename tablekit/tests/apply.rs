mod common;

use bytes::Bytes;

use common::*;
use tablekit::database::{EmulatorOptions, Method};
use tablekit::{Client, Code, Mutation, RawFilter, ReadOptions, Status, TableError, Timestamp};

fn predicate() -> RawFilter {
    RawFilter(Bytes::from_static(b"family_name_regex_filter: cf"))
}

#[tokio::test]
async fn test_apply_writes_row() {
    let (emulator, table) = seeded_table(&[], EmulatorOptions::default());
    let mut m = Mutation::new();
    m.set("cf", "a", Timestamp(1_000), "one")
        .set("cf", "b", Timestamp(2_000), "two");
    assert_eq!(table.apply("r1", &m).await.unwrap(), None);
    assert_eq!(emulator.calls(Method::MutateRow), 1);

    let row = table.read_row("r1", ReadOptions::new()).await.unwrap().unwrap();
    let values: Vec<_> = row.family("cf").iter().map(|c| c.value.clone()).collect();
    assert_eq!(values, vec!["one", "two"]);
}

#[tokio::test]
async fn test_idempotent_apply_is_retried() {
    let (emulator, table) = seeded_table(&[], EmulatorOptions::default());
    emulator.fail_next(Method::MutateRow, Status::new(Code::Unavailable, "unavailable"));
    let mut m = Mutation::new();
    m.delete_row();
    table.apply("r1", &m).await.unwrap();
    assert_eq!(emulator.calls(Method::MutateRow), 2);
}

#[tokio::test]
async fn test_server_timestamped_apply_is_not_retried() {
    let (emulator, table) = seeded_table(&[], EmulatorOptions::default());
    emulator.fail_next(Method::MutateRow, Status::new(Code::Unavailable, "unavailable"));
    let mut m = Mutation::new();
    m.set("cf", "a", Timestamp::SERVER_TIME, "v");
    let err = table.apply("r1", &m).await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(emulator.calls(Method::MutateRow), 1);
}

#[tokio::test]
async fn test_conditional_apply_reports_match() {
    let (emulator, table) = seeded_table(&["present"], EmulatorOptions::default());

    let mut on_match = Mutation::new();
    on_match.set("cf", "seen", Timestamp(9_000), "yes");
    let mut on_miss = Mutation::new();
    on_miss.set("cf", "created", Timestamp(9_000), "yes");

    let m = Mutation::conditional(predicate(), Some(on_match.clone()), Some(on_miss.clone()));
    assert_eq!(table.apply("present", &m).await.unwrap(), Some(true));
    assert_eq!(table.apply("absent", &m).await.unwrap(), Some(false));
    assert_eq!(emulator.calls(Method::CheckAndMutateRow), 2);

    let absent = table.read_row("absent", ReadOptions::new()).await.unwrap().unwrap();
    assert_eq!(absent.family("cf")[0].qualifier(), b"created");
}

#[tokio::test]
async fn test_nested_conditional_is_rejected() {
    let (emulator, table) = seeded_table(&[], EmulatorOptions::default());
    let inner = Mutation::conditional(predicate(), None, None);
    let outer = Mutation::conditional(predicate(), Some(inner), None);
    let err = table.apply("r1", &outer).await.unwrap_err();
    assert!(matches!(err, TableError::InvalidArgument(_)));
    assert_eq!(emulator.calls(Method::CheckAndMutateRow), 0);
}

#[tokio::test]
async fn test_materialized_view_rejects_writes() {
    let (emulator, _table) = seeded_table(&[], EmulatorOptions::default());
    let client = Client::new(emulator.clone(), test_config()).unwrap();
    let view = client.open_materialized_view("mv");

    let mut m = Mutation::new();
    m.delete_row();
    let err = view.apply("r1", &m).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    let err = view.apply_bulk(&["r1"], &[m]).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(emulator.calls(Method::MutateRow) + emulator.calls(Method::MutateRows), 0);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let (emulator, _table) = seeded_table(&[], EmulatorOptions::default());
    let mut config = test_config();
    config.retry.multiplier = 0.5;
    let err = Client::new(emulator, config).unwrap_err();
    assert!(matches!(err, TableError::Config(_)));
}
