//! End-to-end bank-account scenarios against the in-memory event log.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use eventweave::{
    AggregateConfig, CommandConfig, Emit, Error, EventConfig, EventLog, EventStoreConfig, JsonKind,
    MemoryLog, ObjectSchema, PendingEvent, Registry, StreamId, SubscriptionConfig, Version,
};
use serde_json::{Value, json};

/// Poll `cond` for up to two seconds before failing the test.
async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within 2s");
}

fn bank_registry() -> Registry {
    let registry = Registry::new();

    registry.define_aggregate(
        AggregateConfig::new("bank-account", "account-id").with_schema(
            ObjectSchema::new()
                .required("account-id", JsonKind::String)
                .required("balance", JsonKind::Number),
        ),
    );

    registry.define_command(
        CommandConfig::new("open-account", "bank-account", |_state, data| {
            Ok(Emit::event(
                "account-opened",
                json!({
                    "account-id": data["account-id"],
                    "account-type": data["account-type"],
                    "balance": 0.0,
                }),
            ))
        })
        .emits(EventConfig::new("account-opened")),
    );

    registry.define_command(
        CommandConfig::new("deposit-money", "bank-account", |_state, data| {
            Ok(Emit::event(
                "money-deposited",
                json!({
                    "account-id": data["account-id"],
                    "amount": data["amount"],
                }),
            ))
        })
        .with_schema(
            ObjectSchema::new()
                .required("account-id", JsonKind::String)
                .required("amount", JsonKind::Number),
        )
        .emits(EventConfig::new("money-deposited")),
    );

    registry.define_command(
        CommandConfig::new("change-account-type", "bank-account", |state, data| {
            if state["bank-account"]["account-type"] == data["account-type"] {
                return Ok(Emit::Nothing);
            }
            Ok(Emit::event(
                "account-type-changed",
                json!({
                    "account-id": data["account-id"],
                    "account-type": data["account-type"],
                }),
            ))
        })
        .emits(EventConfig::new("account-type-changed")),
    );

    registry.register_reducer("money-deposited", |state, event| {
        let balance =
            state["balance"].as_f64().unwrap_or(0.0) + event["amount"].as_f64().unwrap_or(0.0);
        let mut next = state;
        if let Value::Object(map) = &mut next {
            map.insert("balance".into(), json!(balance));
        }
        next
    });

    registry
}

async fn open_account(registry: &Registry) -> String {
    let events = registry
        .dispatch("open-account", json!({"account-type": "checking"}))
        .await
        .expect("open-account should succeed");
    events[0].data["account-id"]
        .as_str()
        .expect("account id should be a string")
        .to_owned()
}

#[tokio::test]
async fn open_account_creates_state_at_version_one() {
    let registry = bank_registry();
    registry
        .start("bank", EventStoreConfig::Memory)
        .await
        .expect("start should succeed");

    let events = registry
        .dispatch("open-account", json!({"account-type": "checking"}))
        .await
        .expect("open-account should succeed");

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "account-opened");
    assert_eq!(events[0].meta.version.to_string(), "1-0");

    let account_id = events[0].data["account-id"]
        .as_str()
        .expect("account id should be a string");
    assert_eq!(events[0].data["account-type"], "checking");
    assert_eq!(events[0].data["balance"], 0.0);

    let state = registry
        .get_aggregate("bank-account", account_id)
        .await
        .expect("get_aggregate should succeed");
    assert_eq!(
        state,
        json!({
            "account-id": account_id,
            "account-type": "checking",
            "balance": 0.0,
        })
    );
}

#[tokio::test]
async fn deposit_with_custom_reducer_updates_balance() {
    let registry = bank_registry();
    registry
        .start("bank", EventStoreConfig::Memory)
        .await
        .expect("start should succeed");
    let account_id = open_account(&registry).await;

    let events = registry
        .dispatch(
            "deposit-money",
            json!({"account-id": account_id, "amount": 25.17}),
        )
        .await
        .expect("deposit should succeed");
    assert_eq!(events[0].meta.version.to_string(), "2-0");

    let state = registry
        .get_aggregate("bank-account", &account_id)
        .await
        .expect("get_aggregate should succeed");
    assert_eq!(state["balance"], 25.17);
    // The reducer adjusts the balance; the raw amount is not merged in.
    assert!(state.get("amount").is_none());
}

#[tokio::test]
async fn duplicate_txn_id_appends_exactly_once() {
    let log = MemoryLog::new();
    let stream = StreamId::new("bank", "bank-account", "a-1");
    let event = PendingEvent {
        event_type: "account-opened".into(),
        data: json!({"balance": 0.0}),
    };

    let first = log
        .append(&stream, "txn1", Version::initial(), vec![event.clone()])
        .await
        .expect("first append should succeed");

    let second = log
        .append(&stream, "txn1", Version::initial(), vec![event])
        .await
        .expect("replayed append should succeed");
    assert_eq!(second, first, "replay returns the stored batch");

    let events = log
        .read(&stream, Version::initial(), None)
        .await
        .expect("read should succeed");
    assert_eq!(events.len(), 1, "stream grew by exactly one");
}

#[tokio::test]
async fn concurrent_deposits_from_same_version_conflict() {
    let registry = bank_registry();
    let log: Arc<dyn EventLog> = Arc::new(MemoryLog::new());
    registry
        .start("bank", EventStoreConfig::Log(log.clone()))
        .await
        .expect("start should succeed");
    let account_id = open_account(&registry).await;

    // Both writers derive their append from the same observed version.
    let stream = StreamId::new("bank", "bank-account", &account_id);
    let observed = Version { base: 1, batch: 0 };
    let deposit = |txn: &str| PendingEvent {
        event_type: "money-deposited".into(),
        data: json!({"account-id": account_id, "amount": 10.0, "txn": txn}),
    };

    let winner = log
        .append(&stream, "txn-a", observed, vec![deposit("a")])
        .await;
    let loser = log
        .append(&stream, "txn-b", observed, vec![deposit("b")])
        .await;

    assert_eq!(winner.expect("first writer should win").len(), 1);
    match loser.expect_err("second writer should conflict") {
        Error::Concurrency { stream: s } => assert_eq!(s, stream.as_str()),
        other => panic!("expected Concurrency, got: {other}"),
    }

    // No partial write from the losing append.
    let events = log
        .read(&stream, Version::initial(), None)
        .await
        .expect("read should succeed");
    assert_eq!(events.len(), 2);

    // The caller-side retry: re-dispatch observes the new head and wins.
    let retried = registry
        .dispatch(
            "deposit-money",
            json!({"account-id": account_id, "amount": 5.0}),
        )
        .await
        .expect("retry should succeed");
    assert_eq!(retried[0].meta.version.to_string(), "3-0");
}

#[tokio::test]
async fn no_op_command_returns_empty_and_leaves_stream_alone() {
    let registry = bank_registry();
    registry
        .start("bank", EventStoreConfig::Memory)
        .await
        .expect("start should succeed");
    let account_id = open_account(&registry).await;

    let events = registry
        .dispatch(
            "change-account-type",
            json!({"account-id": account_id, "account-type": "checking"}),
        )
        .await
        .expect("no-op dispatch should succeed");
    assert!(events.is_empty());

    // The stream head is unchanged: the next append still lands at 2-0.
    let deposit = registry
        .dispatch(
            "deposit-money",
            json!({"account-id": account_id, "amount": 1.0}),
        )
        .await
        .expect("deposit should succeed");
    assert_eq!(deposit[0].meta.version.to_string(), "2-0");
}

#[tokio::test]
async fn actual_type_change_emits_an_event() {
    let registry = bank_registry();
    registry
        .start("bank", EventStoreConfig::Memory)
        .await
        .expect("start should succeed");
    let account_id = open_account(&registry).await;

    let events = registry
        .dispatch(
            "change-account-type",
            json!({"account-id": account_id, "account-type": "savings"}),
        )
        .await
        .expect("dispatch should succeed");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "account-type-changed");

    let state = registry
        .get_aggregate("bank-account", &account_id)
        .await
        .expect("get_aggregate should succeed");
    assert_eq!(state["account-type"], "savings");
}

#[tokio::test]
async fn latest_subscriber_ignores_deposits_before_start() {
    let registry = bank_registry();
    let log: Arc<dyn EventLog> = Arc::new(MemoryLog::new());

    // First session: two deposits, no subscription attached yet.
    registry
        .start("bank", EventStoreConfig::Log(log.clone()))
        .await
        .expect("start should succeed");
    let account_id = open_account(&registry).await;
    for _ in 0..2 {
        registry
            .dispatch(
                "deposit-money",
                json!({"account-id": account_id, "amount": 10.0}),
            )
            .await
            .expect("deposit should succeed");
    }
    registry.stop().await.expect("stop should succeed");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    registry
        .define_subscription(
            "money-deposited",
            SubscriptionConfig::new("deposit-notify", move |event| {
                sink.lock().unwrap().push(event.data.clone());
                Ok(())
            })
            .from_latest(),
        )
        .expect("subscription should register");

    // Second session: the subscriber attaches at the stream tail.
    registry
        .start("bank", EventStoreConfig::Log(log))
        .await
        .expect("restart should succeed");
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(
        seen.lock().unwrap().is_empty(),
        "no past deposit may be delivered"
    );

    registry
        .dispatch(
            "deposit-money",
            json!({"account-id": account_id, "amount": 42.0}),
        )
        .await
        .expect("deposit should succeed");

    wait_for(|| seen.lock().unwrap().len() == 1).await;
    assert_eq!(seen.lock().unwrap()[0]["amount"], 42.0);
}

#[tokio::test]
async fn origin_subscriber_replays_every_deposit() {
    let registry = bank_registry();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    registry
        .define_subscription(
            "money-deposited",
            SubscriptionConfig::new("deposit-ledger", move |event| {
                sink.lock().unwrap().push(event.data["amount"].clone());
                Ok(())
            }),
        )
        .expect("subscription should register");

    registry
        .start("bank", EventStoreConfig::Memory)
        .await
        .expect("start should succeed");
    let account_id = open_account(&registry).await;

    for amount in [1.0, 2.0, 3.0] {
        registry
            .dispatch(
                "deposit-money",
                json!({"account-id": account_id, "amount": amount}),
            )
            .await
            .expect("deposit should succeed");
    }

    // Every deposit reaches the subscriber at least once, in order; the
    // account-opened event is filtered out by type.
    wait_for(|| seen.lock().unwrap().len() == 3).await;
    assert_eq!(*seen.lock().unwrap(), vec![json!(1.0), json!(2.0), json!(3.0)]);
}

#[tokio::test]
async fn multi_event_command_appends_one_atomic_batch() {
    let registry = bank_registry();
    registry.define_command(
        CommandConfig::new("open-with-deposit", "bank-account", |_state, data| {
            Ok(Emit::Events(vec![
                (
                    "account-opened".into(),
                    json!({
                        "account-id": data["account-id"],
                        "account-type": data["account-type"],
                        "balance": 0.0,
                    }),
                ),
                (
                    "money-deposited".into(),
                    json!({
                        "account-id": data["account-id"],
                        "amount": data["amount"],
                    }),
                ),
            ]))
        })
        .emits(EventConfig::new("account-opened"))
        .emits(EventConfig::new("money-deposited")),
    );
    registry
        .start("bank", EventStoreConfig::Memory)
        .await
        .expect("start should succeed");

    let events = registry
        .dispatch(
            "open-with-deposit",
            json!({"account-type": "savings", "amount": 100.0}),
        )
        .await
        .expect("dispatch should succeed");

    // One append, one base, batch indexes in emission order.
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].meta.version.to_string(), "1-0");
    assert_eq!(events[1].meta.version.to_string(), "1-1");

    let account_id = events[0].data["account-id"]
        .as_str()
        .expect("account id should be a string");
    let state = registry
        .get_aggregate("bank-account", account_id)
        .await
        .expect("get_aggregate should succeed");
    assert_eq!(state["balance"], 100.0);
    assert_eq!(state["account-type"], "savings");
}

#[tokio::test]
async fn rehydration_is_pure_between_appends() {
    let registry = bank_registry();
    registry
        .start("bank", EventStoreConfig::Memory)
        .await
        .expect("start should succeed");
    let account_id = open_account(&registry).await;
    registry
        .dispatch(
            "deposit-money",
            json!({"account-id": account_id, "amount": 7.5}),
        )
        .await
        .expect("deposit should succeed");

    let first = registry
        .get_aggregate("bank-account", &account_id)
        .await
        .expect("first rehydration should succeed");
    let second = registry
        .get_aggregate("bank-account", &account_id)
        .await
        .expect("second rehydration should succeed");
    assert_eq!(first, second);
}

#[tokio::test]
async fn command_input_schema_rejects_bad_deposits() {
    let registry = bank_registry();
    registry
        .start("bank", EventStoreConfig::Memory)
        .await
        .expect("start should succeed");
    let account_id = open_account(&registry).await;

    let err = registry
        .dispatch(
            "deposit-money",
            json!({"account-id": account_id, "amount": "lots"}),
        )
        .await
        .expect_err("bad deposit should fail");
    match err {
        Error::CommandInvalid { command, explain } => {
            assert_eq!(command, "deposit-money");
            assert_eq!(explain[0]["field"], "amount");
        }
        other => panic!("expected CommandInvalid, got: {other}"),
    }
}
