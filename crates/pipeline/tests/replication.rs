use std::sync::Arc;

use binlog_replicator_pipeline::testing::EventBuilder;
use binlog_replicator_pipeline::{
    spawn_replay_reader, AppliedEvent, Applier, EventDispatcher, MemoryApplier, PipelineShard, Position,
    ReplaySource, RowKind, SchemaRegistry, ShardConfig, SourceEvent, StaticSchemaSource,
};
use tokio_util::sync::CancellationToken;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter("binlog_replicator_pipeline=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

fn dispatcher(limit: Option<usize>) -> EventDispatcher {
    let registry = SchemaRegistry::new(Arc::new(StaticSchemaSource::new()), Some("shop".into()));
    EventDispatcher::new(registry, limit)
}

async fn run_replay(events: Vec<SourceEvent>, limit: Option<usize>) -> Arc<MemoryApplier> {
    let applier = Arc::new(MemoryApplier::new());
    PipelineShard::new(
        "replay",
        Box::new(ReplaySource::new(events)),
        dispatcher(limit),
        applier.clone(),
        ShardConfig::default(),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();
    applier
}

fn row_summary(applier: &MemoryApplier) -> Vec<(RowKind, String, i64, Position)> {
    applier
        .rows()
        .into_iter()
        .map(|row| {
            let key = row
                .primary_key_values()
                .iter()
                .map(|(column, value)| format!("{column}={value}"))
                .collect::<Vec<_>>()
                .join("&");
            (row.kind, key, row.timestamp_micros, row.position)
        })
        .collect()
}

fn large_transaction_stream() -> Vec<SourceEvent> {
    let mut b = EventBuilder::new("mysql-bin.000001");
    let mut events = vec![b.begin("shop"), b.orders_table_map()];
    for id in 0..20 {
        events.push(b.insert_orders(&[(id, "bulk")]));
    }
    events.push(b.xid(1));
    events.extend([
        b.begin("shop"),
        b.orders_table_map(),
        b.insert_orders(&[(100, "after")]),
        b.xid(2),
    ]);
    events
}

#[tokio::test]
async fn test_rewind_over_channel_source_is_transparent() {
    init_logging();
    let events = large_transaction_stream();

    let buffered = run_replay(events.clone(), None).await;

    let (source, reader) = spawn_replay_reader(events, 4);
    let rewound = Arc::new(MemoryApplier::new());
    let report = PipelineShard::new(
        "channel",
        Box::new(source),
        dispatcher(Some(5)),
        rewound.clone(),
        ShardConfig::default(),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();
    reader.await.unwrap();

    assert_eq!(report.rewinds, 1);
    assert_eq!(report.rows_applied, 21);
    assert_eq!(row_summary(&buffered), row_summary(&rewound));

    let commits = rewound
        .events()
        .iter()
        .filter(|e| matches!(e, AppliedEvent::Commit { .. }))
        .count();
    assert_eq!(commits, 2);
}

#[tokio::test]
async fn test_implicit_transaction_rewinds_from_table_map() {
    init_logging();
    let mut b = EventBuilder::new("mysql-bin.000001");
    let table_map = b.orders_table_map();
    let mut events = vec![table_map.clone()];
    for id in 0..4 {
        events.push(b.insert_orders(&[(id, "implicit")]));
    }
    events.push(b.xid(9));

    let buffered = run_replay(events.clone(), None).await;
    let rewound = run_replay(events, Some(2)).await;
    assert_eq!(row_summary(&buffered), row_summary(&rewound));

    match &rewound.events()[0] {
        AppliedEvent::Begin { position, .. } => assert_eq!(position, &table_map.position),
        other => panic!("expected begin, got {other:?}"),
    }
}

#[tokio::test]
async fn test_updates_and_deletes_keep_source_order() {
    init_logging();
    let mut b = EventBuilder::new("mysql-bin.000001");
    let events = vec![
        b.begin("shop"),
        b.orders_table_map(),
        b.insert_orders(&[(1, "a"), (2, "b")]),
        b.xid(1),
        b.begin("shop"),
        b.orders_table_map(),
        b.update_order(1, "a", "z"),
        b.delete_orders(&[(2, "b")]),
        b.xid(2),
    ];
    let applier = run_replay(events, None).await;
    let rows = applier.rows();

    let kinds: Vec<_> = rows.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        [RowKind::Insert, RowKind::Insert, RowKind::Update, RowKind::Delete]
    );
    assert!(rows.windows(2).all(|w| w[0].timestamp_micros < w[1].timestamp_micros));

    let update = &rows[2];
    assert_eq!(update.before.as_ref().unwrap()["name"], "a");
    assert_eq!(update.after.as_ref().unwrap()["name"], "z");

    let delete = &rows[3];
    assert!(delete.after.is_none());
    assert_eq!(delete.primary_key_values(), [("id", "2")]);

    assert!(rows[0].after.is_some() && rows[0].before.is_none());
    assert_ne!(rows[1].transaction_id, rows[2].transaction_id);
}

#[tokio::test]
async fn test_positions_increase_across_rotation() {
    init_logging();
    let mut b = EventBuilder::new("mysql-bin.000009");
    let mut events = vec![
        b.begin("shop"),
        b.orders_table_map(),
        b.insert_orders(&[(1, "a")]),
        b.xid(1),
    ];
    events.push(b.rotate("mysql-bin.000010"));
    events.extend([
        b.begin("shop"),
        b.orders_table_map(),
        b.insert_orders(&[(2, "b")]),
        b.xid(2),
    ]);

    let applier = run_replay(events, None).await;
    let rows = applier.rows();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].position < rows[1].position);
    assert_eq!(rows[1].position.segment, "mysql-bin.000010");

    let durable = applier.last_durable_checkpoint().unwrap();
    assert_eq!(durable.position.segment, "mysql-bin.000010");
}
