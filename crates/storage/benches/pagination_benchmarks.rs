use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{Duration, Utc};
use ledgerflow_core::{Configuration, Ledger};
use ledgerflow_storage::ledger::resources::{LogRow, TransactionsHandler};
use ledgerflow_storage::query::paginate::column;
use ledgerflow_storage::query::resource::{build_page_query, normalize, resolve_initial};
use ledgerflow_storage::query::{
    ColumnPaginatedQuery, InitialPaginatedQuery, Operator, Order, QueryExpr, ResourceQuery,
    decode_cursor, encode_cursor,
};
use num_bigint::BigInt;
use serde_json::Value;

fn column_query(page_size: u64) -> ColumnPaginatedQuery<()> {
    let filter = QueryExpr::and(vec![
        QueryExpr::matches("account", "users:001"),
        QueryExpr::leaf(Operator::Gte, "timestamp", "2024-01-01T00:00:00Z"),
        QueryExpr::exists("metadata[order]", true),
    ]);
    let mut query = ColumnPaginatedQuery::new(
        InitialPaginatedQuery::new(ResourceQuery::default().with_filter(filter))
            .with_column("id")
            .with_order(Order::Desc)
            .with_page_size(page_size),
    );
    query.pagination_id = Some(BigInt::from(1_000_000));
    query.bottom = Some(BigInt::from(5_000_000));
    query
}

fn log_rows(count: usize) -> Vec<LogRow> {
    let start = Utc::now();
    (0..count)
        .map(|i| LogRow {
            id: 1_000_000 - i as i64,
            log_type: "NEW_TRANSACTION".to_string(),
            data: Value::Null,
            date: start - Duration::seconds(i as i64),
            idempotency_key: None,
            idempotency_hash: None,
            hash: None,
        })
        .collect()
}

/// Opaque cursor round trip: what every follow-up page request pays.
fn bench_cursor_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("cursor_codec");
    let query = column_query(50);
    let token = encode_cursor(&query).unwrap();

    group.bench_function("encode_column_query", |b| {
        b.iter(|| encode_cursor(black_box(&query)).unwrap());
    });
    group.bench_function("decode_column_query", |b| {
        b.iter(|| decode_cursor::<()>(black_box(&token), &[]).unwrap());
    });
    group.finish();
}

/// Trimming the look-ahead row and computing links for pages of growing size.
fn bench_column_cursor(c: &mut Criterion) {
    let mut group = c.benchmark_group("column_cursor");
    for page_size in [10u64, 50, 100] {
        let mut query = column_query(page_size);
        query.initial.column = "id".to_string();
        let rows = log_rows(page_size as usize + 1);

        group.throughput(Throughput::Elements(page_size));
        group.bench_with_input(BenchmarkId::new("build_cursor", page_size), &rows, |b, rows| {
            b.iter(|| column::build_cursor(rows.clone(), &query).unwrap());
        });
    }
    group.finish();
}

/// Filter validation, dataset building and SQL rendering of one page.
fn bench_page_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_query");
    let handler = TransactionsHandler::new(Ledger::new("main", Configuration::default()).unwrap());
    let initial = InitialPaginatedQuery::new(
        ResourceQuery::default().with_filter(QueryExpr::or(vec![
            QueryExpr::matches("source", "users:001"),
            QueryExpr::matches("metadata[kind]", "payout"),
        ])),
    )
    .with_page_size(25);

    group.bench_function("render_transactions_page", |b| {
        b.iter(|| {
            let query = resolve_initial(&handler, black_box(initial.clone())).unwrap();
            let (query, _) = normalize(&handler, query).unwrap();
            build_page_query(&handler, &query).unwrap().to_sql()
        });
    });
    group.finish();
}

criterion_group!(benches, bench_cursor_codec, bench_column_cursor, bench_page_query);
criterion_main!(benches);
