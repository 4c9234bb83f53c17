mod support;

use payquery::query::BindParam;
use serde_json::json;
use support::{payments_last_3_months, read_json, RecordedCall, TestHarness};

#[tokio::test]
async fn health_does_not_require_api_key() {
    let harness = TestHarness::new();
    let (status, body) = read_json(harness.get("/healthz").await).await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn query_requires_api_key() {
    let harness = TestHarness::new();
    let response = harness
        .post_without_api_key("/api/query", &payments_last_3_months())
        .await;
    let (status, body) = read_json(response).await;
    assert_eq!(status, http::StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");
    assert_eq!(harness.executor.call_count(), 0);
}

#[tokio::test]
async fn first_page_mints_a_token_for_large_results() {
    let harness = TestHarness::new();
    let (status, body) = harness
        .post_json("/api/query", &payments_last_3_months())
        .await;

    assert_eq!(status, http::StatusCode::OK, "unexpected body: {body}");
    assert_eq!(body["data"]["rows"].as_array().map(Vec::len), Some(10));
    assert_eq!(body["metadata"]["rowsReturned"], 10);
    assert_eq!(body["metadata"]["totalRows"], 1000);
    assert!(body["metadata"]["executionTimeMs"].is_u64());

    let pagination = &body["pagination"];
    assert_eq!(pagination["totalPages"], 100);
    assert_eq!(pagination["currentPage"], 1);
    assert_eq!(pagination["pageSize"], 10);
    assert_eq!(pagination["hasMore"], true);
    assert!(pagination["queryToken"].as_str().is_some_and(|t| !t.is_empty()));

    let calls = harness.executor.calls();
    assert_eq!(calls.len(), 2, "one count and one data query");
    let RecordedCall::Count(count) = &calls[0] else {
        panic!("count query should run first, got {calls:?}");
    };
    assert!(count
        .sql
        .contains("\"payments\".\"requested_at\" >= $1 AND \"payments\".\"requested_at\" <= $2"));
}

#[tokio::test]
async fn paging_rehydrates_the_full_original_plan() {
    let harness = TestHarness::new();
    let (_, first) = harness
        .post_json("/api/query", &payments_last_3_months())
        .await;
    let token = first["pagination"]["queryToken"].as_str().unwrap().to_string();
    let first_fetch = harness.executor.last_fetch().unwrap();

    let (status, fifth) = harness
        .post_json(
            "/api/query/page",
            &json!({"queryToken": token, "pageNumber": 5}),
        )
        .await;
    assert_eq!(status, http::StatusCode::OK, "unexpected body: {fifth}");

    let fetch = harness.executor.last_fetch().unwrap();
    assert!(
        fetch.sql.contains("WHERE \"payments\".\"requested_at\" >= $1"),
        "page query lost the time range: {}",
        fetch.sql
    );
    assert_eq!(fetch.params[..2], first_fetch.params[..2], "time bounds are frozen");
    assert_eq!(fetch.params[2], BindParam::Int(10));
    assert_eq!(fetch.params[3], BindParam::Int(40));

    let pagination = &fifth["pagination"];
    assert_eq!(pagination["currentPage"], 5);
    assert_eq!(pagination["totalRows"], 1000);
    assert_eq!(pagination["totalPages"], 100);
    assert_eq!(pagination["pageSize"], 10);
    assert_eq!(pagination["queryToken"], token.as_str());
    assert_eq!(pagination["hasMore"], true);
    assert_eq!(fifth["metadata"]["totalRows"], 1000);
    assert_eq!(fifth["data"]["rows"][0]["paymentKey"], "pk_0041");

    let (_, next) = harness
        .post_json("/api/query/page", &json!({"queryToken": token}))
        .await;
    assert_eq!(next["pagination"]["currentPage"], 6);
    assert_eq!(next["pagination"]["totalRows"], 1000);

    let (_, last) = harness
        .post_json(
            "/api/query/page",
            &json!({"queryToken": token, "pageNumber": 100}),
        )
        .await;
    assert_eq!(last["pagination"]["hasMore"], false);
}

#[tokio::test]
async fn paging_errors_are_distinct() {
    let harness = TestHarness::new();
    let (_, first) = harness
        .post_json("/api/query", &payments_last_3_months())
        .await;
    let token = first["pagination"]["queryToken"].as_str().unwrap().to_string();

    let (status, body) = harness
        .post_json(
            "/api/query/page",
            &json!({"queryToken": token, "pageNumber": 101}),
        )
        .await;
    assert_eq!(status, http::StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "PAGE_OUT_OF_RANGE");

    let (status, body) = harness
        .post_json("/api/query/page", &json!({"queryToken": "bogus"}))
        .await;
    assert_eq!(status, http::StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "INVALID_TOKEN");
}

#[tokio::test]
async fn small_results_have_no_pagination_context() {
    let harness = TestHarness::new();
    let mut plan = payments_last_3_months();
    plan["limit"] = json!(50);
    plan["filters"] = json!([
        {"field": "merchantId", "operator": "eq", "value": "mer_001"},
        {"field": "status", "operator": "eq", "value": "CANCELED"}
    ]);

    let (status, body) = harness.post_json("/api/query", &plan).await;
    assert_eq!(status, http::StatusCode::OK, "unexpected body: {body}");
    assert_eq!(body["metadata"]["totalRows"], 40);
    assert_eq!(body["data"]["rows"].as_array().map(Vec::len), Some(40));
    assert!(body.get("pagination").is_none(), "got {body}");
}

#[tokio::test]
async fn invalid_plans_never_reach_the_database() {
    let harness = TestHarness::new();
    let (status, body) = harness
        .post_json(
            "/api/query",
            &json!({
                "entity": "Invoice",
                "operation": "list",
                "limit": 5000
            }),
        )
        .await;

    assert_eq!(status, http::StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "UNKNOWN_ENTITY");
    let codes: Vec<&str> = body["details"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|detail| detail["code"].as_str())
        .collect();
    assert!(codes.contains(&"LIMIT_OUT_OF_RANGE"), "got {codes:?}");
    assert_eq!(harness.executor.call_count(), 0);
}

#[tokio::test]
async fn freeform_sql_is_gated() {
    let harness = TestHarness::new();

    for sql in [
        "DROP TABLE payments",
        "select 1; delete from payments",
        "SELECT pg_read_file('/etc/passwd')",
    ] {
        let (status, body) = harness.post_json("/api/sql", &json!({"sql": sql})).await;
        assert_eq!(status, http::StatusCode::UNPROCESSABLE_ENTITY, "{sql} -> {body}");
        assert!(body["code"].is_string());
    }
    assert_eq!(harness.executor.call_count(), 0);

    let (status, body) = harness
        .post_json(
            "/api/sql",
            &json!({"sql": "SELECT merchant_id, count(*) AS \"paymentCount\" FROM payments GROUP BY merchant_id"}),
        )
        .await;
    assert_eq!(status, http::StatusCode::OK, "unexpected body: {body}");
    assert_eq!(body["metadata"]["limitAction"], "injected");
    assert_eq!(body["metadata"]["totalRows"], 1);
    assert!(body.get("pagination").is_none());
    let executed = harness.executor.last_freeform().unwrap();
    assert!(executed.ends_with("\nLIMIT 500"), "got {executed}");
}

#[tokio::test]
async fn translate_preserves_alias_case() {
    let harness = TestHarness::new();
    let (status, body) = harness
        .post_json(
            "/api/translate",
            &json!({
                "entity": "Payment",
                "operation": "aggregate",
                "timeRange": {"preset": "last_30d"},
                "filters": [{"field": "status", "operator": "eq", "value": "DONE"}],
                "groupBy": ["merchantId"],
                "aggregations": [{"function": "sum", "field": "amount", "alias": "totalAmount"}],
                "orderBy": [{"field": "totalAmount", "direction": "desc"}],
                "limit": 5
            }),
        )
        .await;

    assert_eq!(status, http::StatusCode::OK, "unexpected body: {body}");
    let sql = body["sql"].as_str().unwrap();
    assert!(sql.contains("SUM(\"payments\".\"total_amount\") AS \"totalAmount\""), "{sql}");
    assert!(sql.contains("\"payments\".\"status\" = $3"), "{sql}");
    assert!(sql.contains("ORDER BY \"totalAmount\" DESC"), "{sql}");
    assert!(!sql.contains("totalamount"));
    assert!(body["countSql"].as_str().unwrap().contains("AS \"groups\""));
    assert_eq!(harness.executor.call_count(), 0, "translate never executes");
}
