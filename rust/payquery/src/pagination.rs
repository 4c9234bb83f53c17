//! Query tokens and the pagination contexts they resolve to.
//!
//! A token is opaque to clients (URL-safe base64 JSON carrying a context id and issue time) and
//! is bound to the complete validated plan it was minted for. Paging re-runs that plan with a new
//! offset and reuses the stored row count.

use crate::plan::QueryPlan;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaginationErrorCode {
    InvalidToken,
    PageOutOfRange,
}

impl PaginationErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            PaginationErrorCode::InvalidToken => "INVALID_TOKEN",
            PaginationErrorCode::PageOutOfRange => "PAGE_OUT_OF_RANGE",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            PaginationErrorCode::InvalidToken => {
                "query token is unknown or expired; re-issue the original query"
            }
            PaginationErrorCode::PageOutOfRange => "requested page is outside the result set",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationMeta {
    pub query_token: String,
    pub has_more: bool,
    pub current_page: i64,
    pub total_pages: i64,
    pub total_rows: i64,
    pub page_size: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenPayload {
    qid: Uuid,
    iat: i64,
}

pub fn encode_token(id: Uuid) -> String {
    let payload = TokenPayload {
        qid: id,
        iat: Utc::now().timestamp(),
    };
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap_or_default())
}

pub fn decode_token(token: &str) -> Result<Uuid, PaginationErrorCode> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token.trim())
        .map_err(|_| PaginationErrorCode::InvalidToken)?;
    let payload: TokenPayload =
        serde_json::from_slice(&bytes).map_err(|_| PaginationErrorCode::InvalidToken)?;
    Ok(payload.qid)
}

pub fn total_pages(total_rows: i64, page_size: i64) -> i64 {
    if total_rows <= 0 || page_size <= 0 {
        return 0;
    }
    (total_rows + page_size - 1) / page_size
}

#[derive(Debug, Clone)]
struct StoredContext {
    token: String,
    plan: QueryPlan,
    total_rows: i64,
    page_size: i64,
    total_pages: i64,
    current_page: i64,
    created_at: Instant,
    seq: u64,
}

impl StoredContext {
    fn meta(&self, page: i64) -> PaginationMeta {
        PaginationMeta {
            query_token: self.token.clone(),
            has_more: page < self.total_pages,
            current_page: page,
            total_pages: self.total_pages,
            total_rows: self.total_rows,
            page_size: self.page_size,
        }
    }
}

/// A resolved page request: the full original plan plus the window to fetch.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub id: Uuid,
    pub plan: QueryPlan,
    pub page: i64,
    pub offset: i64,
    pub meta: PaginationMeta,
}

pub struct PaginationStore {
    contexts: Mutex<HashMap<Uuid, StoredContext>>,
    ttl: Duration,
    capacity: usize,
    next_seq: AtomicU64,
}

impl PaginationStore {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Stores the context for a freshly executed first page.
    pub fn mint(&self, plan: QueryPlan, total_rows: i64, page_size: i64) -> PaginationMeta {
        let id = Uuid::new_v4();
        let context = StoredContext {
            token: encode_token(id),
            plan,
            total_rows,
            page_size,
            total_pages: total_pages(total_rows, page_size),
            current_page: 1,
            created_at: Instant::now(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let meta = context.meta(1);

        let mut contexts = self.contexts.lock();
        if contexts.len() >= self.capacity {
            let ttl = self.ttl;
            contexts.retain(|_, ctx| ctx.created_at.elapsed() < ttl);
        }
        while contexts.len() >= self.capacity {
            let oldest = contexts
                .iter()
                .min_by_key(|(_, ctx)| ctx.seq)
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => contexts.remove(&id),
                None => break,
            };
        }
        contexts.insert(id, context);
        meta
    }

    /// Resolves `page` (or the page after the current one) for a token.
    pub fn resolve(&self, token: &str, page: Option<i64>) -> Result<PageRequest, PaginationErrorCode> {
        let id = decode_token(token)?;
        let mut contexts = self.contexts.lock();

        let expired = match contexts.get(&id) {
            None => return Err(PaginationErrorCode::InvalidToken),
            Some(ctx) => ctx.created_at.elapsed() >= self.ttl,
        };
        if expired {
            contexts.remove(&id);
            return Err(PaginationErrorCode::InvalidToken);
        }

        let ctx = contexts
            .get(&id)
            .ok_or(PaginationErrorCode::InvalidToken)?;
        let page = page.unwrap_or(ctx.current_page + 1);
        if page < 1 || page > ctx.total_pages {
            return Err(PaginationErrorCode::PageOutOfRange);
        }

        Ok(PageRequest {
            id,
            plan: ctx.plan.clone(),
            page,
            offset: (page - 1) * ctx.page_size,
            meta: ctx.meta(page),
        })
    }

    /// Records that `page` was served so a later bare `page(token)` continues from it.
    pub fn mark_served(&self, id: Uuid, page: i64) {
        if let Some(ctx) = self.contexts.lock().get_mut(&id) {
            ctx.current_page = page;
        }
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Operation, QueryIntent};

    fn plan() -> QueryPlan {
        QueryPlan {
            entity: "Merchant".into(),
            operation: Operation::List,
            fields: vec![],
            filters: vec![],
            time_range: None,
            group_by: vec![],
            aggregations: vec![],
            order_by: vec![],
            limit: 10,
            query_intent: QueryIntent::NewQuery,
            preferred_render_type: None,
        }
    }

    #[test]
    fn token_round_trips_the_context_id() {
        let id = Uuid::new_v4();
        assert_eq!(decode_token(&encode_token(id)), Ok(id));
        assert_eq!(
            decode_token("not-a-token"),
            Err(PaginationErrorCode::InvalidToken)
        );
    }

    #[test]
    fn computes_total_pages() {
        assert_eq!(total_pages(1000, 10), 100);
        assert_eq!(total_pages(125, 10), 13);
        assert_eq!(total_pages(0, 10), 0);
    }

    #[test]
    fn resolves_explicit_and_next_pages() {
        let store = PaginationStore::new(Duration::from_secs(60), 10);
        let meta = store.mint(plan(), 1000, 10);
        assert_eq!(meta.current_page, 1);
        assert_eq!(meta.total_pages, 100);
        assert!(meta.has_more);

        let fifth = store.resolve(&meta.query_token, Some(5)).unwrap();
        assert_eq!(fifth.offset, 40);
        assert_eq!(fifth.meta.total_rows, 1000);
        assert_eq!(fifth.plan, plan());
        store.mark_served(fifth.id, 5);

        let next = store.resolve(&meta.query_token, None).unwrap();
        assert_eq!(next.page, 6);

        let last = store.resolve(&meta.query_token, Some(100)).unwrap();
        assert!(!last.meta.has_more);
    }

    #[test]
    fn rejects_pages_outside_the_result_set() {
        let store = PaginationStore::new(Duration::from_secs(60), 10);
        let meta = store.mint(plan(), 25, 10);
        for page in [0, -1, 4] {
            assert_eq!(
                store.resolve(&meta.query_token, Some(page)).unwrap_err(),
                PaginationErrorCode::PageOutOfRange
            );
        }
    }

    #[test]
    fn expired_or_unknown_tokens_are_invalid() {
        let expired = PaginationStore::new(Duration::ZERO, 10);
        let meta = expired.mint(plan(), 100, 10);
        assert_eq!(
            expired.resolve(&meta.query_token, Some(2)).unwrap_err(),
            PaginationErrorCode::InvalidToken
        );
        assert!(expired.is_empty());

        let store = PaginationStore::new(Duration::from_secs(60), 10);
        assert_eq!(
            store.resolve(&encode_token(Uuid::new_v4()), Some(1)).unwrap_err(),
            PaginationErrorCode::InvalidToken
        );
    }

    #[test]
    fn evicts_oldest_context_at_capacity() {
        let store = PaginationStore::new(Duration::from_secs(60), 2);
        let first = store.mint(plan(), 100, 10);
        store.mint(plan(), 100, 10);
        store.mint(plan(), 100, 10);
        assert_eq!(store.len(), 2);
        assert_eq!(
            store.resolve(&first.query_token, Some(2)).unwrap_err(),
            PaginationErrorCode::InvalidToken
        );
    }
}
