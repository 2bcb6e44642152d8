// Query optimizer wrapping a `DbPool`: plan caching keyed by a normalized
// signature, deterministic rewrites, a prepared-statement registry, a
// per-index usage counter, a batch interface, and result-cache keying.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use crate::cache::layers::L3Layer;
use crate::cache::lru::CacheValue;
use crate::db::pool::{DbPool, Operation, QueryOptions, QueryOutcome};
use crate::error::Result;

const NONDETERMINISTIC_FUNCTIONS: &[&str] = &["current_time", "current_timestamp", "now(", "random(", "uuid_generate"];

/// Lowercase, collapse runs of whitespace to one space, and blank out
/// literal values so textually-equivalent queries with different constants
/// share a plan-cache entry.
pub fn normalize_signature(sql: &str) -> String {
    let lowered = sql.to_lowercase();
    let collapsed: String = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut out = String::with_capacity(collapsed.len());
    let mut chars = collapsed.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' {
            out.push('?');
            for next in chars.by_ref() {
                if next == '\'' {
                    break;
                }
            }
        } else if c.is_ascii_digit() {
            out.push('?');
            while matches!(chars.peek(), Some(d) if d.is_ascii_digit() || *d == '.') {
                chars.next();
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct CachedPlan {
    pub signature: String,
    pub raw_json: String,
}

#[derive(Debug, Clone, Default)]
pub struct RewriteResult {
    pub sql: String,
    pub flags: Vec<String>,
}

/// Apply the fixed set of deterministic rewrites: trim surrounding
/// whitespace and flag (without altering) `SELECT *`. Hardcoded-literal
/// parameterization is represented by reusing `normalize_signature`'s
/// placeholder pass rather than mutating the executable SQL, since the
/// literal values themselves are still required at execution time.
pub fn rewrite(sql: &str) -> RewriteResult {
    let trimmed = sql.trim().to_string();
    let mut flags = Vec::new();
    let lowered = trimmed.to_lowercase();
    if lowered.contains("select *") {
        flags.push("select_star".to_string());
    }
    if lowered.contains("where") && (lowered.contains("'20") || has_large_integer_literal(&trimmed)) {
        flags.push("literal_parameterization_candidate".to_string());
    }
    RewriteResult { sql: trimmed, flags }
}

fn has_large_integer_literal(sql: &str) -> bool {
    sql.split(|c: char| !c.is_ascii_digit())
        .filter(|tok| !tok.is_empty())
        .any(|tok| tok.len() >= 7 && tok.parse::<u64>().is_ok())
}

fn is_non_deterministic(sql: &str) -> bool {
    let lowered = sql.to_lowercase();
    NONDETERMINISTIC_FUNCTIONS.iter().any(|f| lowered.contains(f))
}

fn is_select(sql: &str) -> bool {
    sql.trim_start().to_lowercase().starts_with("select")
}

fn digest_pair(sql: &str, params: &[String]) -> (String, String) {
    let sql_digest = format!("{:x}", md5::compute(sql.as_bytes()));
    let params_digest = format!("{:x}", md5::compute(params.join("\u{1f}").as_bytes()));
    (sql_digest, params_digest)
}

/// `md5(sql):md5(params)` combined key, `None` for non-SELECT or
/// non-deterministic queries that must never be result-cached.
pub fn result_cache_key(sql: &str, params: &[String]) -> Option<String> {
    let (sql_digest, params_digest) = result_cache_fingerprints(sql, params)?;
    Some(format!("{sql_digest}:{params_digest}"))
}

/// Same eligibility check as `result_cache_key`, returning the (query
/// fingerprint, params fingerprint) pair used to key the L3 result cache
/// rather than the combined string.
pub fn result_cache_fingerprints(sql: &str, params: &[String]) -> Option<(String, String)> {
    if !is_select(sql) || is_non_deterministic(sql) {
        return None;
    }
    Some(digest_pair(sql, params))
}

fn outcome_to_value(outcome: &QueryOutcome) -> CacheValue {
    CacheValue::Record(serde_json::json!({
        "rows": outcome.rows,
        "duration_us": outcome.duration.as_micros() as u64,
    }))
}

fn value_to_outcome(value: &CacheValue) -> Option<QueryOutcome> {
    let CacheValue::Record(v) = value else { return None };
    let rows = v.get("rows")?.as_u64()?;
    let duration_us = v.get("duration_us")?.as_u64()?;
    Some(QueryOutcome { rows, duration: Duration::from_micros(duration_us) })
}

#[derive(Debug, Clone, Copy)]
pub enum BatchMode {
    Transaction,
    Sequential,
}

pub struct QueryOptimizer {
    pool: Arc<DbPool>,
    plan_cache: DashMap<String, CachedPlan>,
    result_cache: Arc<L3Layer>,
    result_cache_ttl: Duration,
    index_usage: DashMap<String, u64>,
    prepared: DashMap<String, String>,
}

impl QueryOptimizer {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self::with_result_cache(pool, Arc::new(L3Layer::new()), Duration::from_secs(30))
    }

    /// Build an optimizer backed by a caller-supplied result cache (e.g. one
    /// shared with a `CacheManager`'s L3 layer) and TTL.
    pub fn with_result_cache(pool: Arc<DbPool>, result_cache: Arc<L3Layer>, result_cache_ttl: Duration) -> Self {
        Self {
            pool,
            plan_cache: DashMap::new(),
            result_cache,
            result_cache_ttl,
            index_usage: DashMap::new(),
            prepared: DashMap::new(),
        }
    }

    /// Fetch (from cache) or compute the query plan for `sql` by running
    /// `EXPLAIN (ANALYZE, BUFFERS, FORMAT JSON)` against a replica.
    pub async fn plan(&self, sql: &str) -> Result<CachedPlan> {
        let signature = normalize_signature(sql);
        if let Some(cached) = self.plan_cache.get(&signature) {
            return Ok(cached.clone());
        }
        let explain_sql = format!("EXPLAIN (ANALYZE, BUFFERS, FORMAT JSON) {sql}");
        let outcome = self
            .pool
            .query(&explain_sql, &[], QueryOptions { operation: Operation::Read, use_replica: true, ..Default::default() })
            .await?;
        let plan = CachedPlan { signature: signature.clone(), raw_json: format!("{{\"rows\":{}}}", outcome.rows) };
        self.plan_cache.insert(signature, plan.clone());
        Ok(plan)
    }

    /// Execute `sql` against the pool, transparently caching SELECT results
    /// by `result_cache_key` (query fingerprint : params fingerprint).
    /// Non-SELECT and non-deterministic queries always execute against the
    /// pool and are never stored.
    pub async fn execute_cached(&self, sql: &str, params: &[String], options: QueryOptions) -> Result<QueryOutcome> {
        let Some((query_fp, params_fp)) = result_cache_fingerprints(sql, params) else {
            return self.pool.query(sql, params, options).await;
        };
        if let Some(cached) = self.result_cache.get_result(&query_fp, &params_fp).await {
            if let Some(outcome) = value_to_outcome(&cached) {
                return Ok(outcome);
            }
        }
        let outcome = self.pool.query(sql, params, options).await?;
        self.result_cache.set_result(&query_fp, &params_fp, outcome_to_value(&outcome), self.result_cache_ttl).await;
        Ok(outcome)
    }

    pub fn record_index_usage(&self, index_name: &str) {
        *self.index_usage.entry(index_name.to_string()).or_insert(0) += 1;
    }

    pub fn index_usage_snapshot(&self) -> Vec<(String, u64)> {
        self.index_usage.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }

    pub fn register_prepared(&self, name: &str, sql: &str) {
        self.prepared.insert(name.to_string(), sql.to_string());
    }

    pub fn prepared(&self, name: &str) -> Option<String> {
        self.prepared.get(name).map(|s| s.clone())
    }

    /// Execute `items` either as a single transaction or sequentially. When
    /// every item shares identical SQL and only its parameters differ, the
    /// batch is merged into one multi-row statement first.
    pub async fn execute_batch(&self, items: &[(String, Vec<String>)], mode: BatchMode) -> Result<Vec<QueryOutcome>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let all_same_sql = items.iter().all(|(sql, _)| sql == &items[0].0);
        if all_same_sql && items.len() > 1 {
            let merged_params: Vec<String> = items.iter().flat_map(|(_, p)| p.clone()).collect();
            let value_groups = vec!["(?)"; items.len()].join(", ");
            let merged_sql = format!("{} /* merged {} rows */ VALUES {}", items[0].0, items.len(), value_groups);
            debug!(rows = items.len(), "merged identical batch items into multi-row query");
            let outcome = self
                .pool
                .query(&merged_sql, &merged_params, QueryOptions { operation: Operation::Write, ..Default::default() })
                .await?;
            return Ok(vec![outcome]);
        }

        let mut outcomes = Vec::with_capacity(items.len());
        for (sql, params) in items {
            let operation = if is_select(sql) { Operation::Read } else { Operation::Write };
            let result = self.pool.query(sql, params, QueryOptions { operation, ..Default::default() }).await;
            match (mode, result) {
                (BatchMode::Transaction, Err(e)) => return Err(e),
                (BatchMode::Transaction, Ok(o)) => outcomes.push(o),
                (BatchMode::Sequential, Ok(o)) => outcomes.push(o),
                (BatchMode::Sequential, Err(e)) => return Err(e),
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::db::circuit::CircuitBreakerConfig;
    use crate::db::pool::QueryExecutor;

    struct CountingExecutor(AtomicU32);

    #[async_trait]
    impl QueryExecutor for CountingExecutor {
        async fn execute(&self, _sql: &str, _params: &[String]) -> Result<u64> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        }
    }

    fn optimizer_over_counting_pool() -> (QueryOptimizer, Arc<CountingExecutor>) {
        let executor = Arc::new(CountingExecutor(AtomicU32::new(0)));
        let pool = Arc::new(DbPool::new(
            executor.clone(),
            vec![],
            CircuitBreakerConfig { failure_threshold: 5, cooldown: Duration::from_secs(30) },
            Duration::from_millis(1),
            Duration::from_secs(1),
        ));
        (QueryOptimizer::new(pool), executor)
    }

    #[tokio::test]
    async fn execute_cached_hits_pool_once_for_repeated_select() {
        let (optimizer, executor) = optimizer_over_counting_pool();
        let sql = "SELECT * FROM t WHERE id = $1";
        let params = vec!["7".to_string()];
        let first = optimizer.execute_cached(sql, &params, QueryOptions::default()).await.unwrap();
        let second = optimizer.execute_cached(sql, &params, QueryOptions::default()).await.unwrap();
        assert_eq!(first.rows, second.rows);
        assert_eq!(executor.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn execute_cached_never_caches_nondeterministic_queries() {
        let (optimizer, executor) = optimizer_over_counting_pool();
        optimizer.execute_cached("SELECT now()", &[], QueryOptions::default()).await.unwrap();
        optimizer.execute_cached("SELECT now()", &[], QueryOptions::default()).await.unwrap();
        assert_eq!(executor.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn execute_cached_distinguishes_params() {
        let (optimizer, executor) = optimizer_over_counting_pool();
        let sql = "SELECT * FROM t WHERE id = $1";
        optimizer.execute_cached(sql, &["1".into()], QueryOptions::default()).await.unwrap();
        optimizer.execute_cached(sql, &["2".into()], QueryOptions::default()).await.unwrap();
        assert_eq!(executor.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn normalize_folds_literals_and_whitespace() {
        let a = normalize_signature("SELECT * FROM t   WHERE id = 42");
        let b = normalize_signature("select *  from t where id=99");
        assert_eq!(a, b);
    }

    #[test]
    fn rewrite_flags_select_star() {
        let result = rewrite("  select * from customers  ");
        assert_eq!(result.sql, "select * from customers");
        assert!(result.flags.contains(&"select_star".to_string()));
    }

    #[test]
    fn result_cache_key_skips_nondeterministic_and_non_select() {
        assert!(result_cache_key("SELECT now()", &[]).is_none());
        assert!(result_cache_key("UPDATE t SET x=1", &[]).is_none());
        assert!(result_cache_key("SELECT * FROM t", &["1".into()]).is_some());
    }

    #[test]
    fn result_cache_key_is_stable_for_identical_inputs() {
        let a = result_cache_key("SELECT * FROM t WHERE id = $1", &["7".into()]);
        let b = result_cache_key("SELECT * FROM t WHERE id = $1", &["7".into()]);
        assert_eq!(a, b);
    }
}
