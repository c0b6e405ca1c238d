//! Query management
//!
//! Read-through cache for backend queries. Results are stored under a key
//! derived from scope, operation and canonically ordered arguments, and
//! incoming results are combined with what is cached according to the
//! [`MergePolicy`] registered for the operation.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use networking::{OperationRequest, SendError, Transport};
use storage::{CacheError, CacheStore, CleanupReport};

/// Query errors
#[derive(Debug, Error)]
pub enum QueryError {
    /// Backend request failed
    #[error("Query fetch failed: {0}")]
    Fetch(#[from] SendError),

    /// Backend did not answer in time
    #[error("Query timeout after {0:?}")]
    Timeout(Duration),

    /// Cache error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Result type for query operations
pub type Result<T> = std::result::Result<T, QueryError>;

/// Query key for identifying and caching queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryKey {
    /// Scope of the query, the collection it reads (e.g. "appointments")
    pub scope: String,

    /// Operation name (e.g. "listAppointments")
    pub operation: String,

    /// Filter arguments, kept sorted by name
    pub args: BTreeMap<String, Value>,
}

impl QueryKey {
    /// Create a new query key
    pub fn new(scope: impl Into<String>, operation: impl Into<String>) -> Self {
        Self { scope: scope.into(), operation: operation.into(), args: BTreeMap::new() }
    }

    /// Add a filter argument
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Prefix shared by every cache key of `scope`
    pub fn scope_prefix(scope: &str) -> String {
        format!("query:{}:", scope)
    }

    /// Convert to cache key string
    ///
    /// Argument order never changes the key.
    pub fn to_cache_key(&self) -> String {
        let args = serde_json::to_string(&self.args).unwrap_or_default();
        format!("{}{}:{}", Self::scope_prefix(&self.scope), self.operation, args)
    }

    /// Backend request for this query
    pub fn to_request(&self) -> OperationRequest {
        let args: Map<String, Value> = self.args.clone().into_iter().collect();
        OperationRequest::query(&self.operation, &self.scope, Value::Object(args))
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.operation)?;
        if !self.args.is_empty() {
            write!(f, "?")?;
            let mut first = true;
            for (k, v) in &self.args {
                if !first {
                    write!(f, "&")?;
                }
                write!(f, "{}={}", k, v)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// How a new result is combined with the cached one
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// The new result replaces the cached one
    #[default]
    Replace,
    /// Items are matched by `id_field`; matches are updated in place and new
    /// items appended in incoming order
    MergeById {
        /// Field identifying an item
        id_field: String,
        /// Field of the result object holding the list, when the result is
        /// not a bare list (e.g. a page object with `items`)
        list_field: Option<String>,
    },
}

impl MergePolicy {
    /// Merge bare lists by `id_field`
    pub fn by_id(id_field: impl Into<String>) -> Self {
        MergePolicy::MergeById { id_field: id_field.into(), list_field: None }
    }

    /// Merge the list stored under `list_field` by `id_field`
    pub fn by_id_in(id_field: impl Into<String>, list_field: impl Into<String>) -> Self {
        MergePolicy::MergeById { id_field: id_field.into(), list_field: Some(list_field.into()) }
    }

    /// Combine `incoming` with the `existing` cached value
    pub fn apply(&self, existing: Option<&Value>, incoming: Value) -> Value {
        let (MergePolicy::MergeById { id_field, list_field }, Some(existing)) = (self, existing)
        else {
            return incoming;
        };

        match list_field {
            None => match (existing, incoming) {
                (Value::Array(old), Value::Array(new)) => Value::Array(merge_by_id(old, new, id_field)),
                (_, incoming) => incoming,
            },
            Some(field) => {
                let old_list = existing.get(field).and_then(Value::as_array);
                match (old_list, incoming) {
                    (Some(old), Value::Object(mut page)) => {
                        if let Some(Value::Array(new)) = page.remove(field) {
                            page.insert(field.clone(), Value::Array(merge_by_id(old, new, id_field)));
                        }
                        Value::Object(page)
                    }
                    (_, incoming) => incoming,
                }
            }
        }
    }
}

/// Merge `incoming` into `existing` by `id_field`
///
/// Items without the id field are appended.
pub fn merge_by_id(existing: &[Value], incoming: Vec<Value>, id_field: &str) -> Vec<Value> {
    let mut merged: Vec<Value> = existing.to_vec();
    let mut positions: HashMap<String, usize> = merged
        .iter()
        .enumerate()
        .filter_map(|(i, item)| item_id(item, id_field).map(|id| (id, i)))
        .collect();

    for item in incoming {
        match item_id(&item, id_field) {
            Some(id) => match positions.get(&id) {
                Some(&i) => merged[i] = item,
                None => {
                    positions.insert(id, merged.len());
                    merged.push(item);
                }
            },
            None => merged.push(item),
        }
    }
    merged
}

/// Identity of a list item, tagged with its JSON type so `1` and `"1"` differ
fn item_id(item: &Value, id_field: &str) -> Option<String> {
    match item.get(id_field)? {
        Value::Null => None,
        Value::String(s) => Some(format!("string:{}", s)),
        Value::Number(n) => Some(format!("number:{}", n)),
        Value::Bool(b) => Some(format!("bool:{}", b)),
        other => Some(format!("json:{}", other)),
    }
}

/// Query client for reading through the cache
pub struct QueryClient {
    cache: Arc<CacheStore>,
    responses: Option<Arc<CacheStore>>,
    response_ttl: Option<Duration>,
    transport: Arc<dyn Transport>,
    policies: RwLock<HashMap<String, MergePolicy>>,
    request_timeout: Duration,
}

impl QueryClient {
    /// Create a new query client
    pub fn new(cache: Arc<CacheStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            cache,
            responses: None,
            response_ttl: None,
            transport,
            policies: RwLock::new(HashMap::new()),
            request_timeout: Duration::from_secs(15),
        }
    }

    /// Keep raw server responses in `responses` as an offline fallback
    pub fn with_response_cache(mut self, responses: Arc<CacheStore>, ttl: Duration) -> Self {
        self.responses = Some(responses);
        self.response_ttl = Some(ttl);
        self
    }

    /// Set the backend request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Register the merge policy for an operation
    pub fn register_policy(&self, operation: impl Into<String>, policy: MergePolicy) {
        self.policies.write().insert(operation.into(), policy);
    }

    /// Merge policy for an operation
    pub fn policy(&self, operation: &str) -> MergePolicy {
        self.policies.read().get(operation).cloned().unwrap_or_default()
    }

    /// Cached result, if present and not expired
    pub fn get_cached(&self, key: &QueryKey) -> Result<Option<Value>> {
        Ok(self.cache.get(&key.to_cache_key())?)
    }

    /// Merge `incoming` into the cached result and store it
    ///
    /// A result too large for the cache is returned but not stored.
    pub fn write(&self, key: &QueryKey, incoming: Value) -> Result<Value> {
        let cache_key = key.to_cache_key();
        let existing = self.cache.get(&cache_key)?;
        let merged = self.policy(&key.operation).apply(existing.as_ref(), incoming);

        match self.cache.put(&cache_key, merged.clone(), None) {
            Ok(()) => {}
            Err(CacheError::QuotaExceeded { size, quota, .. }) => {
                tracing::warn!(key = %key, size, quota, "Query result exceeds cache quota, not cached");
                self.cache.cleanup()?;
                return Ok(merged);
            }
            Err(e) => return Err(e.into()),
        }

        if self.cache.is_under_pressure() {
            self.cache.cleanup()?;
        }
        Ok(merged)
    }

    /// Cached result, or fetch from the backend on a miss
    pub async fn fetch(&self, key: &QueryKey) -> Result<Value> {
        if let Some(cached) = self.get_cached(key)? {
            tracing::trace!(key = %key, "Query cache hit");
            return Ok(cached);
        }
        self.refresh(key).await
    }

    /// Fetch from the backend and merge into the cache
    ///
    /// On a transport failure the last raw response is served if one is kept.
    pub async fn refresh(&self, key: &QueryKey) -> Result<Value> {
        let request = key.to_request();
        let result = tokio::time::timeout(self.request_timeout, self.transport.send(&request))
            .await
            .map_err(|_| QueryError::Timeout(self.request_timeout))
            .and_then(|r| r.map_err(QueryError::from));

        let response = match result {
            Ok(response) => response,
            Err(e @ (QueryError::Timeout(_) | QueryError::Fetch(SendError::Transport(_)))) => {
                match self.last_response(key)? {
                    Some(stale) => {
                        tracing::debug!(key = %key, "Serving last response while offline: {}", e);
                        return Ok(stale);
                    }
                    None => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        if let Some(responses) = &self.responses {
            match responses.put(&key.to_cache_key(), response.data.clone(), self.response_ttl) {
                Ok(()) | Err(CacheError::QuotaExceeded { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.write(key, response.data)
    }

    /// Drop one cached result
    pub fn invalidate(&self, key: &QueryKey) -> Result<bool> {
        Ok(self.cache.remove(&key.to_cache_key())?)
    }

    /// Drop every cached result of a scope
    pub fn invalidate_scope(&self, scope: &str) -> Result<usize> {
        let removed = self.cache.remove_prefix(&QueryKey::scope_prefix(scope))?;
        if removed > 0 {
            tracing::debug!(scope, removed, "Invalidated query scope");
        }
        Ok(removed)
    }

    /// Expire and evict cached results
    pub fn cleanup(&self) -> Result<CleanupReport> {
        Ok(self.cache.cleanup()?)
    }

    fn last_response(&self, key: &QueryKey) -> Result<Option<Value>> {
        match &self.responses {
            Some(responses) => Ok(responses.get(&key.to_cache_key())?),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use networking::OperationResponse;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use storage::CacheConfig;

    struct ScriptedTransport {
        responses: Mutex<VecDeque<std::result::Result<OperationResponse, SendError>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<std::result::Result<Value, SendError>>) -> Arc<Self> {
            let responses = responses
                .into_iter()
                .map(|r| r.map(|data| OperationResponse { data, version: None }))
                .collect();
            Arc::new(Self { responses: Mutex::new(responses), calls: Mutex::new(0) })
        }

        fn calls(&self) -> usize {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, _request: &OperationRequest) -> std::result::Result<OperationResponse, SendError> {
            *self.calls.lock() += 1;
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(SendError::Transport("no scripted response".to_string())))
        }
    }

    fn client(transport: Arc<ScriptedTransport>) -> QueryClient {
        QueryClient::new(Arc::new(CacheStore::new(CacheConfig::new())), transport)
    }

    #[test]
    fn test_cache_key_ignores_arg_order() {
        let a = QueryKey::new("appointments", "list").with_arg("status", "scheduled").with_arg("patient", "p1");
        let b = QueryKey::new("appointments", "list").with_arg("patient", "p1").with_arg("status", "scheduled");

        assert_eq!(a.to_cache_key(), b.to_cache_key());
        assert!(a.to_cache_key().starts_with(&QueryKey::scope_prefix("appointments")));

        let c = QueryKey::new("appointments", "list").with_arg("status", "cancelled");
        assert_ne!(a.to_cache_key(), c.to_cache_key());
    }

    #[test]
    fn test_merge_by_id_updates_in_place_and_appends() {
        let existing = vec![json!({"id": 1, "v": "a"}), json!({"id": 2, "v": "b"})];
        let incoming = vec![json!({"id": 2, "v": "B"}), json!({"id": 3, "v": "c"})];

        let merged = merge_by_id(&existing, incoming, "id");
        assert_eq!(
            merged,
            vec![json!({"id": 1, "v": "a"}), json!({"id": 2, "v": "B"}), json!({"id": 3, "v": "c"})]
        );
    }

    #[test]
    fn test_merge_by_id_keeps_numeric_and_string_ids_apart() {
        let existing = vec![json!({"id": 1, "v": "number"})];
        let incoming = vec![json!({"id": "1", "v": "string"}), json!({"id": 1, "v": "number2"})];

        let merged = merge_by_id(&existing, incoming, "id");
        assert_eq!(
            merged,
            vec![json!({"id": 1, "v": "number2"}), json!({"id": "1", "v": "string"})]
        );
    }

    #[test]
    fn test_merge_policy_with_list_field() {
        let policy = MergePolicy::by_id_in("id", "items");
        let existing = json!({"items": [{"id": "a1"}], "cursor": "1"});
        let incoming = json!({"items": [{"id": "a2"}], "cursor": "2"});

        let merged = policy.apply(Some(&existing), incoming);
        assert_eq!(merged, json!({"items": [{"id": "a1"}, {"id": "a2"}], "cursor": "2"}));
    }

    #[test]
    fn test_replace_policy_and_shape_mismatch() {
        let existing = json!([{"id": 1}]);
        assert_eq!(MergePolicy::Replace.apply(Some(&existing), json!([{"id": 2}])), json!([{"id": 2}]));
        assert_eq!(MergePolicy::by_id("id").apply(Some(&existing), json!({"x": 1})), json!({"x": 1}));
        assert_eq!(MergePolicy::by_id("id").apply(None, json!([1])), json!([1]));
    }

    #[tokio::test]
    async fn test_fetch_uses_cache_after_first_call() {
        let transport = ScriptedTransport::new(vec![Ok(json!([{"id": "p1"}]))]);
        let client = client(Arc::clone(&transport));
        let key = QueryKey::new("patients", "listPatients");

        assert_eq!(client.fetch(&key).await.unwrap(), json!([{"id": "p1"}]));
        assert_eq!(client.fetch(&key).await.unwrap(), json!([{"id": "p1"}]));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_merges_with_registered_policy() {
        let transport = ScriptedTransport::new(vec![
            Ok(json!([{"id": "n1", "status": "unread"}])),
            Ok(json!([{"id": "n1", "status": "read"}, {"id": "n2", "status": "unread"}])),
        ]);
        let client = client(transport);
        client.register_policy("listNotifications", MergePolicy::by_id("id"));
        let key = QueryKey::new("notifications", "listNotifications");

        client.refresh(&key).await.unwrap();
        let merged = client.refresh(&key).await.unwrap();

        assert_eq!(
            merged,
            json!([{"id": "n1", "status": "read"}, {"id": "n2", "status": "unread"}])
        );
    }

    #[tokio::test]
    async fn test_oversized_result_is_returned_but_not_cached() {
        let transport = ScriptedTransport::new(vec![Ok(json!("x".repeat(500)))]);
        let cache = Arc::new(CacheStore::new(CacheConfig::new().quota_bytes(100)));
        let client = QueryClient::new(cache, transport);
        let key = QueryKey::new("documents", "getDocument");

        let value = client.fetch(&key).await.unwrap();
        assert_eq!(value.as_str().unwrap().len(), 500);
        assert_eq!(client.get_cached(&key).unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalidate_scope() {
        let transport = ScriptedTransport::new(vec![Ok(json!([])), Ok(json!([])), Ok(json!([]))]);
        let client = client(transport);

        let a = QueryKey::new("appointments", "list").with_arg("patient", "p1");
        let b = QueryKey::new("appointments", "list").with_arg("patient", "p2");
        let c = QueryKey::new("payments", "list");
        for key in [&a, &b, &c] {
            client.fetch(key).await.unwrap();
        }

        assert_eq!(client.invalidate_scope("appointments").unwrap(), 2);
        assert!(client.get_cached(&a).unwrap().is_none());
        assert!(client.get_cached(&c).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_offline_refresh_serves_last_response() {
        let transport = ScriptedTransport::new(vec![
            Ok(json!([{"id": "p1"}])),
            Err(SendError::Transport("offline".to_string())),
            Err(SendError::Validation("bad filter".to_string())),
        ]);
        let responses = Arc::new(CacheStore::new(CacheConfig::new()));
        let client = client(transport).with_response_cache(responses, Duration::from_secs(60));
        let key = QueryKey::new("patients", "listPatients");

        client.refresh(&key).await.unwrap();
        assert_eq!(client.refresh(&key).await.unwrap(), json!([{"id": "p1"}]));
        assert!(matches!(client.refresh(&key).await, Err(QueryError::Fetch(SendError::Validation(_)))));
    }
}
