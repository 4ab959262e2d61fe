//! Transport abstraction for remote protocols.
//!
//! The transport performs one request/response exchange. Protocols decide
//! what to send; the transport only knows how to deliver it. Implementations
//! may sit on top of any HTTP client.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Request verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(verb)
    }
}

/// One outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// The peer's answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl Response {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Header lookup, ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_error(&self) -> bool {
        self.status >= 400
    }
}

/// Transport trait for request/response delivery.
///
/// Implementations must be thread-safe (Send + Sync). An `Err` means the peer
/// could not be reached; an error status is still an `Ok` response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response>;
}

/// A REST peer living in memory, for tests and demos.
///
/// Serves collections registered by route, parent/child relations and named
/// functions. Failures can be injected.
pub mod memory {
    use super::*;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::RwLock;

    use crate::error::SyncError;

    /// Handler for `POST {route}/{id}/{name}`: receives the item id and the
    /// request body.
    pub type FunctionHandler = Arc<dyn Fn(&str, Value) -> Value + Send + Sync>;

    #[derive(Debug, Default)]
    struct Table {
        items: BTreeMap<u64, Value>,
        next_id: u64,
        remote_key: String,
    }

    impl Table {
        fn new(first_id: u64, remote_key: &str) -> Self {
            Self {
                items: BTreeMap::new(),
                next_id: first_id,
                remote_key: remote_key.to_string(),
            }
        }

        fn insert(&mut self, body: Value) -> Value {
            let id = self.next_id;
            self.next_id += 1;
            let item = with_field(body, &self.remote_key, json!(id));
            self.items.insert(id, item.clone());
            item
        }
    }

    #[derive(Default)]
    struct State {
        reachable: bool,
        fail_next: usize,
        version: u64,
        tables: BTreeMap<String, Table>,
        /// (parent route, relation name) -> parent id -> member ids
        relations: BTreeMap<(String, String), HashMap<String, BTreeSet<String>>>,
        functions: HashMap<String, FunctionHandler>,
        log: Vec<Request>,
    }

    /// In-memory REST server.
    pub struct MemoryServer {
        state: RwLock<State>,
    }

    impl MemoryServer {
        /// Create an empty, reachable server.
        pub fn new() -> Self {
            Self {
                state: RwLock::new(State {
                    reachable: true,
                    ..State::default()
                }),
            }
        }

        /// Serve a collection at `route`, assigning ids from 1.
        pub fn with_collection(self, route: impl Into<String>) -> Self {
            self.with_collection_from(route, 1)
        }

        /// Serve a collection at `route`, assigning ids from `first_id`.
        pub fn with_collection_from(mut self, route: impl Into<String>, first_id: u64) -> Self {
            self.state
                .get_mut()
                .tables
                .insert(route.into(), Table::new(first_id, "id"));
            self
        }

        /// Serve `{parent_route}/{parent}/{name}` membership lists.
        pub fn with_relation(mut self, parent_route: impl Into<String>, name: impl Into<String>) -> Self {
            self.state
                .get_mut()
                .relations
                .insert((parent_route.into(), name.into()), HashMap::new());
            self
        }

        /// Answer `POST {route}/{id}/{name}` with `handler`.
        pub fn with_function<F>(mut self, name: impl Into<String>, handler: F) -> Self
        where
            F: Fn(&str, Value) -> Value + Send + Sync + 'static,
        {
            self.state
                .get_mut()
                .functions
                .insert(name.into(), Arc::new(handler));
            self
        }

        // ─── Test Controls ───

        /// Make every request fail at the transport level.
        pub async fn set_reachable(&self, reachable: bool) {
            self.state.write().await.reachable = reachable;
        }

        /// Answer the next `count` requests with status 500.
        pub async fn fail_next(&self, count: usize) {
            self.state.write().await.fail_next = count;
        }

        /// Add an item as if another client had created it. Returns its id.
        pub async fn seed(&self, route: &str, body: Value) -> Option<u64> {
            let mut state = self.state.write().await;
            state.version += 1;
            let table = state.tables.get_mut(route)?;
            let item = table.insert(body);
            item.get(&table.remote_key).and_then(Value::as_u64)
        }

        /// Snapshot of a collection, ordered by id.
        pub async fn items(&self, route: &str) -> Vec<Value> {
            let state = self.state.read().await;
            state
                .tables
                .get(route)
                .map(|table| table.items.values().cloned().collect())
                .unwrap_or_default()
        }

        /// Members of one parent's relation.
        pub async fn members(&self, parent_route: &str, parent: &str, name: &str) -> Vec<String> {
            let state = self.state.read().await;
            state
                .relations
                .get(&(parent_route.to_string(), name.to_string()))
                .and_then(|parents| parents.get(parent))
                .map(|members| members.iter().cloned().collect())
                .unwrap_or_default()
        }

        /// Every request received so far, including failed ones.
        pub async fn requests(&self) -> Vec<Request> {
            self.state.read().await.log.clone()
        }

        /// Requests received with the given method.
        pub async fn count(&self, method: Method) -> usize {
            self.state
                .read()
                .await
                .log
                .iter()
                .filter(|request| request.method == method)
                .count()
        }
    }

    impl Default for MemoryServer {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Transport for MemoryServer {
        async fn send(&self, request: Request) -> Result<Response> {
            let mut state = self.state.write().await;
            if !state.reachable {
                return Err(SyncError::Transport(format!(
                    "{} {}: peer unreachable",
                    request.method, request.path
                )));
            }
            state.log.push(request.clone());
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Ok(Response::new(500, json!("injected failure")));
            }

            let response = route(&mut state, request);
            Ok(response.with_header("Last-Modified", state.version.to_string()))
        }
    }

    fn route(state: &mut State, request: Request) -> Response {
        let path = request.path.trim_end_matches('/').to_string();

        if let Some((key, rest)) = split_relation(state, &path) {
            return serve_relation(state, key, &rest, request);
        }
        let Some((route, rest)) = longest_route(state.tables.keys(), &path) else {
            return not_found(&path);
        };
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

        match (request.method, segments.as_slice()) {
            (Method::Get, []) => list(state, &route, &request),
            (Method::Post, []) => {
                let body = request.body.unwrap_or_else(|| json!({}));
                let mut created = None;
                if let Some(table) = state.tables.get_mut(&route) {
                    created = Some(table.insert(body));
                }
                state.version += 1;
                created.map_or_else(|| not_found(&path), |item| Response::new(201, item))
            }
            (Method::Get, [id]) => match item_of(state, &route, id) {
                Some(item) => Response::new(200, item),
                None => not_found(&path),
            },
            (Method::Put, [id]) => {
                let Some(table) = state.tables.get_mut(&route) else {
                    return not_found(&path);
                };
                let Some(key) = id.parse::<u64>().ok().filter(|k| table.items.contains_key(k))
                else {
                    return not_found(&path);
                };
                let body = request.body.unwrap_or_else(|| json!({}));
                let item = with_field(body, &table.remote_key, json!(key));
                table.items.insert(key, item.clone());
                state.version += 1;
                Response::new(200, item)
            }
            (Method::Delete, [id]) => {
                let removed = state
                    .tables
                    .get_mut(&route)
                    .and_then(|table| id.parse::<u64>().ok().and_then(|k| table.items.remove(&k)));
                match removed {
                    Some(item) => {
                        state.version += 1;
                        Response::new(200, item)
                    }
                    None => not_found(&path),
                }
            }
            (Method::Post, [id, name]) => {
                if item_of(state, &route, id).is_none() {
                    return not_found(&path);
                }
                match state.functions.get(*name) {
                    Some(handler) => {
                        Response::new(200, handler(*id, request.body.unwrap_or(Value::Null)))
                    }
                    None => not_found(&path),
                }
            }
            _ => Response::new(405, json!(format!("{} {} not allowed", request.method, path))),
        }
    }

    fn list(state: &State, route: &str, request: &Request) -> Response {
        let since = request
            .headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("If-Modified-Since"))
            .map(|(_, value)| value.as_str());
        if since == Some(state.version.to_string().as_str()) {
            return Response::new(304, Value::Null);
        }
        let items: Vec<Value> = state
            .tables
            .get(route)
            .map(|table| table.items.values().cloned().collect())
            .unwrap_or_default();
        Response::new(200, Value::Array(items))
    }

    fn serve_relation(
        state: &mut State,
        key: (String, String),
        rest: &[String],
        request: Request,
    ) -> Response {
        let path = request.path.clone();
        let Some(parents) = state.relations.get_mut(&key) else {
            return not_found(&path);
        };
        match (request.method, rest) {
            (Method::Get, [parent]) => {
                let members: Vec<Value> = parents
                    .get(parent)
                    .map(|set| set.iter().map(|m| id_value(m)).collect())
                    .unwrap_or_default();
                Response::new(200, Value::Array(members))
            }
            (Method::Put, [parent, member]) => {
                parents.entry(parent.clone()).or_default().insert(member.clone());
                state.version += 1;
                Response::new(200, json!({}))
            }
            (Method::Delete, [parent, member]) => {
                let removed = parents
                    .get_mut(parent)
                    .map(|set| set.remove(member))
                    .unwrap_or(false);
                if removed {
                    state.version += 1;
                    Response::new(200, json!({}))
                } else {
                    not_found(&path)
                }
            }
            _ => Response::new(405, json!(format!("{} {} not allowed", request.method, path))),
        }
    }

    /// Match `{parent_route}/{parent}/{name}[/{member}]` against registered
    /// relations. Returns the relation key and `[parent, member?]`.
    fn split_relation(state: &State, path: &str) -> Option<((String, String), Vec<String>)> {
        state.relations.keys().find_map(|(parent_route, name)| {
            let rest = path.strip_prefix(parent_route.as_str())?;
            let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
            let rest = match segments.as_slice() {
                [parent, n] if n == name => vec![parent.to_string()],
                [parent, n, member] if n == name => vec![parent.to_string(), member.to_string()],
                _ => return None,
            };
            Some(((parent_route.clone(), name.clone()), rest))
        })
    }

    fn longest_route<'a>(
        routes: impl Iterator<Item = &'a String>,
        path: &str,
    ) -> Option<(String, String)> {
        routes
            .filter(|route| {
                path == route.as_str()
                    || path
                        .strip_prefix(route.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
            .max_by_key(|route| route.len())
            .map(|route| (route.clone(), path[route.len()..].to_string()))
    }

    fn item_of(state: &State, route: &str, id: &str) -> Option<Value> {
        let key = id.parse::<u64>().ok()?;
        state.tables.get(route)?.items.get(&key).cloned()
    }

    fn with_field(body: Value, field: &str, value: Value) -> Value {
        let mut map = match body {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        map.insert(field.to_string(), value);
        Value::Object(map)
    }

    fn id_value(id: &str) -> Value {
        id.parse::<u64>().map_or_else(|_| json!(id), |n| json!(n))
    }

    fn not_found(path: &str) -> Response {
        Response::new(404, json!(format!("{path} not found")))
    }
}
