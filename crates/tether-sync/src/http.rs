//! REST encodings of the remote protocol.
//!
//! [`HttpProtocol`] maps a collection onto `{route}` and `{route}/{serverId}`.
//! [`HttpRelationProtocol`] maps one parent's membership list onto
//! `{parent_route}/{parentServerId}/{name}`.
//!
//! ## Design Notes
//!
//! - A `delete` reply comes back as `deletePermanently`: the peer confirmed
//!   removal, the entity can now leave the local store.
//! - A function reply is written to `data.fnReturn`, after the optional hook.
//! - `serverData` is merged into the outbound body and never read back.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tether_core::{Action, Envelope, Meta, ServerId};
use tokio::sync::watch;

use crate::error::{Result, SyncError};
use crate::protocol::{FetchOutcome, ProtocolKind, RemoteProtocol};
use crate::transport::{Method, Request, Response, Transport};

/// Field a function reply is written to.
pub const FN_RETURN_FIELD: &str = "fnReturn";

const IF_MODIFIED_SINCE: &str = "If-Modified-Since";
const LAST_MODIFIED: &str = "Last-Modified";

/// Post-processing for function replies: `(function name, reply body)`.
pub type FunctionHook = Arc<dyn Fn(&str, Value) -> anyhow::Result<Value> + Send + Sync>;

/// Parent server id a relation route is scoped to, once known.
pub type ParentScope = watch::Receiver<Option<ServerId>>;

/// Extra headers, shared and per verb.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderSets {
    pub common: BTreeMap<String, String>,
    pub get: BTreeMap<String, String>,
    pub post: BTreeMap<String, String>,
    pub put: BTreeMap<String, String>,
    pub delete: BTreeMap<String, String>,
}

impl HeaderSets {
    /// Headers for one request: common first, verb-specific override.
    pub fn for_method(&self, method: Method) -> BTreeMap<String, String> {
        let specific = match method {
            Method::Get => &self.get,
            Method::Post => &self.post,
            Method::Put => &self.put,
            Method::Delete => &self.delete,
        };
        let mut headers = self.common.clone();
        headers.extend(specific.iter().map(|(k, v)| (k.clone(), v.clone())));
        headers
    }
}

/// Options for [`HttpProtocol`].
#[derive(Clone)]
pub struct HttpOptions {
    pub route: String,
    /// Field of the remote representation holding the server id.
    pub remote_key: String,
    pub headers: HeaderSets,
    /// Send `If-Modified-Since` with the last watermark.
    pub conditional_fetch: bool,
    /// Push only `serverData`, not the entity's own data.
    pub omit_local_data: bool,
    pub fn_hook: Option<FunctionHook>,
}

impl HttpOptions {
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            remote_key: "id".to_string(),
            headers: HeaderSets::default(),
            conditional_fetch: false,
            omit_local_data: false,
            fn_hook: None,
        }
    }

    pub fn with_remote_key(mut self, remote_key: impl Into<String>) -> Self {
        self.remote_key = remote_key.into();
        self
    }

    pub fn with_headers(mut self, headers: HeaderSets) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_conditional_fetch(mut self, enabled: bool) -> Self {
        self.conditional_fetch = enabled;
        self
    }

    pub fn with_omit_local_data(mut self, enabled: bool) -> Self {
        self.omit_local_data = enabled;
        self
    }

    pub fn with_fn_hook(mut self, hook: FunctionHook) -> Self {
        self.fn_hook = Some(hook);
        self
    }
}

impl fmt::Debug for HttpOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpOptions")
            .field("route", &self.route)
            .field("remote_key", &self.remote_key)
            .field("headers", &self.headers)
            .field("conditional_fetch", &self.conditional_fetch)
            .field("omit_local_data", &self.omit_local_data)
            .field("fn_hook", &self.fn_hook.is_some())
            .finish()
    }
}

/// Send a request and turn error statuses into [`SyncError::Status`].
async fn exchange(
    transport: &dyn Transport,
    headers: &HeaderSets,
    request: Request,
) -> Result<Response> {
    let extra = headers.for_method(request.method);
    let request = request.with_headers(extra);
    tracing::debug!(method = %request.method, path = %request.path, "remote request");

    let response = transport.send(request).await?;
    if response.is_error() {
        let message = match &response.body {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Err(SyncError::Status {
            status: response.status,
            message,
        });
    }
    Ok(response)
}

/// Reply metadata: the request's identity and correlation, with a new action.
fn reply_meta(request: &Meta, action: Action) -> Meta {
    Meta {
        action: Some(action),
        server_data: None,
        ..request.clone()
    }
}

fn server_id_of(envelope: &Envelope) -> Result<&ServerId> {
    envelope.server_id().ok_or_else(|| {
        SyncError::InvalidOperation(format!(
            "{} needs a server id",
            envelope.action().map_or("push", Action::label)
        ))
    })
}

// ─── Collection Protocol ───

/// REST protocol for one collection.
pub struct HttpProtocol {
    transport: Arc<dyn Transport>,
    options: HttpOptions,
}

impl HttpProtocol {
    pub fn new(transport: Arc<dyn Transport>, options: HttpOptions) -> Self {
        Self { transport, options }
    }

    pub fn options(&self) -> &HttpOptions {
        &self.options
    }

    fn item_path(&self, server_id: &ServerId) -> String {
        format!("{}/{}", self.options.route, server_id)
    }

    /// Outbound body: the entity data (unless omitted) with `serverData` on top.
    fn outbound_body(&self, envelope: &Envelope) -> Value {
        let mut body = match (&envelope.data, self.options.omit_local_data) {
            (Value::Object(map), false) => map.clone(),
            _ => Map::new(),
        };
        if let Some(Value::Object(extra)) = &envelope.meta.server_data {
            body.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        body.remove(&self.options.remote_key);
        Value::Object(body)
    }

    /// Split a remote representation into its server id and data.
    fn split_item(&self, item: Value) -> Result<(Option<ServerId>, Value)> {
        let Value::Object(mut map) = item else {
            return Err(SyncError::InvalidResponse(format!(
                "expected an object from {}",
                self.options.route
            )));
        };
        let server_id = map
            .remove(&self.options.remote_key)
            .and_then(|value| ServerId::from_value(&value));
        Ok((server_id, Value::Object(map)))
    }

    async fn save(&self, envelope: &Envelope) -> Result<Envelope> {
        let body = self.outbound_body(envelope);
        let request = match envelope.server_id() {
            None => Request::new(Method::Post, self.options.route.clone()),
            Some(server_id) => Request::new(Method::Put, self.item_path(server_id)),
        };
        let response =
            exchange(self.transport.as_ref(), &self.options.headers, request.with_body(body)).await?;

        let (server_id, data) = self.split_item(response.body)?;
        let server_id = server_id
            .or_else(|| envelope.server_id().cloned())
            .ok_or_else(|| {
                SyncError::InvalidResponse(format!(
                    "reply from {} has no {}",
                    self.options.route, self.options.remote_key
                ))
            })?;

        let mut meta = reply_meta(&envelope.meta, Action::Save);
        meta.server_id = Some(server_id);
        Ok(Envelope { meta, data })
    }

    async fn delete(&self, envelope: &Envelope) -> Result<Envelope> {
        let request = Request::new(Method::Delete, self.item_path(server_id_of(envelope)?));
        exchange(self.transport.as_ref(), &self.options.headers, request).await?;

        Ok(Envelope {
            meta: reply_meta(&envelope.meta, Action::DeletePermanently),
            data: envelope.data.clone(),
        })
    }

    async fn call(&self, envelope: &Envelope, name: &str, args: &Value) -> Result<Envelope> {
        let path = format!("{}/{}", self.item_path(server_id_of(envelope)?), name);
        let request = Request::new(Method::Post, path).with_body(args.clone());
        let response = exchange(self.transport.as_ref(), &self.options.headers, request).await?;

        let result = match &self.options.fn_hook {
            Some(hook) => hook(name, response.body).map_err(|e| SyncError::Hook(e.to_string()))?,
            None => response.body,
        };

        let mut data = match &envelope.data {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        data.insert(FN_RETURN_FIELD.to_string(), result);

        Ok(Envelope {
            meta: reply_meta(&envelope.meta, Action::function(name, args.clone())),
            data: Value::Object(data),
        })
    }
}

#[async_trait]
impl RemoteProtocol for HttpProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Http
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn fetch(&self, since: Option<&str>) -> Result<FetchOutcome> {
        let mut request = Request::new(Method::Get, self.options.route.clone());
        if let (true, Some(watermark)) = (self.options.conditional_fetch, since) {
            request = request.with_header(IF_MODIFIED_SINCE, watermark);
        }
        let response = exchange(self.transport.as_ref(), &self.options.headers, request).await?;
        let watermark = response.header(LAST_MODIFIED).map(str::to_string);

        if response.status == 304 {
            return Ok(FetchOutcome {
                envelopes: Vec::new(),
                watermark,
                not_modified: true,
            });
        }

        let Value::Array(items) = response.body else {
            return Err(SyncError::InvalidResponse(format!(
                "expected a list from {}",
                self.options.route
            )));
        };
        let mut envelopes = Vec::with_capacity(items.len());
        for item in items {
            let (server_id, data) = self.split_item(item)?;
            let Some(server_id) = server_id else {
                tracing::warn!(route = %self.options.route, "skipping fetched item without a server id");
                continue;
            };
            envelopes.push(Envelope::save(data).with_server_id(server_id));
        }

        Ok(FetchOutcome {
            envelopes,
            watermark,
            not_modified: false,
        })
    }

    async fn push(&self, envelope: &Envelope) -> Result<Envelope> {
        match envelope.action().cloned().unwrap_or(Action::Save) {
            Action::Save => self.save(envelope).await,
            Action::Delete => self.delete(envelope).await,
            Action::Function { name, args } => self.call(envelope, &name, &args).await,
            Action::DeletePermanently => Err(SyncError::InvalidOperation(
                "deletePermanently is never pushed".into(),
            )),
        }
    }
}

// ─── Relation Protocol ───

/// REST protocol for one parent's membership list.
///
/// Member envelopes carry the related entity's server id; their data is not
/// sent.
pub struct HttpRelationProtocol {
    transport: Arc<dyn Transport>,
    parent_route: String,
    name: String,
    headers: HeaderSets,
    parent: ParentScope,
}

impl HttpRelationProtocol {
    pub fn new(
        transport: Arc<dyn Transport>,
        parent_route: impl Into<String>,
        name: impl Into<String>,
        parent: ParentScope,
    ) -> Self {
        Self {
            transport,
            parent_route: parent_route.into(),
            name: name.into(),
            headers: HeaderSets::default(),
            parent,
        }
    }

    pub fn with_headers(mut self, headers: HeaderSets) -> Self {
        self.headers = headers;
        self
    }

    fn base_path(&self) -> Result<String> {
        let parent = self.parent.borrow().clone().ok_or(SyncError::Unbound)?;
        Ok(format!("{}/{}/{}", self.parent_route, parent, self.name))
    }
}

#[async_trait]
impl RemoteProtocol for HttpRelationProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Http
    }

    async fn connect(&self) -> Result<()> {
        self.base_path().map(|_| ())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn fetch(&self, _since: Option<&str>) -> Result<FetchOutcome> {
        let request = Request::new(Method::Get, self.base_path()?);
        let response = exchange(self.transport.as_ref(), &self.headers, request).await?;

        let Value::Array(ids) = response.body else {
            return Err(SyncError::InvalidResponse(format!(
                "expected a member list from {}/{}",
                self.parent_route, self.name
            )));
        };
        let envelopes = ids
            .iter()
            .filter_map(ServerId::from_value)
            .map(|server_id| Envelope::save(Value::Null).with_server_id(server_id))
            .collect();

        Ok(FetchOutcome {
            envelopes,
            watermark: None,
            not_modified: false,
        })
    }

    async fn push(&self, envelope: &Envelope) -> Result<Envelope> {
        let path = format!("{}/{}", self.base_path()?, server_id_of(envelope)?);
        let (method, reply) = match envelope.action() {
            None | Some(Action::Save) => (Method::Put, Action::Save),
            Some(Action::Delete) => (Method::Delete, Action::DeletePermanently),
            Some(other) => {
                return Err(SyncError::InvalidOperation(format!(
                    "{} is not a relation operation",
                    other.label()
                )))
            }
        };
        exchange(self.transport.as_ref(), &self.headers, Request::new(method, path)).await?;

        Ok(Envelope {
            meta: reply_meta(&envelope.meta, reply),
            data: envelope.data.clone(),
        })
    }
}
