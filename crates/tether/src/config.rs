//! Engine configuration.
//!
//! Everything here is plain data that can be read from JSON, except the
//! function hook, which is attached in code.

use std::fmt;

use serde::{Deserialize, Serialize};
use tether_core::RecordKeys;
use tether_sync::{FunctionHook, HeaderSets, HttpOptions, ProtocolKind};

use crate::error::{EngineError, Result};

/// Configuration for one entity type.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CollectionConfig {
    /// Collection name, unique within an engine.
    pub name: String,
    /// Record field holding the local store key.
    pub local_key: String,
    /// Record field holding the server key.
    pub remote_key: String,
    /// Base route on the remote peer.
    pub route: String,
    /// Whether entities are written to a local store.
    pub persist_locally: bool,
    /// Protocol the remote channel speaks.
    pub protocol: ProtocolKind,
    /// Extra request headers.
    pub headers: HeaderSets,
    /// Send the last fetch watermark so unchanged collections are skipped.
    pub conditional_fetch: bool,
    /// Push only `serverData`.
    pub omit_local_data: bool,
    /// Fetch after every reconnect.
    pub fetch_on_connect: bool,
    /// Local metadata key the fetch watermark is kept under.
    pub watermark_key: String,
    /// Post-processing for function replies.
    #[serde(skip)]
    pub fn_hook: Option<FunctionHook>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            local_key: "_id".to_string(),
            remote_key: "id".to_string(),
            route: String::new(),
            persist_locally: true,
            protocol: ProtocolKind::Http,
            headers: HeaderSets::default(),
            conditional_fetch: false,
            omit_local_data: false,
            fetch_on_connect: false,
            watermark_key: "lastFetch".to_string(),
            fn_hook: None,
        }
    }
}

impl CollectionConfig {
    /// Configuration for `name`, served at `/{name}`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            route: format!("/{name}"),
            name,
            ..Self::default()
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    pub fn with_keys(mut self, local_key: impl Into<String>, remote_key: impl Into<String>) -> Self {
        self.local_key = local_key.into();
        self.remote_key = remote_key.into();
        self
    }

    pub fn with_persist_locally(mut self, persist: bool) -> Self {
        self.persist_locally = persist;
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolKind) -> Self {
        self.protocol = protocol;
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

    pub fn with_fetch_on_connect(mut self, enabled: bool) -> Self {
        self.fetch_on_connect = enabled;
        self
    }

    pub fn with_fn_hook(mut self, hook: FunctionHook) -> Self {
        self.fn_hook = Some(hook);
        self
    }

    /// Key fields of stored records.
    pub fn keys(&self) -> RecordKeys {
        RecordKeys::new(self.local_key.clone(), self.remote_key.clone())
    }

    /// Options for the HTTP protocol.
    pub fn http_options(&self) -> HttpOptions {
        let options = HttpOptions::new(self.route.clone())
            .with_remote_key(self.remote_key.clone())
            .with_headers(self.headers.clone())
            .with_conditional_fetch(self.conditional_fetch)
            .with_omit_local_data(self.omit_local_data);
        match &self.fn_hook {
            Some(hook) => options.with_fn_hook(hook.clone()),
            None => options,
        }
    }
}

impl fmt::Debug for CollectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionConfig")
            .field("name", &self.name)
            .field("local_key", &self.local_key)
            .field("remote_key", &self.remote_key)
            .field("route", &self.route)
            .field("persist_locally", &self.persist_locally)
            .field("protocol", &self.protocol)
            .field("conditional_fetch", &self.conditional_fetch)
            .field("omit_local_data", &self.omit_local_data)
            .field("fetch_on_connect", &self.fetch_on_connect)
            .field("watermark_key", &self.watermark_key)
            .field("fn_hook", &self.fn_hook.is_some())
            .finish_non_exhaustive()
    }
}

/// Configuration for a relationship between two entity types.
///
/// Members of `related` belong to entities of `parent`. The membership list
/// lives at `{parent route}/{parent serverId}/{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationConfig {
    pub parent: String,
    pub name: String,
    pub related: String,
    /// Record field the membership record is keyed under.
    #[serde(default = "default_local_key")]
    pub local_key: String,
    #[serde(default)]
    pub headers: HeaderSets,
}

fn default_local_key() -> String {
    "_id".to_string()
}

impl RelationConfig {
    pub fn new(
        parent: impl Into<String>,
        name: impl Into<String>,
        related: impl Into<String>,
    ) -> Self {
        Self {
            parent: parent.into(),
            name: name.into(),
            related: related.into(),
            local_key: default_local_key(),
            headers: HeaderSets::default(),
        }
    }

    /// `parent.name`, used for the local store and in logs.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.parent, self.name)
    }
}

/// Configuration for a whole engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub collections: Vec<CollectionConfig>,
    pub relations: Vec<RelationConfig>,
    /// Connect every remote channel as soon as the engine is built.
    pub start_online: bool,
}

impl EngineConfig {
    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut config: Self =
            serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))?;
        for collection in &mut config.collections {
            if collection.route.is_empty() {
                collection.route = format!("/{}", collection.name);
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Check names are unique and relations point at known collections.
    pub fn validate(&self) -> Result<()> {
        let mut names = std::collections::BTreeSet::new();
        for collection in &self.collections {
            if collection.name.is_empty() {
                return Err(EngineError::Config("collection without a name".into()));
            }
            if !names.insert(collection.name.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate collection {}",
                    collection.name
                )));
            }
        }
        for relation in &self.relations {
            for side in [&relation.parent, &relation.related] {
                if !names.contains(side.as_str()) {
                    return Err(EngineError::Config(format!(
                        "relation {} refers to unknown collection {side}",
                        relation.qualified_name()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_defaults() {
        let config = CollectionConfig::new("todos");
        assert_eq!(config.route, "/todos");
        assert_eq!(config.local_key, "_id");
        assert_eq!(config.remote_key, "id");
        assert_eq!(config.watermark_key, "lastFetch");
        assert!(config.persist_locally);
        assert_eq!(config.protocol, ProtocolKind::Http);
    }

    #[test]
    fn test_from_json() {
        let config = EngineConfig::from_json(
            r#"{
                "collections": [
                    {"name": "lists", "route": "/api/lists", "conditionalFetch": true},
                    {"name": "todos", "remoteKey": "uuid", "protocol": "websocket",
                     "headers": {"common": {"X-App": "tether"}}}
                ],
                "relations": [{"parent": "lists", "name": "items", "related": "todos"}],
                "startOnline": true
            }"#,
        )
        .unwrap();

        assert!(config.start_online);
        assert_eq!(config.collections[0].route, "/api/lists");
        assert!(config.collections[0].conditional_fetch);
        assert_eq!(config.collections[1].route, "/todos");
        assert_eq!(config.collections[1].remote_key, "uuid");
        assert_eq!(config.collections[1].local_key, "_id");
        assert_eq!(config.collections[1].protocol, ProtocolKind::Websocket);
        assert_eq!(config.collections[1].headers.common["X-App"], "tether");
        assert_eq!(config.relations[0].qualified_name(), "lists.items");
        assert_eq!(config.relations[0].local_key, "_id");
    }

    #[test]
    fn test_relation_to_unknown_collection_is_rejected() {
        let result = EngineConfig::from_json(
            r#"{"collections": [{"name": "lists"}],
                "relations": [{"parent": "lists", "name": "items", "related": "todos"}]}"#,
        );
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_http_options_follow_config() {
        let config = CollectionConfig::new("todos")
            .with_keys("key", "uuid")
            .with_omit_local_data(true);
        let options = config.http_options();
        assert_eq!(options.route, "/todos");
        assert_eq!(options.remote_key, "uuid");
        assert!(options.omit_local_data);
        assert_eq!(config.keys(), RecordKeys::new("key", "uuid"));
    }
}
