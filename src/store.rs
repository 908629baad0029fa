// src/store.rs
//! Client for the time-sharded HTTP document store.
//!
//! One client instance is bound to a document type and an index strategy.
//! Writes resolve the target index per request so `timed` deployments roll
//! over without a restart; reads always search across every shard behind
//! the configured prefix.

use crate::config::StoreConfig;
use crate::error::{Result, VigilError};
use crate::strategy::IndexStrategy;
use chrono::Utc;
use log::debug;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub struct StoreClient {
    http: reqwest::Client,
    uri: String,
    index_prefix: String,
    doc_type: String,
    strategy: Arc<dyn IndexStrategy>,
    drop_data: bool,
    search_path: String,
}

impl StoreClient {
    pub fn new(
        cfg: &StoreConfig,
        index_prefix: &str,
        doc_type: &str,
        strategy: Arc<dyn IndexStrategy>,
    ) -> Result<Self> {
        if cfg.uri.trim().is_empty() {
            return Err(VigilError::Config(
                "document store is not configured; set store.uri, for example \
                 uri=http://192.168.1.191:9200/"
                    .to_string(),
            ));
        }
        let mut uri = cfg.uri.trim().to_string();
        if !uri.ends_with('/') {
            uri.push('/');
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| VigilError::Config(format!("cannot build store client: {}", e)))?;
        let search_path = format!("{}{}*/{}/_search", uri, index_prefix, doc_type);
        Ok(Self {
            http,
            uri,
            index_prefix: index_prefix.to_string(),
            doc_type: doc_type.to_string(),
            strategy,
            drop_data: cfg.drop_data,
            search_path,
        })
    }

    /// Write path for the shard the strategy selects right now.
    fn write_path(&self) -> String {
        let index = self.strategy.index(Utc::now());
        format!("{}{}{}/{}/", self.uri, self.index_prefix, index, self.doc_type)
    }

    /// Upsert a document under the given id.
    pub async fn post_doc(&self, id: &str, body: &Value) -> Result<StatusCode> {
        if self.drop_data {
            return Ok(StatusCode::NO_CONTENT);
        }
        let path = format!("{}{}", self.write_path(), id);
        debug!("store post {}", path);
        let res = self
            .http
            .post(&path)
            .json(body)
            .send()
            .await
            .map_err(|e| VigilError::Store(e.to_string()))?;
        Ok(res.status())
    }

    /// Replace a document under the given id.
    pub async fn put_doc(&self, id: &str, body: &Value) -> Result<StatusCode> {
        if self.drop_data {
            return Ok(StatusCode::NO_CONTENT);
        }
        let path = format!("{}{}", self.write_path(), id);
        debug!("store put {}", path);
        let res = self
            .http
            .put(&path)
            .json(body)
            .send()
            .await
            .map_err(|e| VigilError::Store(e.to_string()))?;
        Ok(res.status())
    }

    /// Delete a document by id across every shard.
    pub async fn delete_doc(&self, id: &str) -> Result<StatusCode> {
        if self.drop_data {
            return Ok(StatusCode::NO_CONTENT);
        }
        let path = format!(
            "{}{}*/{}/{}",
            self.uri, self.index_prefix, self.doc_type, id
        );
        debug!("store delete {}", path);
        let res = self
            .http
            .delete(&path)
            .send()
            .await
            .map_err(|e| VigilError::Store(e.to_string()))?;
        Ok(res.status())
    }

    /// Run a search across every shard. `query_string` is appended verbatim
    /// (e.g. `search_type=count`).
    pub async fn search(&self, body: &Value, query_string: &str) -> Result<(StatusCode, Value)> {
        let path = if query_string.is_empty() {
            self.search_path.clone()
        } else {
            format!("{}?{}", self.search_path, query_string)
        };
        debug!("store search {}", path);
        let res = self
            .http
            .post(&path)
            .json(body)
            .send()
            .await
            .map_err(|e| VigilError::Store(e.to_string()))?;
        let status = res.status();
        let value = res
            .json::<Value>()
            .await
            .unwrap_or(Value::Null);
        Ok((status, value))
    }

    /// Fetch a document by id via the search endpoint.
    pub async fn get_by_id(&self, id: &str) -> Result<(StatusCode, Value)> {
        let path = format!("{}?q=_id:{}", self.search_path, id);
        debug!("store get {}", path);
        let res = self
            .http
            .get(&path)
            .send()
            .await
            .map_err(|e| VigilError::Store(e.to_string()))?;
        let status = res.status();
        let value = res.json::<Value>().await.unwrap_or(Value::Null);
        Ok((status, value))
    }

    /// Bulk-write pre-formatted action/document lines into the current
    /// shard.
    pub async fn bulk(&self, payload: String) -> Result<StatusCode> {
        if self.drop_data {
            return Ok(StatusCode::NO_CONTENT);
        }
        let path = format!("{}_bulk", self.write_path());
        debug!("store bulk {}", path);
        let res = self
            .http
            .post(&path)
            .body(payload)
            .send()
            .await
            .map_err(|e| VigilError::Store(e.to_string()))?;
        Ok(res.status())
    }

    /// Install an index template. Called once at API startup; failure is
    /// fatal for the process.
    pub async fn install_template(&self, name: &str, body: String) -> Result<()> {
        let path = format!("{}_template/{}", self.uri, name);
        let res = self
            .http
            .put(&path)
            .body(body)
            .send()
            .await
            .map_err(|e| VigilError::Fatal(format!("template install failed: {}", e)))?;
        if !res.status().is_success() {
            return Err(VigilError::Fatal(format!(
                "template install returned status {}",
                res.status()
            )));
        }
        Ok(())
    }
}

/// The `hits.hits` array of a search response.
pub fn hits(response: &Value) -> Option<&Vec<Value>> {
    response.get("hits")?.get("hits")?.as_array()
}

/// `_source` of the first hit, when there is one.
pub fn first_source(response: &Value) -> Option<&Value> {
    hits(response)?.first()?.get("_source")
}

/// The `aggregations` object of a search response.
pub fn aggregations(response: &Value) -> Option<&Value> {
    response.get("aggregations")
}
