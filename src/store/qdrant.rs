//! Qdrant driver over the REST API
//!
//! Each chunk is one point: the embedding is the point vector and the rest
//! of the chunk is the payload. Qdrant only accepts UUID or integer point
//! ids, so other chunk ids are mapped to a name-based UUID (v5) and the
//! original id is kept in the payload.
//!
//! Status mapping: 404 is `NotFound`; 408, 425, 429 and 5xx are `Transient`;
//! any other 4xx is a `Validation` error. Connect failures and timeouts are
//! `Transient`.

use super::StoragePort;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::memory::{Chunk, ScoredChunk, SearchFilter, SearchQuery, StoreStats};
use crate::resilience::{Connection, ConnectionFactory};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

/// Whether an HTTP status indicates a failure worth retrying
pub fn should_retry_status(status: u16) -> bool {
    status == 408 || status == 425 || status == 429 || status >= 500
}

fn classify_status(status: u16, what: &str, body: &str) -> Error {
    let detail = format!("{} returned HTTP {}: {}", what, status, body.trim());
    if status == 404 {
        Error::NotFound(detail)
    } else if should_retry_status(status) {
        Error::Transient(detail)
    } else {
        Error::Validation(detail)
    }
}

fn classify_transport(error: reqwest::Error, what: &str) -> Error {
    if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
        Error::Transient(format!("{}: {}", what, error))
    } else {
        Error::Internal(format!("{}: {}", what, error))
    }
}

/// Qdrant point id for a chunk id
pub fn point_id(chunk_id: &str) -> String {
    match Uuid::parse_str(chunk_id) {
        Ok(uuid) => uuid.to_string(),
        Err(_) => Uuid::new_v5(&Uuid::NAMESPACE_OID, chunk_id.as_bytes()).to_string(),
    }
}

/// Qdrant filter expression for a search filter
pub fn filter_json(filter: &SearchFilter) -> Value {
    let mut must = Vec::new();
    if let Some(scope) = &filter.scope {
        must.push(json!({"key": "scope", "match": {"value": scope}}));
    }
    for tag in &filter.tags {
        must.push(json!({"key": "metadata.tags", "match": {"value": tag}}));
    }
    if let Some(session) = &filter.session_id {
        must.push(json!({"key": "metadata.session_id", "match": {"value": session}}));
    }
    if let Some(outcome) = filter.outcome {
        must.push(json!({"key": "metadata.outcome", "match": {"value": outcome}}));
    }

    let mut must_not = Vec::new();
    if !filter.include_deleted {
        must_not.push(json!({"key": "deleted", "match": {"value": true}}));
    }

    json!({"must": must, "must_not": must_not})
}

fn payload(chunk: &Chunk) -> Result<Value> {
    let mut value = serde_json::to_value(chunk)?;
    if let Some(object) = value.as_object_mut() {
        object.remove("embedding");
    }
    Ok(value)
}

#[derive(Debug, Deserialize)]
struct PointRecord {
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    vector: Option<Vec<f32>>,
    #[serde(default)]
    score: Option<f32>,
}

impl PointRecord {
    fn into_chunk(self) -> Result<(Chunk, f32)> {
        let mut chunk: Chunk = serde_json::from_value(self.payload)?;
        chunk.embedding = self.vector.unwrap_or_default();
        Ok((chunk, self.score.unwrap_or_default()))
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    result: T,
}

/// One Qdrant client handle
pub struct QdrantConnection {
    client: reqwest::Client,
    base_url: String,
    collection: String,
    dimension: usize,
}

impl QdrantConnection {
    pub fn new(config: &StoreConfig, dimension: usize) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &config.api_key {
            let value = HeaderValue::from_str(key)
                .map_err(|e| Error::Config(format!("Invalid Qdrant API key: {}", e)))?;
            headers.insert("api-key", value);
        }
        let client = reqwest::Client::builder()
            .timeout(config.call_timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            dimension,
        })
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.collection, suffix)
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(e, what))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), what, &body));
        }
        let body: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| classify_transport(e, what))?;
        Ok(body.result)
    }
}

#[async_trait]
impl StoragePort for QdrantConnection {
    async fn initialize(&self) -> Result<()> {
        let existing: Result<Value> = self
            .send(self.client.get(self.collection_url("")), "get collection")
            .await;
        match existing {
            Ok(_) => {
                tracing::info!(collection = %self.collection, "Qdrant collection initialized");
                Ok(())
            }
            Err(Error::NotFound(_)) => {
                let body = json!({
                    "vectors": {"size": self.dimension, "distance": "Cosine"}
                });
                let _: Value = self
                    .send(
                        self.client.put(self.collection_url("")).json(&body),
                        "create collection",
                    )
                    .await?;
                tracing::info!(collection = %self.collection, dimension = self.dimension, "Created Qdrant collection");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, chunk: &Chunk) -> Result<()> {
        let body = json!({
            "points": [{
                "id": point_id(&chunk.id),
                "vector": chunk.embedding,
                "payload": payload(chunk)?,
            }]
        });
        let _: Value = self
            .send(
                self.client
                    .put(self.collection_url("/points?wait=true"))
                    .json(&body),
                "upsert point",
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Chunk> {
        let body = json!({
            "ids": [point_id(id)],
            "with_payload": true,
            "with_vector": true,
        });
        let records: Vec<PointRecord> = self
            .send(
                self.client.post(self.collection_url("/points")).json(&body),
                "retrieve point",
            )
            .await?;
        match records.into_iter().next() {
            Some(record) => Ok(record.into_chunk()?.0),
            None => Err(Error::NotFound(format!("chunk {}", id))),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let body = json!({"points": [point_id(id)]});
        let _: Value = self
            .send(
                self.client
                    .post(self.collection_url("/points/delete?wait=true"))
                    .json(&body),
                "delete point",
            )
            .await?;
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredChunk>> {
        let body = json!({
            "vector": query.vector,
            "limit": query.top_k,
            "filter": filter_json(&query.filter),
            "with_payload": true,
            "with_vector": true,
        });
        let records: Vec<PointRecord> = self
            .send(
                self.client
                    .post(self.collection_url("/points/search"))
                    .json(&body),
                "search points",
            )
            .await?;
        records
            .into_iter()
            .map(|record| {
                record
                    .into_chunk()
                    .map(|(chunk, score)| ScoredChunk { chunk, score })
            })
            .collect()
    }

    async fn stats(&self) -> Result<StoreStats> {
        let info: Value = self
            .send(self.client.get(self.collection_url("")), "get collection")
            .await?;
        Ok(StoreStats {
            backend: "qdrant".to_string(),
            total_chunks: info["points_count"].as_u64().unwrap_or_default(),
            deleted_chunks: None,
            dimension: info["config"]["params"]["vectors"]["size"]
                .as_u64()
                .map(|size| size as usize),
        })
    }
}

#[async_trait]
impl Connection for QdrantConnection {
    async fn is_healthy(&self) -> bool {
        match self
            .client
            .get(format!("{}/healthz", self.base_url))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("Qdrant health probe failed: {}", e);
                false
            }
        }
    }
}

/// Opens [`QdrantConnection`]s for the pool
pub struct QdrantConnector {
    config: StoreConfig,
    dimension: usize,
}

impl QdrantConnector {
    pub fn new(config: StoreConfig, dimension: usize) -> Self {
        Self { config, dimension }
    }
}

#[async_trait]
impl ConnectionFactory for QdrantConnector {
    type Conn = QdrantConnection;

    async fn connect(&self) -> Result<QdrantConnection> {
        QdrantConnection::new(&self.config, self.dimension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ChunkBuilder, Outcome};

    #[test]
    fn test_point_id_keeps_uuids_and_maps_others() {
        let uuid = Uuid::new_v4().to_string();
        assert_eq!(point_id(&uuid), uuid);

        let mapped = point_id("chunk-42");
        assert!(Uuid::parse_str(&mapped).is_ok());
        assert_eq!(mapped, point_id("chunk-42"));
        assert_ne!(mapped, point_id("chunk-43"));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(classify_status(404, "get", ""), Error::NotFound(_)));
        assert!(matches!(classify_status(503, "get", ""), Error::Transient(_)));
        assert!(matches!(classify_status(429, "get", ""), Error::Transient(_)));
        assert!(matches!(classify_status(400, "get", "bad vector"), Error::Validation(_)));
        assert!(!should_retry_status(409));
    }

    #[test]
    fn test_filter_json() {
        let filter = SearchFilter {
            scope: Some("repo".to_string()),
            tags: vec!["ci".to_string()],
            outcome: Some(Outcome::Failed),
            ..Default::default()
        };
        let value = filter_json(&filter);
        assert_eq!(value["must"].as_array().unwrap().len(), 3);
        assert_eq!(value["must"][2]["match"]["value"], "failed");
        assert_eq!(value["must_not"][0]["key"], "deleted");

        let include = SearchFilter {
            include_deleted: true,
            ..Default::default()
        };
        assert!(filter_json(&include)["must_not"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_point_record_restores_chunk() {
        let chunk = ChunkBuilder::new("repo", "qdrant payload")
            .id("c1")
            .tag("x")
            .embedding(vec![0.5, 0.5])
            .build()
            .unwrap();
        let record = PointRecord {
            payload: payload(&chunk).unwrap(),
            vector: Some(vec![0.5, 0.5]),
            score: Some(0.9),
        };
        assert!(record.payload.get("embedding").is_none());

        let (restored, score) = record.into_chunk().unwrap();
        assert_eq!(restored, chunk);
        assert_eq!(score, 0.9);
    }

    #[test]
    fn test_connection_urls() {
        let config = StoreConfig {
            url: "http://qdrant:6333/".to_string(),
            ..Default::default()
        };
        let conn = QdrantConnection::new(&config, 8).unwrap();
        assert_eq!(
            conn.collection_url("/points/search"),
            "http://qdrant:6333/collections/memory_chunks/points/search"
        );
    }
}
