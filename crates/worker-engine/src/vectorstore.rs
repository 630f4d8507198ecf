//! Vector store client (§6.4, §4.E vector-fetch protocol). Talks to the vector store's HTTP
//! API directly with `reqwest`, the same typed-request/typed-error shape the rest of this
//! codebase uses for its HTTP clients.

use crate::error::VectorStoreError;
use crate::model::{VectorPoint, VectorStoreConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub struct VectorStoreClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CollectionInfoResponse {
    result: CollectionInfoResult,
}

#[derive(Debug, Deserialize)]
struct CollectionInfoResult {
    points_count: u64,
}

#[derive(Debug, Serialize)]
struct ScrollRequest<'a> {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<&'a Value>,
    with_vector: bool,
    with_payload: bool,
}

#[derive(Debug, Deserialize)]
struct ScrollResponse {
    result: ScrollResult,
}

#[derive(Debug, Deserialize)]
struct ScrollResult {
    points: Vec<RawPoint>,
    next_page_offset: Option<Value>,
}

#[derive(Debug, Serialize)]
struct RetrieveRequest<'a> {
    ids: &'a [Value],
    with_vector: bool,
    with_payload: bool,
}

#[derive(Debug, Deserialize)]
struct RetrieveResponse {
    result: Vec<RawPoint>,
}

#[derive(Debug, Deserialize)]
struct RawPoint {
    id: Value,
    #[serde(default)]
    vector: Option<Vec<f32>>,
    #[serde(default)]
    payload: HashMap<String, Value>,
}

fn hover_text(payload: &HashMap<String, Value>) -> String {
    let item_title = payload.get("item_title").and_then(|v| v.as_str()).unwrap_or("");
    let text = payload.get("text").and_then(|v| v.as_str()).unwrap_or("");
    match (item_title.is_empty(), text.is_empty()) {
        (true, true) => String::new(),
        (false, true) => item_title.to_string(),
        (true, false) => text.to_string(),
        (false, false) => format!("{item_title}\n\n{text}"),
    }
}

fn point_id_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl VectorStoreClient {
    pub fn new(config: &VectorStoreConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.request(method, url);
        if let Some(key) = &self.api_key {
            req = req.header("api-key", key);
        }
        req
    }

    pub async fn collection_points_count(
        &self,
        collection: &str,
    ) -> Result<u64, VectorStoreError> {
        let res = self
            .request(reqwest::Method::GET, &format!("/collections/{collection}"))
            .send()
            .await
            .map_err(|e| VectorStoreError::Request(e.to_string()))?;
        if !res.status().is_success() {
            return Err(VectorStoreError::Request(format!(
                "get_collection http {}",
                res.status()
            )));
        }
        let body: CollectionInfoResponse = res
            .json()
            .await
            .map_err(|e| VectorStoreError::MalformedResponse(e.to_string()))?;
        Ok(body.result.points_count)
    }

    /// One page of `scroll`. `with_vectors` controls whether embeddings are returned (the
    /// sampling path over-cap only needs ids first).
    async fn scroll_page(
        &self,
        collection: &str,
        limit: u32,
        offset: Option<&Value>,
        with_vectors: bool,
    ) -> Result<(Vec<RawPoint>, Option<Value>), VectorStoreError> {
        let body = ScrollRequest {
            limit,
            offset,
            with_vector: with_vectors,
            with_payload: true,
        };
        let res = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{collection}/points/scroll"),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| VectorStoreError::Request(e.to_string()))?;
        if !res.status().is_success() {
            return Err(VectorStoreError::Request(format!(
                "scroll http {}",
                res.status()
            )));
        }
        let parsed: ScrollResponse = res
            .json()
            .await
            .map_err(|e| VectorStoreError::MalformedResponse(e.to_string()))?;
        Ok((parsed.result.points, parsed.result.next_page_offset))
    }

    /// Scroll every point in the collection with embeddings attached, page size 1000. Used
    /// when the collection is at or below the sampling cap.
    pub async fn scroll_all(
        &self,
        collection: &str,
    ) -> Result<Vec<VectorPoint>, VectorStoreError> {
        let mut out = Vec::new();
        let mut offset: Option<Value> = None;
        loop {
            let (points, next_offset) = self
                .scroll_page(collection, 1000, offset.as_ref(), true)
                .await?;
            if points.is_empty() {
                break;
            }
            for p in &points {
                let vector = p
                    .vector
                    .clone()
                    .ok_or_else(|| VectorStoreError::MalformedResponse("missing vector".into()))?;
                out.push(VectorPoint {
                    id: point_id_string(&p.id),
                    vector,
                    hover_text: hover_text(&p.payload),
                });
            }
            if next_offset.is_none() || next_offset == offset {
                break;
            }
            offset = next_offset;
        }
        Ok(out)
    }

    /// Scroll ids only, page size 5000. Used when the collection exceeds the sampling cap; the
    /// caller samples down before calling `retrieve_by_ids`.
    pub async fn scroll_ids(&self, collection: &str) -> Result<Vec<Value>, VectorStoreError> {
        let mut ids = Vec::new();
        let mut offset: Option<Value> = None;
        loop {
            let (points, next_offset) = self
                .scroll_page(collection, 5000, offset.as_ref(), false)
                .await?;
            if points.is_empty() {
                break;
            }
            ids.extend(points.into_iter().map(|p| p.id));
            if next_offset.is_none() || next_offset == offset {
                break;
            }
            offset = next_offset;
        }
        Ok(ids)
    }

    /// Retrieve a batch of points with vectors and payload by id.
    pub async fn retrieve_by_ids(
        &self,
        collection: &str,
        ids: &[Value],
    ) -> Result<Vec<VectorPoint>, VectorStoreError> {
        let body = RetrieveRequest {
            ids,
            with_vector: true,
            with_payload: true,
        };
        let res = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{collection}/points"),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| VectorStoreError::Request(e.to_string()))?;
        if !res.status().is_success() {
            return Err(VectorStoreError::Request(format!(
                "retrieve http {}",
                res.status()
            )));
        }
        let parsed: RetrieveResponse = res
            .json()
            .await
            .map_err(|e| VectorStoreError::MalformedResponse(e.to_string()))?;
        parsed
            .result
            .into_iter()
            .map(|p| {
                let vector = p
                    .vector
                    .ok_or_else(|| VectorStoreError::MalformedResponse("missing vector".into()))?;
                Ok(VectorPoint {
                    id: point_id_string(&p.id),
                    vector,
                    hover_text: hover_text(&p.payload),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hover_text_joins_title_and_text() {
        let mut payload = HashMap::new();
        payload.insert("item_title".to_string(), Value::String("Title".into()));
        payload.insert("text".to_string(), Value::String("Body".into()));
        assert_eq!(hover_text(&payload), "Title\n\nBody");
    }

    #[test]
    fn hover_text_falls_back_to_text_only() {
        let mut payload = HashMap::new();
        payload.insert("text".to_string(), Value::String("Body".into()));
        assert_eq!(hover_text(&payload), "Body");
    }

    #[test]
    fn hover_text_empty_when_no_fields() {
        let payload = HashMap::new();
        assert_eq!(hover_text(&payload), "");
    }
}
