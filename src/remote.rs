//! Client for a managed text to image prediction endpoint.
//!
//! Speaks the `:predict` protocol of cloud-hosted image models: one POST
//! with the prompt and sampling parameters, bearer token auth, images
//! returned base64 encoded in the response body. Deploying or managing the
//! hosted model is out of scope, the endpoint is assumed to exist.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Sampling parameters forwarded to the endpoint unchanged.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostedParams {
    pub sample_count: u32,
    pub aspect_ratio: String,
    pub safety_filter_level: String,
    pub person_generation: String,
}

impl Default for HostedParams {
    fn default() -> Self {
        Self {
            sample_count: 1,
            aspect_ratio: "1:1".to_string(),
            safety_filter_level: "block_some".to_string(),
            person_generation: "allow_adult".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    instances: Vec<Instance<'a>>,
    parameters: &'a HostedParams,
}

#[derive(Debug, Serialize)]
struct Instance<'a> {
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    bytes_base64_encoded: String,
    #[serde(default)]
    mime_type: Option<String>,
}

/// Endpoint URL for a published model on the managed platform.
pub fn endpoint_for(project: &str, location: &str, model: &str) -> String {
    format!(
        "https://{location}-aiplatform.googleapis.com/v1/projects/{project}/locations/{location}/publishers/google/models/{model}"
    )
}

/// Output file for the nth returned image: `output-image.png`, then
/// `output-image-2.png` and so on.
pub fn output_path(index: usize) -> PathBuf {
    if index == 0 {
        PathBuf::from("output-image.png")
    } else {
        PathBuf::from(format!("output-image-{}.png", index + 1))
    }
}

/// Client bound to one endpoint and token.
pub struct HostedClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HostedClient {
    pub fn new(endpoint: String, token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            token,
        }
    }

    /// Request images for a prompt, returning the decoded bytes of each.
    pub async fn generate(&self, prompt: &str, params: &HostedParams) -> Result<Vec<Vec<u8>>> {
        let url = format!("{}:predict", self.endpoint);
        let request = PredictRequest {
            instances: vec![Instance { prompt }],
            parameters: params,
        };

        info!(endpoint = %self.endpoint, sample_count = params.sample_count, "Requesting prediction");
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .context("Prediction request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Prediction endpoint returned {status}: {body}");
        }

        let parsed: PredictResponse = response
            .json()
            .await
            .context("Failed to decode prediction response")?;
        if parsed.predictions.is_empty() {
            bail!("Prediction response contained no images");
        }

        parsed
            .predictions
            .iter()
            .map(|prediction| {
                debug!(mime = ?prediction.mime_type, "Decoding prediction");
                BASE64
                    .decode(&prediction.bytes_base64_encoded)
                    .context("Prediction image was not valid base64")
            })
            .collect()
    }

    /// Request images and write each to its fixed output file under `dir`.
    pub async fn generate_to_files(
        &self,
        prompt: &str,
        params: &HostedParams,
        dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let images = self.generate(prompt, params).await?;
        let mut paths = Vec::with_capacity(images.len());
        for (index, bytes) in images.iter().enumerate() {
            let path = dir.join(output_path(index));
            std::fs::write(&path, bytes)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), bytes = bytes.len(), "✓ Image saved");
            paths.push(path);
        }
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    #[test]
    fn endpoint_url_places_model_and_location() {
        let url = endpoint_for("my-project", "us-central1", "imagen-3.0-generate-001");
        assert_eq!(
            url,
            "https://us-central1-aiplatform.googleapis.com/v1/projects/my-project/locations/us-central1/publishers/google/models/imagen-3.0-generate-001"
        );
    }

    #[test]
    fn output_files_follow_the_fixed_naming() {
        assert_eq!(output_path(0), PathBuf::from("output-image.png"));
        assert_eq!(output_path(1), PathBuf::from("output-image-2.png"));
        assert_eq!(output_path(4), PathBuf::from("output-image-5.png"));
    }

    #[test]
    fn request_body_uses_wire_field_names() {
        let params = HostedParams {
            sample_count: 2,
            ..Default::default()
        };
        let request = PredictRequest {
            instances: vec![Instance { prompt: "a red fox" }],
            parameters: &params,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["instances"][0]["prompt"], "a red fox");
        assert_eq!(value["parameters"]["sampleCount"], 2);
        assert_eq!(value["parameters"]["aspectRatio"], "1:1");
        assert_eq!(value["parameters"]["safetyFilterLevel"], "block_some");
        assert_eq!(value["parameters"]["personGeneration"], "allow_adult");
    }

    #[test]
    fn response_images_decode_from_base64() {
        let body = json!({
            "predictions": [
                { "bytesBase64Encoded": BASE64.encode(b"png-bytes"), "mimeType": "image/png" }
            ]
        });
        let parsed: PredictResponse = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.predictions.len(), 1);
        assert_eq!(
            BASE64
                .decode(&parsed.predictions[0].bytes_base64_encoded)
                .unwrap(),
            b"png-bytes"
        );
    }

    async fn spawn_endpoint(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/models/test")
    }

    #[tokio::test]
    async fn generate_decodes_returned_images() {
        let router = Router::new().route(
            "/models/test:predict",
            post(|| async {
                Json(json!({
                    "predictions": [
                        { "bytesBase64Encoded": BASE64.encode(b"first"), "mimeType": "image/png" },
                        { "bytesBase64Encoded": BASE64.encode(b"second"), "mimeType": "image/png" }
                    ]
                }))
            }),
        );
        let endpoint = spawn_endpoint(router).await;

        let client = HostedClient::new(endpoint, "test-token".to_string());
        let images = client
            .generate("a red fox", &HostedParams::default())
            .await
            .unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0], b"first");
        assert_eq!(images[1], b"second");
    }

    #[tokio::test]
    async fn failures_surface_status_and_body() {
        let router = Router::new().route(
            "/models/test:predict",
            post(|| async {
                (
                    axum::http::StatusCode::FORBIDDEN,
                    "permission denied".to_string(),
                )
            }),
        );
        let endpoint = spawn_endpoint(router).await;

        let client = HostedClient::new(endpoint, "test-token".to_string());
        let err = client
            .generate("a red fox", &HostedParams::default())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("403"));
        assert!(message.contains("permission denied"));
    }

    #[tokio::test]
    async fn generated_files_land_under_the_output_dir() {
        let router = Router::new().route(
            "/models/test:predict",
            post(|| async {
                Json(json!({
                    "predictions": [
                        { "bytesBase64Encoded": BASE64.encode(b"image-data") }
                    ]
                }))
            }),
        );
        let endpoint = spawn_endpoint(router).await;
        let dir = tempfile::tempdir().unwrap();

        let client = HostedClient::new(endpoint, "test-token".to_string());
        let paths = client
            .generate_to_files("a red fox", &HostedParams::default(), dir.path())
            .await
            .unwrap();

        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0], dir.path().join("output-image.png"));
        assert_eq!(std::fs::read(&paths[0]).unwrap(), b"image-data");
    }
}
