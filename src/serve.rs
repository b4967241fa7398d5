//! Minimal prompt submission form server.
//!
//! Serves the static form page at `/` and echoes submitted text back at
//! `POST /submit`. Nothing here is wired to generation; the form exists so
//! prompts can be collected from a browser during demos.

use anyhow::{Context, Result};
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Form, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;

const INDEX_PAGE: &str = include_str!("../assets/index.html");

pub fn router() -> Router {
    Router::new()
        .route("/", get(index))
        .route("/submit", post(submit))
        .route("/image", get(image_placeholder))
}

/// Serve the router on an already bound listener.
pub async fn serve_on(listener: TcpListener) -> Result<()> {
    axum::serve(listener, router())
        .await
        .context("Form server terminated")
}

/// Bind and serve until the process is stopped.
pub async fn run(host: &str, port: u16) -> Result<()> {
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Form server listening on http://{addr}");
    serve_on(listener).await
}

async fn index() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

#[derive(Debug, Deserialize)]
struct SubmitForm {
    text: String,
}

async fn submit(Form(form): Form<SubmitForm>) -> Html<String> {
    info!(text = %form.text, "Form submission");
    Html(format!("<p>{}</p>", escape_html(&form.text)))
}

async fn image_placeholder() -> Html<&'static str> {
    Html("<p>Hello, World!</p>")
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_on(listener));
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn submitted_text_is_echoed() {
        let base = spawn_server().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base}/submit"))
            .form(&[("text", "hello")])
            .send()
            .await
            .unwrap();

        assert!(response.status().is_success());
        let body = response.text().await.unwrap();
        assert!(body.contains("hello"));
        assert_eq!(body, "<p>hello</p>");
    }

    #[tokio::test]
    async fn markup_in_submissions_is_escaped() {
        let base = spawn_server().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base}/submit"))
            .form(&[("text", "<script>alert(1)</script>")])
            .send()
            .await
            .unwrap();

        let body = response.text().await.unwrap();
        assert!(!body.contains("<script>"));
        assert!(body.contains("&lt;script&gt;"));
    }

    #[tokio::test]
    async fn index_serves_the_form() {
        let base = spawn_server().await;
        let body = reqwest::get(format!("{base}/"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("<form"));
        assert!(body.contains("/submit"));
        assert!(body.contains("name=\"text\""));
    }

    #[tokio::test]
    async fn image_route_returns_placeholder() {
        let base = spawn_server().await;
        let body = reqwest::get(format!("{base}/image"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "<p>Hello, World!</p>");
    }

    #[test]
    fn escaping_covers_markup_characters() {
        assert_eq!(escape_html("a&b"), "a&amp;b");
        assert_eq!(escape_html("<p>"), "&lt;p&gt;");
        assert_eq!(escape_html("plain"), "plain");
    }
}
