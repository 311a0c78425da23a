use async_trait::async_trait;
use reqwest::{Request, Response};

/// Seam for HTTP execution so tests can substitute a canned client.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}
