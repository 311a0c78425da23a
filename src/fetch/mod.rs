//! Retrieval of the raw accident exports.
//!
//! Both yearly exports are published as Google Drive documents; the constants
//! below are the direct-download forms of the share links.

mod basic;
mod client;

pub use basic::BasicClient;
pub use client::HttpClient;

use anyhow::Result;

/// 2022 PRF accident export for Ceará (semicolon-delimited, ISO-8859-1).
pub const ACCIDENTS_2022_URL: &str =
    "https://drive.google.com/uc?id=1BNsNNFtTqtmb9KQVLEgLbLxm9LPFeE5z";

/// 2023 PRF accident export for Ceará (semicolon-delimited, ISO-8859-1).
pub const ACCIDENTS_2023_URL: &str =
    "https://drive.google.com/uc?id=16-__wGh9iSbjJVgK4e8nnMFQgd8j885E";

pub async fn fetch_bytes<C: HttpClient>(client: &C, url: &str) -> Result<Vec<u8>> {
    let req = reqwest::Request::new(reqwest::Method::GET, url.parse()?);

    let resp = client.execute(req).await?;
    Ok(resp.bytes().await?.to_vec())
}
