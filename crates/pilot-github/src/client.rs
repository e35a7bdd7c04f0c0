//! Thin REST client shared by [`crate::GitHubForge`] and
//! [`crate::GitHubTaskAdapter`]: auth headers, status-code-to-`ForgeError`
//! mapping, and JSON (de)serialization. Neither of those two types talks to
//! `reqwest` directly — they go through here.

use pilot_core::forge::ForgeError;
use serde::de::DeserializeOwned;
use serde::Serialize;

const API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "pilot-github";

#[derive(Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    pub(crate) owner: String,
    pub(crate) repo: String,
    token: String,
}

impl GitHubClient {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            owner: owner.into(),
            repo: repo.into(),
            token: token.into(),
        }
    }

    /// Builds a repo-scoped `/repos/{owner}/{repo}/{path}` URL.
    pub(crate) fn url(&self, path: &str) -> String {
        format!("{API_BASE}/repos/{}/{}/{path}", self.owner, self.repo)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    pub(crate) async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ForgeError> {
        let url = self.url(path);
        let response = self.request(reqwest::Method::GET, &url).send().await.map_err(net_err)?;
        into_json(response).await
    }

    /// Like [`Self::get`] but folds a 404 into `Ok(None)` instead of an error,
    /// for endpoints where "not found" is a legitimate absence rather than a
    /// failure (latest release, tag-for-sha lookups).
    pub(crate) async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ForgeError> {
        let url = self.url(path);
        let response = self.request(reqwest::Method::GET, &url).send().await.map_err(net_err)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        into_json(response).await.map(Some)
    }

    pub(crate) async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, ForgeError> {
        let url = self.url(path);
        let response = self.request(reqwest::Method::GET, &url).send().await.map_err(net_err)?;
        let response = check_status(response).await?;
        response.bytes().await.map(|b| b.to_vec()).map_err(net_err)
    }

    pub(crate) async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ForgeError> {
        let url = self.url(path);
        let response = self.request(reqwest::Method::POST, &url).json(body).send().await.map_err(net_err)?;
        into_json(response).await
    }

    pub(crate) async fn patch<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ForgeError> {
        let url = self.url(path);
        let response = self.request(reqwest::Method::PATCH, &url).json(body).send().await.map_err(net_err)?;
        into_json(response).await
    }

    pub(crate) async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ForgeError> {
        let url = self.url(path);
        let response = self.request(reqwest::Method::PUT, &url).json(body).send().await.map_err(net_err)?;
        into_json(response).await
    }

    pub(crate) async fn delete(&self, path: &str) -> Result<(), ForgeError> {
        let url = self.url(path);
        let response = self.request(reqwest::Method::DELETE, &url).send().await.map_err(net_err)?;
        check_status(response).await.map(|_| ())
    }
}

fn net_err(e: reqwest::Error) -> ForgeError {
    ForgeError::NetworkError(e.to_string())
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ForgeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(match status.as_u16() {
        401 => ForgeError::AuthFailed(message),
        403 if message.to_lowercase().contains("rate limit") => ForgeError::RateLimited,
        404 => ForgeError::NotFound(message),
        409 | 422 => ForgeError::Conflict(message),
        429 => ForgeError::RateLimited,
        status => ForgeError::ApiError { status, message },
    })
}

async fn into_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ForgeError> {
    let response = check_status(response).await?;
    response.json::<T>().await.map_err(net_err)
}
