//! `reqwest` implementation of the remote boundary.
//!
//! # Login flow
//!
//! 1. `GET login_url`, keep any cookies, scrape the hidden
//!    `authenticity_token` input.
//! 2. `POST login_url` with the token and credentials, redirects disabled.
//!    A 302/303 means the credentials were accepted.
//!
//! Cookies gathered from both responses become the [`SessionRecord`].
//!
//! # Status mapping
//!
//! | Response | [`RemoteError`] |
//! |----------|-----------------|
//! | 401, 403, redirect from an API endpoint | `Unauthorized` |
//! | 429 | `RateLimited` (with `Retry-After` seconds) |
//! | other non-2xx | `Status(code)` |

use super::parse::{extract_authenticity_token, parse_set_cookie, parse_stories_page};
use super::{AssetBody, Authenticator, Remote};
use crate::config::Config;
use crate::error::{Error, RemoteError};
use crate::models::{SessionRecord, StoriesPage};
use crate::utils::truncate_for_log;
use itertools::Itertools;
use reqwest::header::{CONTENT_TYPE, COOKIE, LOCATION, REFERER, RETRY_AFTER, SET_COOKIE};
use reqwest::{Client, Response, StatusCode, redirect};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument};
use url::Url;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36";

/// HTTP client for the story API. Clones share connection pools.
#[derive(Clone)]
pub struct HttpClient {
    /// Login and listing requests; redirects are surfaced, not followed.
    api: Client,
    /// Asset downloads; CDNs are allowed to redirect.
    assets: Client,
    login_url: Url,
    stories_url: Url,
    username: String,
    password: String,
    session_ttl_secs: u64,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("login_url", &self.login_url.as_str())
            .field("stories_url", &self.stories_url.as_str())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let api = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(redirect::Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("could not build HTTP client: {e}")))?;
        // Large videos may take longer than `timeout` in total; only stalls count.
        let assets = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("could not build HTTP client: {e}")))?;

        Ok(Self {
            api,
            assets,
            login_url: config.login_url.clone(),
            stories_url: stories_endpoint(&config.api_base_url, &config.child_id)?,
            username: config.username.clone(),
            password: config.password.clone(),
            session_ttl_secs: config.session_ttl_secs,
        })
    }

    fn login_form(&self, token: &str) -> String {
        [
            ("authenticity_token", token),
            ("user[email]", self.username.as_str()),
            ("user[password]", self.password.as_str()),
            ("user[remember_me]", "1"),
        ]
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .join("&")
    }
}

/// `{base}/children/{child_id}/stories`, tolerant of a missing trailing slash.
pub fn stories_endpoint(base: &Url, child_id: &str) -> Result<Url, Error> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(&format!("children/{}/stories", urlencoding::encode(child_id)))
        .map_err(|e| Error::Config(format!("invalid API base URL: {e}")))
}

fn collect_cookies(response: &Response, jar: &mut BTreeMap<String, String>) {
    for value in response.headers().get_all(SET_COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        if let Some((name, value)) = parse_set_cookie(raw) {
            if value.is_empty() {
                jar.remove(&name);
            } else {
                jar.insert(name, value);
            }
        }
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited {
            retry_after: retry_after(&response),
        },
        s if s.is_redirection() => RemoteError::Unauthorized,
        s => RemoteError::Status(s.as_u16()),
    })
}

fn auth_error(stage: &str, e: reqwest::Error) -> Error {
    Error::Authentication(format!("{stage}: {e}"))
}

impl Authenticator for HttpClient {
    #[instrument(level = "info", skip_all, fields(login_url = %self.login_url))]
    async fn authenticate(&self) -> Result<SessionRecord, Error> {
        let mut cookies = BTreeMap::new();

        info!("Fetching login page to retrieve authenticity token");
        let page = self
            .api
            .get(self.login_url.clone())
            .send()
            .await
            .map_err(|e| auth_error("login page request failed", e))?;
        if !page.status().is_success() {
            return Err(Error::Authentication(format!(
                "login page returned status {}",
                page.status()
            )));
        }
        collect_cookies(&page, &mut cookies);
        let html = page
            .text()
            .await
            .map_err(|e| auth_error("login page body unreadable", e))?;
        let token = extract_authenticity_token(&html).ok_or_else(|| {
            Error::Authentication("could not find 'authenticity_token' input field".to_string())
        })?;

        info!("Posting login credentials");
        let response = self
            .api
            .post(self.login_url.clone())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(REFERER, self.login_url.as_str())
            .header(COOKIE, cookies.iter().map(|(k, v)| format!("{k}={v}")).join("; "))
            .body(self.login_form(&token))
            .send()
            .await
            .map_err(|e| auth_error("login request failed", e))?;

        match response.status() {
            StatusCode::FOUND | StatusCode::SEE_OTHER => {
                collect_cookies(&response, &mut cookies);
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                info!(%location, cookies = cookies.len(), "Login successful");
                Ok(SessionRecord::new(cookies, self.session_ttl_secs))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                error!(%status, "Login failed");
                debug!(body = %truncate_for_log(&body, 500), "Login failure response");
                Err(Error::Authentication(format!(
                    "login failed with status {status}"
                )))
            }
        }
    }
}

impl Remote for HttpClient {
    type Asset = HttpBody;

    #[instrument(level = "info", skip_all, fields(page_token = ?page_token))]
    async fn fetch_page(
        &self,
        session: &SessionRecord,
        page_token: Option<&str>,
    ) -> Result<StoriesPage, RemoteError> {
        let mut url = self.stories_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("sort_by", "updated_at");
            query.append_pair("story_type", "all");
            if let Some(token) = page_token {
                query.append_pair("page_token", token);
            }
        }

        debug!(%url, "Fetching listing page");
        let response = self
            .api
            .get(url)
            .header(COOKIE, session.cookie_header())
            .send()
            .await?;
        let body = check_status(response)?.text().await?;
        parse_stories_page(&body)
    }

    #[instrument(level = "info", skip_all, fields(%url))]
    async fn fetch_asset(&self, session: &SessionRecord, url: &str) -> Result<HttpBody, RemoteError> {
        let response = self
            .assets
            .get(url)
            .header(COOKIE, session.cookie_header())
            .send()
            .await?;
        let response = check_status(response)?;
        debug!(content_length = ?response.content_length(), "Asset download started");
        Ok(HttpBody {
            advertised: response.content_length(),
            response,
            received: 0,
            started: Instant::now(),
        })
    }
}

/// Streaming body of one asset response.
pub struct HttpBody {
    response: Response,
    advertised: Option<u64>,
    received: u64,
    started: Instant,
}

impl AssetBody for HttpBody {
    fn content_length(&self) -> Option<u64> {
        self.advertised
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RemoteError> {
        match self.response.chunk().await? {
            Some(chunk) => {
                self.received += chunk.len() as u64;
                Ok(Some(chunk.into()))
            }
            None => {
                debug!(
                    bytes = self.received,
                    elapsed_ms = self.started.elapsed().as_millis() as u64,
                    "Asset body received"
                );
                Ok(None)
            }
        }
    }
}
