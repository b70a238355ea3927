//! Lazy, restartable walk over the remote story listing.
//!
//! [`StoryFetcher::next`] hands out one [`Listing`] item at a time and keeps
//! at most one page in memory. After the last story of each page it yields
//! [`Listing::PageEnd`] with the token of the following page; the
//! orchestrator stores that token as the resume cursor once every story of
//! the page is complete, so a restarted run begins at the first page that
//! still has unfinished work.
//!
//! The listing may change between runs. Stories seen again are simply
//! reported as already complete by the checkpoint.

use crate::api::RetryPolicy;
use crate::error::{Error, RemoteError};
use crate::models::{DownloadLayout, StoriesPage, Story, StoryDescriptor};
use crate::remote::{Authenticator, Remote};
use crate::session::SessionCache;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Listing {
    Story(Story),
    /// Every story of the current page has been handed out.
    /// `next_page_token` is `None` when this was the last page.
    PageEnd { next_page_token: Option<String> },
}

pub struct StoryFetcher<'r, R> {
    remote: &'r R,
    layout: DownloadLayout,
    retry: RetryPolicy,
    page_delay: Duration,
    /// Token of the next page to request; `None` means the first page.
    next_token: Option<String>,
    resumed: bool,
    buffer: VecDeque<StoryDescriptor>,
    page_end: Option<Option<String>>,
    exhausted: bool,
    pages_fetched: u32,
}

impl<'r, R: Remote> StoryFetcher<'r, R> {
    /// Create a fetcher. Nothing is requested until [`next`](Self::next).
    ///
    /// # Arguments
    ///
    /// * `remote` - Source of listing pages
    /// * `layout` - Used to attach destination paths to each story
    /// * `retry` - Backoff policy for page requests
    /// * `page_delay` - Pause before every page after the first
    /// * `resume_token` - Saved cursor from the checkpoint, `None` for page one
    pub fn new(
        remote: &'r R,
        layout: DownloadLayout,
        retry: RetryPolicy,
        page_delay: Duration,
        resume_token: Option<String>,
    ) -> Self {
        if let Some(token) = &resume_token {
            info!(page_token = %token, "Resuming listing from saved page token");
        }
        Self {
            remote,
            layout,
            retry,
            page_delay,
            resumed: resume_token.is_some(),
            next_token: resume_token,
            buffer: VecDeque::new(),
            page_end: None,
            exhausted: false,
            pages_fetched: 0,
        }
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    /// Next story or page boundary; `Ok(None)` once the listing is exhausted.
    pub async fn next<A: Authenticator>(
        &mut self,
        sessions: &mut SessionCache<A>,
    ) -> Result<Option<Listing>, Error> {
        loop {
            if let Some(descriptor) = self.buffer.pop_front() {
                return Ok(Some(Listing::Story(Story::from_descriptor(
                    descriptor,
                    &self.layout,
                ))));
            }
            if let Some(next_page_token) = self.page_end.take() {
                return Ok(Some(Listing::PageEnd { next_page_token }));
            }
            if self.exhausted {
                return Ok(None);
            }

            match self.fetch_next_page(sessions).await {
                Ok(page) => self.accept(page),
                // A saved token the server no longer honours: start over.
                Err(Error::Fetch {
                    source: RemoteError::Status(code),
                    ..
                }) if self.resumed && self.pages_fetched == 0 && (400..500).contains(&code) => {
                    warn!(
                        status = code,
                        "Saved page token was rejected; restarting listing from the first page"
                    );
                    self.resumed = false;
                    self.next_token = None;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn accept(&mut self, page: StoriesPage) {
        self.pages_fetched += 1;
        if page.stories.is_empty() {
            info!("No more stories to fetch; pagination is complete");
            self.exhausted = true;
            self.page_end = Some(None);
            return;
        }

        info!(
            stories = page.stories.len(),
            page = self.pages_fetched,
            has_next = page.next_page_token.is_some(),
            "Processing stories from the current page"
        );
        self.buffer.extend(page.stories);
        match page.next_page_token {
            Some(token) => {
                self.next_token = Some(token.clone());
                self.page_end = Some(Some(token));
            }
            None => {
                info!("Reached the end of all pages");
                self.exhausted = true;
                self.page_end = Some(None);
            }
        }
    }

    #[instrument(level = "info", skip_all, fields(page_token = ?self.next_token))]
    async fn fetch_next_page<A: Authenticator>(
        &self,
        sessions: &mut SessionCache<A>,
    ) -> Result<StoriesPage, Error> {
        if self.pages_fetched > 0 && !self.page_delay.is_zero() {
            sleep(self.page_delay).await;
        }

        let remote = self.remote;
        let retry = &self.retry;
        let token = self.next_token.as_deref();
        let what = format!("listing page {}", token.unwrap_or("<first>"));
        let what = what.as_str();

        sessions
            .authorized(what, |session| async move {
                retry
                    .run(what, || remote.fetch_page(&session, token))
                    .await
            })
            .await
    }
}
