//! In-memory stand-in for the remote API, used by unit tests.

use crate::error::{Error, RemoteError};
use crate::models::{MediaDescriptor, MediaKind, SessionRecord, StoriesPage, StoryDescriptor};
use crate::remote::{AssetBody, Authenticator, Remote};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

const SESSION_COOKIE: &str = "_session";
/// Assets are handed out in chunks of this many bytes.
const CHUNK: usize = 2;

#[derive(Debug, Default)]
struct State {
    logins: u32,
    reject_logins: bool,
    /// Sessions issued by login number `<= rejected_through` are refused.
    rejected_through: u32,
    pages: Vec<Vec<StoryDescriptor>>,
    assets: HashMap<String, Vec<u8>>,
    asset_failures: HashMap<String, VecDeque<RemoteError>>,
    /// Bodies cut short (while advertising the full length), per URL.
    short_bodies: HashMap<String, usize>,
    page_failures: VecDeque<RemoteError>,
    page_calls: Vec<Option<String>>,
    asset_calls: Vec<String>,
}

/// Clones share state, so a test can keep a handle after moving one into
/// the engine.
#[derive(Debug, Clone, Default)]
pub struct MockRemote {
    state: Arc<Mutex<State>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Build a story whose assets are served with their exact sizes advertised.
    pub fn story(&self, story_id: &str, contents: &[&[u8]]) -> StoryDescriptor {
        self.story_with_sizes(story_id, contents, true)
    }

    pub fn story_with_sizes(
        &self,
        story_id: &str,
        contents: &[&[u8]],
        advertise_sizes: bool,
    ) -> StoryDescriptor {
        let media = contents
            .iter()
            .enumerate()
            .map(|(i, bytes)| {
                let url = format!("https://cdn.test/{story_id}/{i}");
                self.set_asset(&url, bytes);
                MediaDescriptor {
                    position: i,
                    media_id: format!("m{i}"),
                    kind: MediaKind::Image,
                    source_url: url,
                    expected_size: advertise_sizes.then_some(bytes.len() as u64),
                }
            })
            .collect();
        StoryDescriptor {
            story_id: story_id.to_string(),
            title: format!("Story {story_id}"),
            metadata: serde_json::json!({ "id": story_id }),
            media,
        }
    }

    pub fn push_page(&self, stories: Vec<StoryDescriptor>) {
        self.with(|s| s.pages.push(stories));
    }

    pub fn set_asset(&self, url: &str, bytes: &[u8]) {
        self.with(|s| s.assets.insert(url.to_string(), bytes.to_vec()));
    }

    /// Make the next `times` fetches of `url` fail with `error`.
    pub fn fail_asset(&self, url: &str, error: RemoteError, times: usize) {
        self.with(|s| {
            let queue = s.asset_failures.entry(url.to_string()).or_default();
            queue.extend(std::iter::repeat_n(error, times));
        });
    }

    /// Serve only half of `url`'s bytes the next `times` times, while still
    /// announcing the full length.
    pub fn short_body(&self, url: &str, times: usize) {
        self.with(|s| *s.short_bodies.entry(url.to_string()).or_default() += times);
    }

    pub fn fail_pages(&self, error: RemoteError, times: usize) {
        self.with(|s| s.page_failures.extend(std::iter::repeat_n(error, times)));
    }

    pub fn reject_logins(&self) {
        self.with(|s| s.reject_logins = true);
    }

    /// Refuse every session issued so far and the next `extra` ones.
    pub fn reject_sessions(&self, extra: u32) {
        self.with(|s| s.rejected_through = s.logins + extra);
    }

    pub fn login_calls(&self) -> u32 {
        self.with(|s| s.logins)
    }

    pub fn page_calls(&self) -> Vec<Option<String>> {
        self.with(|s| s.page_calls.clone())
    }

    pub fn asset_calls(&self) -> Vec<String> {
        self.with(|s| s.asset_calls.clone())
    }

    fn session_accepted(state: &State, session: &SessionRecord) -> bool {
        session
            .cookies
            .get(SESSION_COOKIE)
            .and_then(|v| v.strip_prefix("login-"))
            .and_then(|n| n.parse::<u32>().ok())
            .is_some_and(|n| n > state.rejected_through && n <= state.logins)
    }
}

impl Authenticator for MockRemote {
    async fn authenticate(&self) -> Result<SessionRecord, Error> {
        self.with(|s| {
            if s.reject_logins {
                return Err(Error::Authentication("login failed with status 200".into()));
            }
            s.logins += 1;
            let cookies = BTreeMap::from([(SESSION_COOKIE.to_string(), format!("login-{}", s.logins))]);
            Ok(SessionRecord::new(cookies, 3_600))
        })
    }
}

impl Remote for MockRemote {
    async fn fetch_page(
        &self,
        session: &SessionRecord,
        page_token: Option<&str>,
    ) -> Result<StoriesPage, RemoteError> {
        self.with(|s| {
            s.page_calls.push(page_token.map(str::to_string));
            if let Some(e) = s.page_failures.pop_front() {
                return Err(e);
            }
            if !Self::session_accepted(s, session) {
                return Err(RemoteError::Unauthorized);
            }
            let index = match page_token {
                None => 0,
                Some(token) => token
                    .strip_prefix("page-")
                    .and_then(|n| n.parse::<usize>().ok())
                    .ok_or(RemoteError::Status(400))?,
            };
            let stories = s.pages.get(index).cloned().unwrap_or_default();
            let next_page_token = (index + 1 < s.pages.len()).then(|| format!("page-{}", index + 1));
            Ok(StoriesPage {
                stories,
                next_page_token,
            })
        })
    }

    type Asset = MockBody;

    async fn fetch_asset(&self, session: &SessionRecord, url: &str) -> Result<MockBody, RemoteError> {
        self.with(|s| {
            s.asset_calls.push(url.to_string());
            if let Some(e) = s.asset_failures.get_mut(url).and_then(VecDeque::pop_front) {
                return Err(e);
            }
            if !Self::session_accepted(s, session) {
                return Err(RemoteError::Unauthorized);
            }
            let bytes = s.assets.get(url).cloned().ok_or(RemoteError::Status(404))?;
            let advertised = bytes.len() as u64;
            let served = match s.short_bodies.get_mut(url) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    &bytes[..bytes.len() / 2]
                }
                _ => &bytes[..],
            };
            Ok(MockBody {
                advertised: Some(advertised),
                chunks: served.chunks(CHUNK).map(<[u8]>::to_vec).collect(),
            })
        })
    }
}

#[derive(Debug)]
pub struct MockBody {
    advertised: Option<u64>,
    chunks: VecDeque<Vec<u8>>,
}

impl AssetBody for MockBody {
    fn content_length(&self) -> Option<u64> {
        self.advertised
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RemoteError> {
        Ok(self.chunks.pop_front())
    }
}
