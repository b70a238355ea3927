//! Boundary to the remote API.
//!
//! The engine only needs three capabilities from the outside world, split
//! into two traits so tests can stand in for either:
//!
//! | Capability | Trait | HTTP implementation |
//! |------------|-------|---------------------|
//! | log in, yielding a [`SessionRecord`] | [`Authenticator`] | CSRF form login |
//! | fetch one listing page | [`Remote`] | `GET children/{id}/stories` |
//! | stream one asset's bytes | [`Remote`], [`AssetBody`] | `GET {source_url}` |
//!
//! Both traits take the session explicitly; nothing reads ambient session state.
//!
//! - [`http`]: the `reqwest` implementation
//! - [`parse`]: the parsing collaborator (listing JSON, login form, cookies)

pub mod http;
pub mod parse;

use crate::error::{Error, RemoteError};
use crate::models::{SessionRecord, StoriesPage};

/// Produces a fresh authenticated session.
pub trait Authenticator {
    /// Perform a full login. Failures are [`Error::Authentication`] and are
    /// never retried silently.
    async fn authenticate(&self) -> Result<SessionRecord, Error>;
}

/// Authenticated read access to the listing and its assets.
pub trait Remote {
    /// Fetch one listing page; `page_token` is `None` for the first page.
    async fn fetch_page(
        &self,
        session: &SessionRecord,
        page_token: Option<&str>,
    ) -> Result<StoriesPage, RemoteError>;

    type Asset: AssetBody;

    /// Start downloading one asset. The status has been checked; the body is
    /// read chunk by chunk through the returned [`AssetBody`].
    async fn fetch_asset(&self, session: &SessionRecord, url: &str)
    -> Result<Self::Asset, RemoteError>;
}

/// Body of an asset download, read incrementally so no asset is ever held
/// in memory as a whole.
pub trait AssetBody {
    /// Length announced by the server, if any. The reader compares it with
    /// the number of bytes actually received.
    fn content_length(&self) -> Option<u64>;

    /// Next chunk of the body, `None` once it is complete. Errors mid-body
    /// are transport errors and are retried like any other.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RemoteError>;
}
