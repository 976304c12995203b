//! Token indirection for replaying past recordings.
//!
//! Media references routinely exceed the transport's callback-payload ceiling,
//! so library buttons carry a short random token instead and the real
//! reference lives here. Tokens are process-local and survive nothing: a
//! restart invalidates them, and the play flow answers with a "refresh the
//! list" fallback rather than failing silently.

use crate::event::{MediaRef, UserId};
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub const TOKEN_LEN: usize = 16;

/// Cap on live tokens. Every page render issues fresh tokens and nothing ever
/// consumed them in the original design, so growth must be bounded here:
/// oldest-issued tokens are evicted first once the cap is reached.
pub const DEFAULT_CAPACITY: usize = 512;

#[derive(Debug, Clone)]
struct Entry {
    media: MediaRef,
    owner: UserId,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// Issue order, oldest at the front.
    issued: VecDeque<String>,
}

/// Short-lived map from opaque token to playable media reference.
#[derive(Debug)]
pub struct LibraryTokenCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for LibraryTokenCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LibraryTokenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Issues a fresh token standing for `media`, owned by `owner`.
    pub fn issue(&self, media: MediaRef, owner: UserId) -> String {
        let mut inner = self.inner.lock().expect("token cache lock poisoned");
        while inner.entries.len() >= self.capacity {
            match inner.issued.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
        let mut token = random_token();
        while inner.entries.contains_key(&token) {
            token = random_token();
        }
        inner.entries.insert(token.clone(), Entry { media, owner });
        inner.issued.push_back(token.clone());
        token
    }

    /// Resolves a token to its media reference and owner. Read-only: the same
    /// button can be pressed more than once while the token is live.
    pub fn resolve(&self, token: &str) -> Option<(MediaRef, UserId)> {
        self.inner
            .lock()
            .expect("token cache lock poisoned")
            .entries
            .get(token)
            .map(|entry| (entry.media.clone(), entry.owner))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("token cache lock poisoned")
            .entries
            .len()
    }
}

fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Which pagination controls a library page should expose.
///
/// "next" only appears when the current page is full (a short page is by
/// definition the last one), "previous" only past page one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageNav {
    pub prev: Option<u32>,
    pub next: Option<u32>,
}

pub fn page_nav(page: u32, entries_on_page: usize, page_size: usize) -> PageNav {
    PageNav {
        prev: page.checked_sub(1),
        next: (entries_on_page == page_size).then(|| page + 1),
    }
}

/// Naive keyword label for a library row: the first few reasonably long
/// distinct words of the reflection text. No ranking beyond that.
pub fn keywords(text: &str, max: usize) -> String {
    let mut seen: Vec<String> = Vec::new();
    for word in text.split_whitespace() {
        let cleaned: String = word
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        if cleaned.chars().count() < 4 || seen.contains(&cleaned) {
            continue;
        }
        seen.push(cleaned);
        if seen.len() == max {
            break;
        }
    }
    seen.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_then_resolve_returns_the_media() {
        let cache = LibraryTokenCache::default();
        let media = MediaRef("AwACAgIAAxkBAaIKt2VeryLongTelegramFileId".to_string());
        let token = cache.issue(media.clone(), UserId(9));
        assert_eq!(token.len(), TOKEN_LEN);
        assert_eq!(cache.resolve(&token), Some((media, UserId(9))));
    }

    #[test]
    fn unknown_token_resolves_to_none() {
        let cache = LibraryTokenCache::default();
        assert_eq!(cache.resolve("nope"), None);
    }

    #[test]
    fn tokens_are_distinct_per_issue() {
        let cache = LibraryTokenCache::default();
        let a = cache.issue(MediaRef("file-a".to_string()), UserId(1));
        let b = cache.issue(MediaRef("file-a".to_string()), UserId(1));
        assert_ne!(a, b);
    }

    #[test]
    fn oldest_token_is_evicted_at_capacity() {
        let cache = LibraryTokenCache::new(3);
        let first = cache.issue(MediaRef("f-0".to_string()), UserId(1));
        for i in 1..=3 {
            cache.issue(MediaRef(format!("f-{i}")), UserId(1));
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.resolve(&first), None);
    }

    #[test]
    fn nav_controls_follow_page_shape() {
        assert_eq!(page_nav(0, 5, 5), PageNav { prev: None, next: Some(1) });
        assert_eq!(page_nav(2, 5, 5), PageNav { prev: Some(1), next: Some(3) });
        assert_eq!(page_nav(1, 2, 5), PageNav { prev: Some(0), next: None });
        assert_eq!(page_nav(0, 0, 5), PageNav { prev: None, next: None });
    }

    #[test]
    fn keywords_are_naive_and_deduplicated() {
        assert_eq!(
            keywords("Birds, birds and the distant traffic hum...", 3),
            "birds, distant, traffic"
        );
        assert_eq!(keywords("a an of", 3), "");
    }
}
