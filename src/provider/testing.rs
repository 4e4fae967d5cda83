//! In-memory mailbox used by unit tests across the crate.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use secrecy::SecretString;

use super::{
    Credentials, Header, HistoryPage, MailboxProvider, MessageList, MessagePart, MessageRef,
    PartBody, Profile, ProviderMessage, WatchResponse,
};
use crate::error::ProviderError;

pub(crate) fn credentials() -> Credentials {
    Credentials {
        access_token: SecretString::from("token".to_string()),
        refresh_token: None,
    }
}

pub(crate) struct FakeMailbox {
    pub email: String,
    pub page_size: usize,
    messages: Mutex<HashMap<String, ProviderMessage>>,
    history: Mutex<Vec<MessageRef>>,
    latest: AtomicU64,
    /// History requests starting below this cursor fail with NotFound.
    pub stale_below: AtomicU64,
    pub fail_watch: AtomicBool,
    pub fail_stop: AtomicBool,
    pub fetches: AtomicUsize,
    pub watch_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub history_calls: AtomicUsize,
}

impl FakeMailbox {
    pub fn new(email: &str, latest: u64) -> Self {
        Self {
            email: email.to_string(),
            page_size: 100,
            messages: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            latest: AtomicU64::new(latest),
            stale_below: AtomicU64::new(0),
            fail_watch: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
            watch_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            history_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn latest(&self) -> u64 {
        self.latest.load(Ordering::SeqCst)
    }

    pub fn set_latest(&self, cursor: u64) {
        self.latest.store(cursor, Ordering::SeqCst);
    }

    /// Deliver a message to the mailbox at history position `cursor`.
    pub fn deliver(&self, id: &str, from: &str, subject: &str, text: &str, cursor: u64) {
        let part = |mime: &str, body: &str| MessagePart {
            mime_type: mime.into(),
            body: Some(PartBody {
                size: body.len() as u64,
                data: Some(URL_SAFE_NO_PAD.encode(body)),
                attachment_id: None,
            }),
            ..Default::default()
        };
        let header = |name: &str, value: &str| Header {
            name: name.into(),
            value: value.into(),
        };

        let message = ProviderMessage {
            id: id.to_string(),
            thread_id: format!("thread-{id}"),
            label_ids: vec!["INBOX".into()],
            internal_date: Some(Utc::now()),
            payload: Some(MessagePart {
                mime_type: "multipart/alternative".into(),
                headers: vec![
                    header("From", from),
                    header("Subject", subject),
                    header("Message-ID", &format!("<{id}@mail.test>")),
                    header("Date", "Sun, 15 Dec 2024 10:30:00 -0500"),
                ],
                parts: vec![
                    part("text/plain", text),
                    part("text/html", &format!("<p>{text}</p>")),
                ],
                ..Default::default()
            }),
        };

        self.messages
            .lock()
            .unwrap()
            .insert(id.to_string(), message);
        self.history.lock().unwrap().push(MessageRef {
            id: id.to_string(),
            thread_id: format!("thread-{id}"),
            history_cursor: cursor,
        });
        self.latest.fetch_max(cursor, Ordering::SeqCst);
    }

    /// Delete the message content but keep its history entry.
    pub fn forget(&self, id: &str) {
        self.messages.lock().unwrap().remove(id);
    }
}

fn page<T: Clone>(items: &[T], page_token: Option<&str>, size: usize) -> (Vec<T>, Option<String>) {
    let start: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
    let end = (start + size).min(items.len());
    let next = (end < items.len()).then(|| end.to_string());
    (items[start.min(end)..end].to_vec(), next)
}

#[async_trait]
impl MailboxProvider for FakeMailbox {
    async fn profile(&self, _credentials: &Credentials) -> Result<Profile, ProviderError> {
        Ok(Profile {
            email_address: self.email.clone(),
            history_cursor: self.latest(),
        })
    }

    async fn watch(
        &self,
        _credentials: &Credentials,
        _topic: &str,
    ) -> Result<WatchResponse, ProviderError> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_watch.load(Ordering::SeqCst) {
            return Err(ProviderError::Connectivity("watch refused".into()));
        }
        Ok(WatchResponse {
            history_cursor: self.latest(),
            expiration: Utc::now() + Duration::days(7),
        })
    }

    async fn stop(&self, _credentials: &Credentials) -> Result<(), ProviderError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(ProviderError::Connectivity("stop refused".into()));
        }
        Ok(())
    }

    async fn list_history(
        &self,
        _credentials: &Credentials,
        start_cursor: u64,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, ProviderError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        if start_cursor < self.stale_below.load(Ordering::SeqCst) {
            return Err(ProviderError::NotFound(format!("history {start_cursor}")));
        }
        let mut entries: Vec<MessageRef> = self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.history_cursor > start_cursor)
            .cloned()
            .collect();
        entries.sort_by_key(|m| m.history_cursor);
        let (added, next_page_token) = page(&entries, page_token, self.page_size);
        Ok(HistoryPage {
            added,
            next_page_token,
            latest_cursor: self.latest(),
        })
    }

    async fn get_message(
        &self,
        _credentials: &Credentials,
        message_id: &str,
    ) -> Result<ProviderMessage, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.messages
            .lock()
            .unwrap()
            .get(message_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(message_id.to_string()))
    }

    async fn search_messages(
        &self,
        _credentials: &Credentials,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<MessageList, ProviderError> {
        let sender = query.trim_start_matches("from:").to_lowercase();
        let mut found: Vec<MessageRef> = self
            .messages
            .lock()
            .unwrap()
            .values()
            .filter(|m| {
                m.payload.as_ref().is_some_and(|p| {
                    p.headers
                        .iter()
                        .any(|h| h.name == "From" && h.value.to_lowercase().contains(&sender))
                })
            })
            .map(|m| MessageRef {
                id: m.id.clone(),
                thread_id: m.thread_id.clone(),
                history_cursor: 0,
            })
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        let (messages, next_page_token) = page(&found, page_token, self.page_size);
        Ok(MessageList {
            messages,
            next_page_token,
        })
    }
}
