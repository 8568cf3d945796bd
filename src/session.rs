//! In-memory review sessions.
//!
//! Each session exclusively owns its uploads, extraction record and chat
//! history. Nothing is persisted: removing a session drops everything.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

use crate::chat::ChatMessage;
use crate::documents::LoadedDocument;
use crate::guidelines::Guidelines;
use crate::ocr::OcrDocument;
use crate::schema::{now_rfc3339, ExtractionRecord, UserInfo};

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub created_at: String,
    pub user: UserInfo,
    pub document: Option<LoadedDocument>,
    pub record: Option<ExtractionRecord>,
    /// Name of the uploaded extraction file, used for the export filename.
    pub extraction_filename: Option<String>,
    pub ocr: Option<OcrDocument>,
    pub guidelines: Option<Guidelines>,
    pub chat_history: Vec<ChatMessage>,
}

impl Session {
    fn new(user: UserInfo) -> Self {
        Self {
            id: format!("rev_{}", Uuid::new_v4().simple()),
            created_at: now_rfc3339(),
            user,
            document: None,
            record: None,
            extraction_filename: None,
            ocr: None,
            guidelines: None,
            chat_history: Vec::new(),
        }
    }

    /// Document reference for new provenance entries: the source document if
    /// one is loaded, otherwise the extraction file itself.
    pub fn document_reference(&self) -> String {
        match (&self.document, &self.extraction_filename) {
            (Some(doc), _) => doc.reference(),
            (None, Some(name)) => name.clone(),
            (None, None) => String::new(),
        }
    }

    /// Install a freshly parsed extraction record.
    pub fn set_record(&mut self, filename: &str, mut record: ExtractionRecord) {
        self.extraction_filename = Some(filename.to_string());
        record.source_document = self.document_reference();
        self.record = Some(record);
    }

    /// Install a document and point the record's provenance at it.
    pub fn set_document(&mut self, document: LoadedDocument) {
        self.document = Some(document);
        let reference = self.document_reference();
        if let Some(record) = self.record.as_mut() {
            record.source_document = reference;
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            created_at: self.created_at.clone(),
            user: self.user.clone(),
            document: self.document.as_ref().map(|d| d.filename.clone()),
            extraction: self.extraction_filename.clone(),
            field_count: self.record.as_ref().map(|r| r.fields().len()).unwrap_or(0),
            provenance_count: self
                .record
                .as_ref()
                .map(|r| r.provenance().len())
                .unwrap_or(0),
            ocr: self.ocr.as_ref().map(|o| o.filename.clone()),
            ocr_token_count: self.ocr.as_ref().map(|o| o.tokens.len()).unwrap_or(0),
            ocr_pages: self.ocr.as_ref().map(OcrDocument::page_count).unwrap_or(0),
            guidelines: self.guidelines.as_ref().map(|g| g.filename.clone()),
            chat_messages: self.chat_history.len(),
        }
    }
}

/// What is loaded in a session, without the payloads.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: String,
    pub user: UserInfo,
    pub document: Option<String>,
    pub extraction: Option<String>,
    pub field_count: usize,
    pub provenance_count: usize,
    pub ocr: Option<String>,
    pub ocr_token_count: usize,
    pub ocr_pages: u32,
    pub guidelines: Option<String>,
    pub chat_messages: usize,
}

/// Shared map of live sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session for `user`, returning its id.
    pub fn create(&self, user: UserInfo) -> String {
        let session = Session::new(user);
        let id = session.id.clone();
        let mut sessions = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(id.clone(), session);
        tracing::debug!("SessionStore: opened '{}' ({} live)", id, sessions.len());
        id
    }

    /// Run `f` against a session under the read lock.
    pub fn with<R>(&self, id: &str, f: impl FnOnce(&Session) -> R) -> Option<R> {
        let sessions = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(id).map(f)
    }

    /// Run `f` against a session under the write lock.
    pub fn with_mut<R>(&self, id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut sessions = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        sessions.get_mut(id).map(f)
    }

    /// Drop a session and everything uploaded to it. Returns true if it existed.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some();
        if removed {
            tracing::debug!("SessionStore: closed '{}'", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
