use super::session::{Safe, Session};
use super::{Command, Reply};
use crate::core::{Document, StoreError, StoreResult, from_document, query_to_string, to_document};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::VecDeque;
use tracing::trace;

const INVALID_DATABASE_CHARS: &[char] = &['/', '\\', '.', ' ', '"', '$', '\0'];
const INVALID_COLLECTION_CHARS: &[char] = &['$', '\0'];

fn validate_database_name(name: &str) -> StoreResult<()> {
    if name.is_empty() {
        return Err(StoreError::InvalidName("database name cannot be empty".into()));
    }
    if name.contains(INVALID_DATABASE_CHARS) {
        return Err(StoreError::InvalidName(format!(
            "database name '{}' contains an invalid character",
            name
        )));
    }
    Ok(())
}

fn validate_collection_name(name: &str) -> StoreResult<()> {
    if name.is_empty() {
        return Err(StoreError::InvalidName("collection name cannot be empty".into()));
    }
    if name.contains(INVALID_COLLECTION_CHARS) || name.starts_with("system.") {
        return Err(StoreError::InvalidName(format!(
            "collection name '{}' is reserved or invalid",
            name
        )));
    }
    Ok(())
}

fn unexpected(reply: Reply) -> StoreError {
    StoreError::InvalidDocument(format!("unexpected reply: {:?}", reply))
}

/// A database reached through a session.
#[derive(Debug)]
pub struct Database {
    session: Session,
    name: String,
}

impl Database {
    pub(crate) fn new(session: Session, name: &str) -> StoreResult<Self> {
        validate_database_name(name)?;
        Ok(Self {
            session,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self, name: &str) -> StoreResult<Collection> {
        validate_collection_name(name)?;
        Ok(Collection {
            session: self.session.share(),
            database: self.name.clone(),
            name: name.to_string(),
        })
    }

    pub async fn collection_names(&self) -> StoreResult<Vec<String>> {
        match self
            .session
            .run(Command::CollectionNames {
                database: self.name.clone(),
            })
            .await?
        {
            Reply::Names(names) => Ok(names),
            other => Err(unexpected(other)),
        }
    }

    pub async fn collection_exists(&self, name: &str) -> StoreResult<bool> {
        Ok(self.collection_names().await?.iter().any(|n| n == name))
    }
}

/// A collection bound to the socket reservation of the session it came from.
#[derive(Debug)]
pub struct Collection {
    session: Session,
    database: String,
    name: String,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// `database.collection`
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }

    fn concern(&self) -> super::WriteConcern {
        Safe::concern(self.session.safe())
    }

    async fn find_batch(
        &self,
        filter: Document,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Document>> {
        trace!(collection = %self.full_name(), query = %query_to_string(&filter), ?limit, "find");
        match self
            .session
            .run(Command::Find {
                database: self.database.clone(),
                collection: self.name.clone(),
                filter,
                limit,
                batch_size: None,
            })
            .await?
        {
            Reply::Batch { documents, .. } => Ok(documents),
            other => Err(unexpected(other)),
        }
    }

    /// The first matching document, or [`StoreError::NotFound`].
    pub async fn find_one(&self, filter: Document) -> StoreResult<Document> {
        self.find_batch(filter, Some(1))
            .await?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound)
    }

    pub async fn find_one_as<T: DeserializeOwned>(&self, filter: Document) -> StoreResult<T> {
        from_document(self.find_one(filter).await?)
    }

    pub async fn find(&self, filter: Document) -> StoreResult<Vec<Document>> {
        self.find_batch(filter, None).await
    }

    pub async fn find_as<T: DeserializeOwned>(&self, filter: Document) -> StoreResult<Vec<T>> {
        self.find(filter)
            .await?
            .into_iter()
            .map(from_document)
            .collect()
    }

    /// Open a server-side cursor that returns `batch_size` documents per round-trip.
    ///
    /// The cursor lives on the session's reserved socket; if the session moves
    /// to another socket (a monotonic session's first write, or close) further
    /// batches fail with [`StoreError::CursorNotFound`]. Dropping the cursor
    /// before it is exhausted kills it on the session's next request.
    pub async fn find_iter(&self, filter: Document, batch_size: usize) -> StoreResult<Cursor> {
        let batch_size = batch_size.max(1);
        trace!(
            collection = %self.full_name(),
            query = %query_to_string(&filter),
            batch_size,
            "find_iter"
        );
        match self
            .session
            .run(Command::Find {
                database: self.database.clone(),
                collection: self.name.clone(),
                filter,
                limit: None,
                batch_size: Some(batch_size),
            })
            .await?
        {
            Reply::Batch {
                documents,
                cursor_id,
            } => Ok(Cursor {
                session: self.session.share(),
                buffer: documents.into(),
                cursor_id,
                batch_size,
            }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn count(&self, filter: Document) -> StoreResult<u64> {
        trace!(collection = %self.full_name(), query = %query_to_string(&filter), "count");
        match self
            .session
            .run(Command::Count {
                database: self.database.clone(),
                collection: self.name.clone(),
                filter,
            })
            .await?
        {
            Reply::Count(count) => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    pub async fn insert(&self, document: Document) -> StoreResult<()> {
        self.insert_many(vec![document]).await
    }

    pub async fn insert_as<T: Serialize>(&self, value: &T) -> StoreResult<()> {
        self.insert(to_document(value)?).await
    }

    /// Insert in order, stopping at the first failure.
    pub async fn insert_many(&self, documents: Vec<Document>) -> StoreResult<()> {
        self.session
            .run(Command::Insert {
                database: self.database.clone(),
                collection: self.name.clone(),
                documents,
                concern: self.concern(),
            })
            .await?;
        Ok(())
    }

    async fn write_update(
        &self,
        selector: Document,
        update: Document,
        upsert: bool,
        multi: bool,
    ) -> StoreResult<Reply> {
        trace!(
            collection = %self.full_name(),
            selector = %query_to_string(&selector),
            update = %query_to_string(&update),
            upsert,
            multi,
            "update"
        );
        self.session
            .run(Command::Update {
                database: self.database.clone(),
                collection: self.name.clone(),
                selector,
                update,
                upsert,
                multi,
                concern: self.concern(),
            })
            .await
    }

    /// Update the first matching document; [`StoreError::NotFound`] when none matched.
    pub async fn update(&self, selector: Document, update: Document) -> StoreResult<()> {
        match self.write_update(selector, update, false, false).await? {
            Reply::Written { matched: 0, .. } => Err(StoreError::NotFound),
            _ => Ok(()),
        }
    }

    /// Update every matching document and return how many matched.
    pub async fn update_all(&self, selector: Document, update: Document) -> StoreResult<u64> {
        match self.write_update(selector, update, false, true).await? {
            Reply::Written { matched, .. } => Ok(matched),
            _ => Ok(0),
        }
    }

    /// Update the first match or insert a new document; returns the new `_id`
    /// when a document was inserted.
    pub async fn upsert(&self, selector: Document, update: Document) -> StoreResult<Option<Value>> {
        match self.write_update(selector, update, true, false).await? {
            Reply::Written { upserted_id, .. } => Ok(upserted_id),
            _ => Ok(None),
        }
    }

    async fn write_remove(&self, selector: Document, multi: bool) -> StoreResult<Reply> {
        trace!(
            collection = %self.full_name(),
            selector = %query_to_string(&selector),
            multi,
            "remove"
        );
        self.session
            .run(Command::Remove {
                database: self.database.clone(),
                collection: self.name.clone(),
                selector,
                multi,
                concern: self.concern(),
            })
            .await
    }

    /// Remove the first matching document; [`StoreError::NotFound`] when none matched.
    pub async fn remove(&self, selector: Document) -> StoreResult<()> {
        match self.write_remove(selector, false).await? {
            Reply::Written { matched: 0, .. } => Err(StoreError::NotFound),
            _ => Ok(()),
        }
    }

    pub async fn remove_all(&self, selector: Document) -> StoreResult<u64> {
        match self.write_remove(selector, true).await? {
            Reply::Written { matched, .. } => Ok(matched),
            _ => Ok(0),
        }
    }
}

/// Batched iteration over a server-side cursor.
#[derive(Debug)]
pub struct Cursor {
    session: Session,
    buffer: VecDeque<Document>,
    cursor_id: u64,
    batch_size: usize,
}

impl Cursor {
    pub fn is_exhausted(&self) -> bool {
        self.buffer.is_empty() && self.cursor_id == 0
    }

    pub async fn next(&mut self) -> StoreResult<Option<Document>> {
        if self.buffer.is_empty() && self.cursor_id != 0 {
            match self
                .session
                .run(Command::GetMore {
                    cursor_id: self.cursor_id,
                    batch_size: self.batch_size,
                })
                .await?
            {
                Reply::Batch {
                    documents,
                    cursor_id,
                } => {
                    self.buffer.extend(documents);
                    self.cursor_id = cursor_id;
                }
                other => return Err(unexpected(other)),
            }
        }
        Ok(self.buffer.pop_front())
    }

    pub async fn next_as<T: DeserializeOwned>(&mut self) -> StoreResult<Option<T>> {
        self.next().await?.map(from_document).transpose()
    }

    /// Drain the remaining documents.
    pub async fn collect(mut self) -> StoreResult<Vec<Document>> {
        let mut documents = Vec::new();
        while let Some(document) = self.next().await? {
            documents.push(document);
        }
        Ok(documents)
    }

    /// Release the server-side cursor now instead of on the next request.
    pub async fn close(mut self) -> StoreResult<()> {
        self.buffer.clear();
        if self.cursor_id != 0 {
            let cursor_id = std::mem::take(&mut self.cursor_id);
            self.session.run(Command::KillCursor { cursor_id }).await?;
        }
        Ok(())
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.cursor_id != 0 {
            self.session.abandon_cursor(self.cursor_id);
        }
    }
}
