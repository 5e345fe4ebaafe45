//! Update strategy: reconciles a freshly downloaded story with the
//! library entry it replaces or extends.
//!
//! Grounded in `root/app/update_strategies.py` (`AddFormatStrategy`,
//! `PreserveMetadataStrategy`, `RemoveAddStrategy`) plus a fourth `add_new`
//! strategy for stories with no prior library id.

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::config::MetadataMode;
use crate::library::{LibraryClient, LibraryError, StoryMetadata};

/// One of the four closed update strategies.
#[async_trait]
pub trait UpdateStrategy: Send + Sync {
    async fn execute(
        &self,
        library: &dyn LibraryClient,
        library_id: &str,
        epub_path: &Path,
    ) -> Result<(), LibraryError>;
}

/// Logs a before/after metadata diff at debug level, regardless of whether
/// fields end up preserved — matching the original's unconditional diff
/// logging for operational visibility.
async fn log_metadata_comparison(before: &StoryMetadata, after: &StoryMetadata) {
    for (field, before_value) in &before.custom_fields {
        match after.custom_fields.get(field) {
            Some(after_value) if after_value == before_value => {}
            Some(after_value) => debug!(field, before_value, after_value, "custom field changed"),
            None => debug!(field, before_value, "custom field lost"),
        }
    }
}

/// Removes the old library entry and re-adds the new download as a fresh
/// book. No metadata is restored; the diff is logged for visibility only.
pub struct RemoveAddStrategy;

#[async_trait]
impl UpdateStrategy for RemoveAddStrategy {
    async fn execute(&self, library: &dyn LibraryClient, library_id: &str, epub_path: &Path) -> Result<(), LibraryError> {
        let before = library.get_metadata(library_id).await?;
        library.remove(library_id).await?;
        let new_id = library.add(epub_path).await?;
        let after = library.get_metadata(&new_id).await?;
        log_metadata_comparison(&before, &after).await;
        Ok(())
    }
}

/// Removes and re-adds like [`RemoveAddStrategy`], but restores only the
/// `#`-prefixed custom fields captured before the swap (the original's
/// `PreserveMetadataStrategy`).
pub struct PreserveMetadataStrategy;

#[async_trait]
impl UpdateStrategy for PreserveMetadataStrategy {
    async fn execute(&self, library: &dyn LibraryClient, library_id: &str, epub_path: &Path) -> Result<(), LibraryError> {
        let before = library.get_metadata(library_id).await?;
        library.remove(library_id).await?;
        let new_id = library.add(epub_path).await?;

        let restored = StoryMetadata {
            title: None,
            custom_fields: before.custom_fields.clone(),
        };
        if !restored.custom_fields.is_empty() {
            library.set_metadata(&new_id, &restored).await?;
        }

        let after = library.get_metadata(&new_id).await?;
        log_metadata_comparison(&before, &after).await;
        Ok(())
    }
}

/// Replaces only the EPUB format in place, leaving the library record (and
/// all its metadata) untouched.
pub struct AddFormatStrategy;

#[async_trait]
impl UpdateStrategy for AddFormatStrategy {
    async fn execute(&self, library: &dyn LibraryClient, library_id: &str, epub_path: &Path) -> Result<(), LibraryError> {
        let before = library.get_metadata(library_id).await?;
        library.replace_format(library_id, epub_path).await?;
        let after = library.get_metadata(library_id).await?;
        log_metadata_comparison(&before, &after).await;
        Ok(())
    }
}

/// Adds a brand-new story with no prior library entry. Not present in the
/// original's closed set, since the original always operated on a
/// pre-existing `calibre_id`.
pub struct AddNewStrategy;

impl AddNewStrategy {
    /// Adds `epub_path` as a new library entry, returning its assigned id.
    pub async fn execute(&self, library: &dyn LibraryClient, epub_path: &Path) -> Result<String, LibraryError> {
        library.add(epub_path).await
    }
}

/// Selects the concrete strategy for a configured [`MetadataMode`].
#[must_use]
pub fn strategy_for(mode: MetadataMode) -> Box<dyn UpdateStrategy> {
    match mode {
        MetadataMode::RemoveAdd => Box::new(RemoveAddStrategy),
        MetadataMode::PreserveMetadata => Box::new(PreserveMetadataStrategy),
        MetadataMode::AddFormat => Box::new(AddFormatStrategy),
    }
}
