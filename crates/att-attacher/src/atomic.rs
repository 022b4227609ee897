//! Atomic promotion
//!
//! Promotion copies the cached file into the store without holding any
//! lock. Only then is the record reloaded, compared against the file the
//! promotion started from and written, all under the reload strategy's
//! guard. If the persisted attachment changed in the meantime the write is
//! abandoned with `AttachmentChanged` and the later change wins.

use std::sync::Arc;

use att_core::RecordKey;
use tracing::{debug, info, instrument, warn};

use crate::attacher::{delete_file, Attacher, AttacherContext};
use crate::error::{AttachmentError, AttachmentResult};
use crate::file::UploadedFile;
use crate::record::{AtomicOptions, PersistStrategy, PersistenceError, RecordStore, ReloadStrategy};

const RECORD_MISSING: &str = "record is missing";
const ATTACHMENT_CHANGED: &str = "attachment has changed";

impl Attacher {
    /// Attacher for a background job, failing when the persisted file is no
    /// longer `file`
    pub async fn retrieve(
        store: &dyn RecordStore,
        record: RecordKey,
        name: impl Into<String>,
        file: &UploadedFile,
        ctx: Arc<AttacherContext>,
    ) -> AttachmentResult<Self> {
        let attacher = match Attacher::load(store, record, name, ctx).await {
            Ok(attacher) => attacher,
            Err(AttachmentError::PersistenceError(PersistenceError::RecordNotFound(_))) => {
                return Err(AttachmentError::AttachmentChanged(RECORD_MISSING.into()))
            }
            Err(AttachmentError::Serialization(_)) => {
                return Err(AttachmentError::AttachmentChanged(ATTACHMENT_CHANGED.into()))
            }
            Err(e) => return Err(e),
        };

        if attacher.file() != Some(file) {
            return Err(AttachmentError::AttachmentChanged(ATTACHMENT_CHANGED.into()));
        }
        Ok(attacher)
    }

    /// Promote the cached file and persist it if the record still holds it.
    ///
    /// On `AttachmentChanged` the promoted copy is deleted again and the
    /// attacher reports `ChangedDuringPromotion`; the record is untouched.
    #[instrument(skip(self, store), fields(record = %self.record, name = %self.name))]
    pub async fn atomic_promote(
        &mut self,
        store: &dyn RecordStore,
        options: AtomicOptions,
    ) -> AttachmentResult<UploadedFile> {
        let original = match &self.file {
            Some(file) if self.is_cached() => file.clone(),
            _ => {
                return Err(AttachmentError::InvalidFile(
                    "only cached files can be promoted".into(),
                ))
            }
        };

        self.promoting = true;
        self.conflicted = false;

        let promoted = match self.promote(&original).await {
            Ok(file) => file,
            Err(e) => {
                self.promoting = false;
                return Err(e);
            }
        };

        let result = self
            .atomic_persist(store, Some(&original), Some(promoted.clone()), options)
            .await;
        self.promoting = false;

        match result {
            Ok(()) => {
                info!(id = %promoted.id(), "Attachment promoted");
                Ok(promoted)
            }
            Err(e) if e.is_attachment_changed() => {
                self.conflicted = true;
                info!(reason = %e, "Attachment changed during promotion, discarding");
                if let Err(err) = delete_file(self.ctx.storages(), &promoted).await {
                    warn!(id = %promoted.id(), error = %err, "Failed to delete promoted file");
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Replace `original` with `new_file` on the record.
    ///
    /// Fails with `AttachmentChanged` when the persisted attachment is no
    /// longer `original` or the record is gone. The attacher only takes the
    /// new file after the write succeeded.
    pub async fn atomic_persist(
        &mut self,
        store: &dyn RecordStore,
        original: Option<&UploadedFile>,
        new_file: Option<UploadedFile>,
        options: AtomicOptions,
    ) -> AttachmentResult<()> {
        let column = self.column();
        let data = new_file.as_ref().map(UploadedFile::to_json);

        match options.reload {
            ReloadStrategy::Skip => {
                warn!(
                    record = %self.record,
                    column = %column,
                    "Persisting attachment without reload, concurrent changes are not detected"
                );
                if options.persist == PersistStrategy::Save {
                    store.save(&self.record, &column, data.clone()).await?;
                }
            }
            ReloadStrategy::Lock | ReloadStrategy::Refetch => {
                let locked = options.reload == ReloadStrategy::Lock;
                let guard = store.reload(&self.record, &column, locked).await?;

                if !guard.exists() {
                    guard.release().await?;
                    return Err(AttachmentError::AttachmentChanged(RECORD_MISSING.into()));
                }

                let unchanged = match guard.data() {
                    Some(persisted) => UploadedFile::from_json(persisted).ok().as_ref() == original,
                    None => original.is_none(),
                };
                if !unchanged {
                    guard.release().await?;
                    return Err(AttachmentError::AttachmentChanged(ATTACHMENT_CHANGED.into()));
                }

                match options.persist {
                    PersistStrategy::Save => {
                        guard.write(data.clone()).await.map_err(|e| match e {
                            PersistenceError::RecordNotFound(_) => {
                                AttachmentError::AttachmentChanged(RECORD_MISSING.into())
                            }
                            e => e.into(),
                        })?;
                    }
                    PersistStrategy::Skip => guard.release().await?,
                }
            }
        }

        debug!(record = %self.record, column = %column, "Attachment persisted");
        self.file = new_file;
        self.column_data = data;
        Ok(())
    }

    /// Compare-and-swap the persisted attachment from the current file to
    /// `new_file`. Returns `false` when the record changed.
    pub async fn swap(
        &mut self,
        store: &dyn RecordStore,
        new_file: Option<UploadedFile>,
        options: AtomicOptions,
    ) -> AttachmentResult<bool> {
        let original = self.file.clone();
        match self
            .atomic_persist(store, original.as_ref(), new_file, options)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.is_attachment_changed() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
