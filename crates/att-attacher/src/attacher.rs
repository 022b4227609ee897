//! Attachment lifecycle of one record attribute
//!
//! An `Attacher` is bound to one `(record, attribute)` pair. Files are
//! assigned into the `cache` storage, validated, promoted into the `store`
//! storage and written to the record's `<name>_data` column as JSON.

use std::sync::Arc;

use att_core::config::AttacherSettings;
use att_core::RecordKey;
use att_storage::{LocationContext, StorageRegistry};
use tracing::{debug, info, instrument, warn};

use crate::background::{DestroyJob, Job, JobQueue, PromoteJob};
use crate::error::{AttachmentError, AttachmentResult};
use crate::file::UploadedFile;
use crate::record::{PersistenceError, RecordStore};
use crate::uploader::{MetadataExtractor, SignatureExtractor, UploadInput, Uploader};
use crate::validation::Validator;

/// Immutable per-attachment configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttacherConfig {
    /// Storage key of temporary storage
    pub cache: String,
    /// Storage key of permanent storage
    pub store: String,
    pub column_suffix: String,
    pub validate_on_assign: bool,
    /// Nest stored locations under `<class>/<id>/<name>/`
    pub pretty_location: bool,
    pub background_promotion: bool,
}

impl Default for AttacherConfig {
    fn default() -> Self {
        Self {
            cache: "cache".to_string(),
            store: "store".to_string(),
            column_suffix: "_data".to_string(),
            validate_on_assign: true,
            pretty_location: false,
            background_promotion: false,
        }
    }
}

impl From<&AttacherSettings> for AttacherConfig {
    fn from(settings: &AttacherSettings) -> Self {
        Self {
            column_suffix: settings.column_suffix.clone(),
            validate_on_assign: settings.validate_on_assign,
            background_promotion: settings.background_promotion,
            ..Self::default()
        }
    }
}

/// Everything attachers of one attribute share
#[derive(Debug, Clone)]
pub struct AttacherContext {
    config: AttacherConfig,
    uploader: Uploader,
    validator: Validator,
    jobs: Option<JobQueue>,
}

impl AttacherContext {
    pub fn new(config: AttacherConfig, storages: StorageRegistry) -> Self {
        Self {
            config,
            uploader: Uploader::new(storages),
            validator: Validator::new(),
            jobs: None,
        }
    }

    /// Context from application settings; adds the signature extractor when
    /// enabled
    pub fn from_settings(settings: &AttacherSettings, storages: StorageRegistry) -> Self {
        let ctx = Self::new(AttacherConfig::from(settings), storages);
        if settings.extract_signature {
            ctx.extractor(SignatureExtractor)
        } else {
            ctx
        }
    }

    pub fn validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn extractor(mut self, extractor: impl MetadataExtractor + 'static) -> Self {
        self.uploader = self.uploader.extractor(extractor);
        self
    }

    pub fn jobs(mut self, jobs: JobQueue) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Same context without a job queue, for use inside workers
    pub fn without_jobs(&self) -> Self {
        Self {
            jobs: None,
            ..self.clone()
        }
    }

    pub fn config(&self) -> &AttacherConfig {
        &self.config
    }

    pub fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    pub fn storages(&self) -> &StorageRegistry {
        self.uploader.storages()
    }

    /// Queue to use for background work, if backgrounding is on
    fn background_queue(&self) -> Option<&JobQueue> {
        if self.config.background_promotion {
            self.jobs.as_ref()
        } else {
            None
        }
    }
}

/// Lifecycle state of an attacher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttacherState {
    Empty,
    Cached,
    Promoting,
    Stored,
    Removed,
    ChangedDuringPromotion,
}

/// Controller of one attached file
#[derive(Debug)]
pub struct Attacher {
    pub(crate) ctx: Arc<AttacherContext>,
    pub(crate) record: RecordKey,
    pub(crate) name: String,
    pub(crate) file: Option<UploadedFile>,
    /// File replaced by the first `change` since the last finalize
    pub(crate) previous: Option<Option<UploadedFile>>,
    pub(crate) column_data: Option<String>,
    pub(crate) errors: Vec<String>,
    pub(crate) removed: bool,
    pub(crate) promoting: bool,
    pub(crate) conflicted: bool,
}

impl Attacher {
    pub fn new(record: RecordKey, name: impl Into<String>, ctx: Arc<AttacherContext>) -> Self {
        Self {
            ctx,
            record,
            name: name.into(),
            file: None,
            previous: None,
            column_data: None,
            errors: Vec::new(),
            removed: false,
            promoting: false,
            conflicted: false,
        }
    }

    /// Attacher initialised from the record's persisted column
    pub async fn load(
        store: &dyn RecordStore,
        record: RecordKey,
        name: impl Into<String>,
        ctx: Arc<AttacherContext>,
    ) -> AttachmentResult<Self> {
        let mut attacher = Self::new(record, name, ctx);
        let data = store
            .fetch(&attacher.record, &attacher.column())
            .await?
            .ok_or_else(|| PersistenceError::RecordNotFound(attacher.record.clone()))?;
        attacher.load_data(data.as_deref())?;
        Ok(attacher)
    }

    /// Replace the attacher's view with persisted column data
    pub fn load_data(&mut self, data: Option<&str>) -> AttachmentResult<()> {
        self.file = data.map(UploadedFile::from_json).transpose()?;
        self.column_data = data.map(str::to_string);
        self.previous = None;
        self.removed = false;
        self.conflicted = false;
        Ok(())
    }

    /// Name of the attachment column
    pub fn column(&self) -> String {
        format!("{}{}", self.name, self.ctx.config.column_suffix)
    }

    pub fn context(&self) -> &AttacherContext {
        &self.ctx
    }

    pub fn record(&self) -> &RecordKey {
        &self.record
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn location_context(&self) -> Option<LocationContext> {
        self.ctx
            .config
            .pretty_location
            .then(|| LocationContext::new(self.record.clone(), self.name.clone()))
    }

    /// Upload `input` to the cache and make it the current file
    #[instrument(skip(self, input), fields(record = %self.record, name = %self.name))]
    pub async fn assign(&mut self, input: UploadInput) -> AttachmentResult<UploadedFile> {
        let cache = self.ctx.config.cache.clone();
        let file = self
            .ctx
            .uploader
            .upload(&input, &cache, self.location_context().as_ref())
            .await?;

        self.accept(file.clone());
        debug!(id = %file.id(), "File assigned");
        Ok(file)
    }

    /// Accept data of a file cached by an earlier request
    pub async fn assign_cached(&mut self, data: &str) -> AttachmentResult<UploadedFile> {
        let file = UploadedFile::from_json(data)?;
        if file.storage_key() != self.ctx.config.cache {
            return Err(AttachmentError::InvalidFile(format!(
                "expected cached file, got storage {}",
                file.storage_key()
            )));
        }
        if !file.exists(self.ctx.storages()).await? {
            return Err(AttachmentError::InvalidFile(format!(
                "cached file {} does not exist",
                file.id()
            )));
        }

        self.accept(file.clone());
        Ok(file)
    }

    fn accept(&mut self, file: UploadedFile) {
        self.errors.clear();
        self.change(Some(file));
        if self.ctx.config.validate_on_assign {
            self.validate();
        }
    }

    /// Upload `input` directly into any registered storage
    pub async fn attach(
        &mut self,
        input: UploadInput,
        storage_key: &str,
    ) -> AttachmentResult<UploadedFile> {
        let file = self
            .ctx
            .uploader
            .upload(&input, storage_key, self.location_context().as_ref())
            .await?;
        self.change(Some(file.clone()));
        Ok(file)
    }

    /// Replace the current file without tracking the change
    pub fn set(&mut self, file: Option<UploadedFile>) {
        self.file = file;
        self.write();
    }

    /// Replace the current file, remembering the replaced one
    pub fn change(&mut self, file: Option<UploadedFile>) {
        if self.file == file {
            return;
        }
        if self.previous.is_none() {
            self.previous = Some(self.file.clone());
        }
        self.removed = false;
        self.conflicted = false;
        self.set(file);
    }

    /// Stage removal of the current file
    pub fn remove(&mut self) {
        self.change(None);
        self.removed = true;
    }

    pub fn file(&self) -> Option<&UploadedFile> {
        self.file.as_ref()
    }

    pub fn is_attached(&self) -> bool {
        self.file.is_some()
    }

    pub fn is_cached(&self) -> bool {
        self.file
            .as_ref()
            .is_some_and(|f| f.storage_key() == self.ctx.config.cache)
    }

    pub fn is_stored(&self) -> bool {
        self.file
            .as_ref()
            .is_some_and(|f| f.storage_key() == self.ctx.config.store)
    }

    pub fn is_changed(&self) -> bool {
        self.previous.is_some()
    }

    pub fn state(&self) -> AttacherState {
        if self.conflicted {
            return AttacherState::ChangedDuringPromotion;
        }
        if self.promoting {
            return AttacherState::Promoting;
        }
        match &self.file {
            None if self.removed => AttacherState::Removed,
            None => AttacherState::Empty,
            Some(_) if self.is_cached() => AttacherState::Cached,
            Some(_) => AttacherState::Stored,
        }
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Run the validator against the current file
    pub fn validate(&mut self) -> &[String] {
        self.errors = match &self.file {
            Some(file) => self.ctx.validator.validate(file),
            None => Vec::new(),
        };
        &self.errors
    }

    /// Copy `file` into the store. The attacher is not modified.
    #[instrument(skip(self, file), fields(record = %self.record, id = %file.id()))]
    pub async fn promote(&self, file: &UploadedFile) -> AttachmentResult<UploadedFile> {
        let stored = self
            .ctx
            .uploader
            .transfer(file, &self.ctx.config.store, self.location_context().as_ref())
            .await?;
        debug!(stored = %stored.id(), "File promoted");
        Ok(stored)
    }

    /// Promote the current file in place when it is cached
    pub async fn promote_cached(&mut self) -> AttachmentResult<()> {
        let Some(file) = self.file.clone().filter(|_| self.is_cached()) else {
            return Ok(());
        };
        let stored = self.promote(&file).await?;
        self.set(Some(stored));
        Ok(())
    }

    /// Work after the record was saved: delete the replaced file and
    /// promote the new one, in the background when configured
    pub async fn finalize(&mut self) -> AttachmentResult<()> {
        self.destroy_previous().await?;

        if self.is_cached() {
            let enqueued = match (self.ctx.background_queue(), self.promote_job()) {
                (Some(queue), Some(job)) => {
                    queue.enqueue(Job::Promote(job))?;
                    debug!(record = %self.record, name = %self.name, "Promotion enqueued");
                    true
                }
                _ => false,
            };
            if !enqueued {
                self.promote_cached().await?;
            }
        }

        self.previous = None;
        Ok(())
    }

    /// Background payload promoting the current file
    pub fn promote_job(&self) -> Option<PromoteJob> {
        self.file.as_ref().map(|file| PromoteJob {
            record_class: self.record.record_class.clone(),
            record_id: self.record.record_id,
            attribute_name: self.name.clone(),
            attachment: file.clone(),
        })
    }

    /// Serialized current file
    pub fn data(&self) -> Option<String> {
        self.file.as_ref().map(UploadedFile::to_json)
    }

    /// Write the current file into the in-memory column value
    pub fn write(&mut self) {
        self.column_data = self.data();
    }

    pub fn column_data(&self) -> Option<&str> {
        self.column_data.as_deref()
    }

    /// Save the column value without any concurrency check
    pub async fn persist(&mut self, store: &dyn RecordStore) -> AttachmentResult<()> {
        self.write();
        store
            .save(&self.record, &self.column(), self.column_data.clone())
            .await?;
        Ok(())
    }

    /// Delete the file replaced since the last finalize
    pub async fn destroy_previous(&mut self) -> AttachmentResult<()> {
        if let Some(Some(previous)) = self.previous.take() {
            if Some(&previous) != self.file.as_ref() {
                self.destroy_if_stored(previous).await?;
            }
        }
        Ok(())
    }

    /// Delete the current file when it is in permanent storage
    pub async fn destroy_attached(&mut self) -> AttachmentResult<()> {
        match self.file.clone() {
            Some(file) => self.destroy_if_stored(file).await,
            None => Ok(()),
        }
    }

    async fn destroy_if_stored(&self, file: UploadedFile) -> AttachmentResult<()> {
        if file.storage_key() != self.ctx.config.store {
            return Ok(());
        }
        match self.ctx.background_queue() {
            Some(queue) => queue.enqueue(Job::Destroy(DestroyJob { attachment: file })),
            None => delete_file(self.ctx.storages(), &file).await,
        }
    }

    /// Delete the current file from its storage. Missing files are ignored.
    #[instrument(skip(self), fields(record = %self.record, name = %self.name))]
    pub async fn destroy(&self) -> AttachmentResult<()> {
        match &self.file {
            Some(file) => delete_file(self.ctx.storages(), file).await,
            None => Ok(()),
        }
    }

    /// Enqueue deletion of the current file. Fails with `NoJobQueue` when the
    /// context has no queue to hand the job to.
    pub fn destroy_background(&self) -> AttachmentResult<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let queue = self.ctx.jobs.as_ref().ok_or(AttachmentError::NoJobQueue)?;
        queue.enqueue(Job::Destroy(DestroyJob {
            attachment: file.clone(),
        }))
    }

    pub fn url(&self) -> AttachmentResult<Option<String>> {
        self.file
            .as_ref()
            .map(|file| file.url(self.ctx.storages()))
            .transpose()
    }
}

/// Delete `file`, treating an already missing file as deleted
pub(crate) async fn delete_file(
    storages: &StorageRegistry,
    file: &UploadedFile,
) -> AttachmentResult<()> {
    match file.delete(storages).await {
        Ok(()) => {
            info!(id = %file.id(), storage = %file.storage_key(), "File deleted");
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            warn!(id = %file.id(), storage = %file.storage_key(), "File already deleted");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MemoryRecordStore;
    use att_storage::{MemoryStorage, Storage};

    struct Fixture {
        cache: Arc<MemoryStorage>,
        store: Arc<MemoryStorage>,
        ctx: AttacherContext,
    }

    fn fixture() -> Fixture {
        let cache = Arc::new(MemoryStorage::new());
        let store = Arc::new(MemoryStorage::new());
        let storages = StorageRegistry::new()
            .with("cache", cache.clone())
            .with("store", store.clone());
        Fixture {
            cache,
            store,
            ctx: AttacherContext::new(AttacherConfig::default(), storages),
        }
    }

    fn attacher(ctx: AttacherContext) -> Attacher {
        Attacher::new(RecordKey::new("Photo", 1), "image", Arc::new(ctx))
    }

    fn jpeg(size: usize) -> UploadInput {
        UploadInput::new(vec![0u8; size]).with_filename("a.jpg")
    }

    #[tokio::test]
    async fn test_assign_caches_file() {
        let fx = fixture();
        let mut attacher = attacher(fx.ctx);
        assert_eq!(attacher.state(), AttacherState::Empty);

        let file = attacher.assign(jpeg(10)).await.unwrap();
        assert_eq!(file.storage_key(), "cache");
        assert!(fx.cache.exists(file.id()).await.unwrap());
        assert_eq!(attacher.state(), AttacherState::Cached);
        assert!(attacher.is_changed());
        assert_eq!(attacher.column_data(), Some(file.to_json().as_str()));
    }

    #[tokio::test]
    async fn test_assign_validates_and_clears_errors() {
        let fx = fixture();
        let ctx = fx.ctx.validator(Validator::new().max_size(1000));
        let mut attacher = attacher(ctx);

        attacher.assign(jpeg(5000)).await.unwrap();
        assert_eq!(attacher.errors(), ["size must not be greater than 1.0 KB"]);

        attacher.assign(jpeg(10)).await.unwrap();
        assert!(attacher.errors().is_empty());
    }

    #[tokio::test]
    async fn test_validation_can_be_deferred() {
        let mut fx = fixture();
        fx.ctx.config.validate_on_assign = false;
        let ctx = fx.ctx.validator(Validator::new().max_size(1000));
        let mut attacher = attacher(ctx);

        attacher.assign(jpeg(5000)).await.unwrap();
        assert!(attacher.errors().is_empty());
        assert_eq!(attacher.validate().len(), 1);
    }

    #[tokio::test]
    async fn test_assign_cached_rejects_foreign_storage() {
        let fx = fixture();
        let mut attacher = attacher(fx.ctx);

        let result = attacher
            .assign_cached(r#"{"id":"x.jpg","storage":"store","metadata":{}}"#)
            .await;
        assert!(matches!(result, Err(AttachmentError::InvalidFile(_))));

        let result = attacher
            .assign_cached(r#"{"id":"missing.jpg","storage":"cache","metadata":{}}"#)
            .await;
        assert!(matches!(result, Err(AttachmentError::InvalidFile(_))));
        assert!(!attacher.is_attached());
    }

    #[tokio::test]
    async fn test_assign_cached_accepts_existing_file() {
        let fx = fixture();
        fx.cache.upload("abc.jpg", "x".into()).await.unwrap();
        let mut attacher = attacher(fx.ctx);

        let file = attacher
            .assign_cached(r#"{"id":"abc.jpg","storage":"cache","metadata":{"size":1}}"#)
            .await
            .unwrap();
        assert_eq!(attacher.file(), Some(&file));
        assert!(attacher.is_cached());
    }

    #[tokio::test]
    async fn test_promote_does_not_mutate() {
        let fx = fixture();
        let mut attacher = attacher(fx.ctx);
        let cached = attacher.assign(jpeg(10)).await.unwrap();

        let stored = attacher.promote(&cached).await.unwrap();
        assert_eq!(stored.storage_key(), "store");
        assert!(fx.store.exists(stored.id()).await.unwrap());
        assert_eq!(attacher.file(), Some(&cached));
    }

    #[tokio::test]
    async fn test_pretty_location() {
        let mut fx = fixture();
        fx.ctx.config.pretty_location = true;
        let mut attacher = attacher(fx.ctx);

        let cached = attacher.assign(jpeg(10)).await.unwrap();
        assert!(cached.id().starts_with("photo/1/image/"));
        assert!(cached.id().ends_with(".jpg"));
    }

    #[tokio::test]
    async fn test_finalize_promotes_and_destroys_previous() {
        let fx = fixture();
        let mut attacher = attacher(fx.ctx);

        attacher.attach(jpeg(1), "store").await.unwrap();
        attacher.finalize().await.unwrap();
        let old = attacher.file().cloned().unwrap();
        assert!(!attacher.is_changed());

        attacher.assign(jpeg(2)).await.unwrap();
        attacher.finalize().await.unwrap();

        assert!(attacher.is_stored());
        assert!(!fx.store.exists(old.id()).await.unwrap());
        assert_eq!(fx.store.len().await, 1);
        assert!(!attacher.is_changed());
    }

    #[tokio::test]
    async fn test_finalize_enqueues_when_backgrounded() {
        let mut fx = fixture();
        fx.ctx.config.background_promotion = true;
        let (queue, mut receiver) = JobQueue::channel();
        let mut attacher = attacher(fx.ctx.jobs(queue));

        let cached = attacher.assign(jpeg(10)).await.unwrap();
        attacher.finalize().await.unwrap();

        assert!(attacher.is_cached());
        match receiver.try_recv().unwrap() {
            Job::Promote(job) => {
                assert_eq!(job.record_class, "Photo");
                assert_eq!(job.record_id, 1);
                assert_eq!(job.attribute_name, "image");
                assert_eq!(job.attachment, cached);
            }
            other => panic!("unexpected job {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remove_and_persist() {
        let fx = fixture();
        let records = MemoryRecordStore::new();
        records.insert(RecordKey::new("Photo", 1)).unwrap();

        let mut attacher = attacher(fx.ctx);
        attacher.attach(jpeg(1), "store").await.unwrap();
        attacher.persist(&records).await.unwrap();

        attacher.remove();
        assert_eq!(attacher.state(), AttacherState::Removed);
        attacher.persist(&records).await.unwrap();

        let column = records
            .fetch(&RecordKey::new("Photo", 1), "image_data")
            .await
            .unwrap();
        assert_eq!(column, Some(None));
    }

    #[tokio::test]
    async fn test_load_parses_column() {
        let fx = fixture();
        let records = MemoryRecordStore::new();
        let key = RecordKey::new("Photo", 1);
        records.insert(key.clone()).unwrap();
        records
            .save(&key, "image_data", Some(r#"{"id":"a.jpg","storage":"store"}"#.into()))
            .await
            .unwrap();

        let attacher = Attacher::load(&records, key, "image", Arc::new(fx.ctx))
            .await
            .unwrap();
        assert_eq!(attacher.state(), AttacherState::Stored);
        assert_eq!(attacher.file().map(|f| f.id()), Some("a.jpg"));
        assert!(!attacher.is_changed());
    }

    #[tokio::test]
    async fn test_load_missing_record() {
        let fx = fixture();
        let records = MemoryRecordStore::new();
        let result =
            Attacher::load(&records, RecordKey::new("Photo", 9), "image", Arc::new(fx.ctx)).await;
        assert!(matches!(
            result,
            Err(AttachmentError::PersistenceError(PersistenceError::RecordNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let fx = fixture();
        let mut attacher = attacher(fx.ctx);
        let file = attacher.attach(jpeg(1), "store").await.unwrap();

        attacher.destroy().await.unwrap();
        attacher.destroy().await.unwrap();
        assert!(!fx.store.exists(file.id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_destroy_background_requires_queue() {
        let fx = fixture();
        let mut inline = attacher(fx.ctx.clone());
        assert!(inline.destroy_background().is_ok());

        let file = inline.attach(jpeg(1), "store").await.unwrap();
        assert!(matches!(
            inline.destroy_background(),
            Err(AttachmentError::NoJobQueue)
        ));
        assert!(fx.store.exists(file.id()).await.unwrap());

        let (queue, mut receiver) = JobQueue::channel();
        let mut queued = attacher(fx.ctx.jobs(queue));
        queued.set(Some(file.clone()));
        queued.destroy_background().unwrap();
        match receiver.try_recv().unwrap() {
            Job::Destroy(job) => assert_eq!(job.attachment, file),
            other => panic!("unexpected job {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_destroy_attached_skips_cached_files() {
        let fx = fixture();
        let mut attacher = attacher(fx.ctx);
        let cached = attacher.assign(jpeg(1)).await.unwrap();

        attacher.destroy_attached().await.unwrap();
        assert!(fx.cache.exists(cached.id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_url() {
        let fx = fixture();
        let mut attacher = attacher(fx.ctx);
        assert_eq!(attacher.url().unwrap(), None);

        let file = attacher.attach(jpeg(1), "store").await.unwrap();
        assert_eq!(
            attacher.url().unwrap(),
            Some(format!("memory://{}", file.id()))
        );
    }

    #[test]
    fn test_config_from_settings() {
        let settings = AttacherSettings {
            column_suffix: "_json".to_string(),
            validate_on_assign: false,
            extract_signature: true,
            background_promotion: true,
        };
        let config = AttacherConfig::from(&settings);
        assert_eq!(config.column_suffix, "_json");
        assert!(!config.validate_on_assign);
        assert!(config.background_promotion);
        assert_eq!(config.cache, "cache");

        let ctx = AttacherContext::from_settings(&settings, StorageRegistry::new());
        let attacher = Attacher::new(RecordKey::new("Photo", 1), "image", Arc::new(ctx));
        assert_eq!(attacher.column(), "image_json");
    }
}
