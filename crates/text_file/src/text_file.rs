mod encoding;
mod subscription;
#[cfg(test)]
mod tests;

pub use encoding::{decode, encode, CharacterEncoding, LineEnding};
pub use subscription::{Subscription, Topic};

use anyhow::{anyhow, Context as _, Result};
use fs::{Fs, Metadata, ReadOptions, WriteOptions};
use parking_lot::Mutex;
use ropey::Rope;
use serde::{Deserialize, Serialize};
use std::{
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};
use util::{post_inc, ResultExt as _};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Capability {
    ReadWrite,
    ReadOnly,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Saved,
    Dirty,
    PendingSave,
    Conflict,
    Error,
}

#[derive(Copy, Clone, Default)]
pub struct SaveOptions {
    /// Write even when the model has no unsaved changes.
    pub force: bool,
}

#[derive(Copy, Clone, Default)]
pub struct RevertOptions {
    /// Keep the in-memory content and only rebaseline the dirty flag,
    /// without going back to the content store.
    pub soft: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EncodingMode {
    /// Re-encode the current content under the new encoding, writing it out
    /// immediately.
    Encode,
    /// Reinterpret the stored bytes under the new encoding, discarding any
    /// in-memory edits.
    Decode,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TextFileEvent {
    Edited,
    DirtyChanged(bool),
    Saved,
    SaveFailed { conflict: bool },
    Reverted,
    EncodingChanged(CharacterEncoding),
    Closed,
}

/// A hook that runs before a model's content is persisted. Participants may
/// edit the model; they must not call back into `save`.
#[async_trait::async_trait]
pub trait SaveParticipant: Send + Sync {
    async fn will_save(&self, model: &TextFileModel) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct TextFileSnapshot {
    pub text: Rope,
    pub version: usize,
    pub encoding: CharacterEncoding,
    pub line_ending: LineEnding,
}

/// The in-memory working copy of one file, tracking its content and its
/// persistence lifecycle across loads, edits, saves, conflicts, and reverts.
///
/// All collaborators are constructor-injected; the model holds no global
/// state. Bookkeeping is synchronous under an internal lock, while reads and
/// writes await the injected [`Fs`]. At most one save is in flight per model;
/// concurrent `save` calls queue behind it and coalesce.
pub struct TextFileModel {
    resource: PathBuf,
    fs: Arc<dyn Fs>,
    capability: Capability,
    participants: Mutex<Vec<Arc<dyn SaveParticipant>>>,
    state: Mutex<ModelState>,
    save_gate: futures::lock::Mutex<()>,
    subscriptions: Topic,
}

struct ModelState {
    content: Rope,
    encoding: CharacterEncoding,
    line_ending: LineEnding,
    version: usize,
    saved_version: usize,
    explicitly_dirty: bool,
    stat: Option<Metadata>,
    last_save_attempt_at: Option<SystemTime>,
    file_state: FileState,
    loaded: bool,
    disposed: bool,
    // Bumped whenever the persistence baseline is replaced out from under a
    // pending save (load, revert, dispose). A save whose epoch no longer
    // matches discards its completion.
    save_epoch: usize,
}

impl ModelState {
    fn has_unsaved_edits(&self) -> bool {
        self.loaded && (self.explicitly_dirty || self.version != self.saved_version)
    }
}

impl TextFileModel {
    pub fn new(
        resource: impl Into<PathBuf>,
        fs: Arc<dyn Fs>,
        capability: Capability,
    ) -> Arc<Self> {
        Arc::new(Self {
            resource: resource.into(),
            fs,
            capability,
            participants: Default::default(),
            state: Mutex::new(ModelState {
                content: Rope::new(),
                encoding: Default::default(),
                line_ending: Default::default(),
                version: 0,
                saved_version: 0,
                explicitly_dirty: false,
                stat: None,
                last_save_attempt_at: None,
                file_state: FileState::Saved,
                loaded: false,
                disposed: false,
                save_epoch: 0,
            }),
            save_gate: Default::default(),
            subscriptions: Default::default(),
        })
    }

    pub async fn open(
        resource: impl Into<PathBuf>,
        fs: Arc<dyn Fs>,
        capability: Capability,
    ) -> Result<Arc<Self>> {
        let this = Self::new(resource, fs, capability);
        this.load().await?;
        Ok(this)
    }

    pub fn resource(&self) -> &Path {
        &self.resource
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscriptions.subscribe()
    }

    pub fn add_save_participant(&self, participant: Arc<dyn SaveParticipant>) {
        self.participants.lock().push(participant);
    }

    pub fn is_readonly(&self) -> bool {
        self.capability == Capability::ReadOnly
    }

    pub fn is_dirty(&self) -> bool {
        if self.is_readonly() {
            return false;
        }
        self.state.lock().has_unsaved_edits()
    }

    pub fn state(&self) -> FileState {
        self.state.lock().file_state
    }

    pub fn has_state(&self, file_state: FileState) -> bool {
        self.state() == file_state
    }

    pub fn stat(&self) -> Option<Metadata> {
        self.state.lock().stat
    }

    pub fn last_save_attempt_time(&self) -> Option<SystemTime> {
        self.state.lock().last_save_attempt_at
    }

    pub fn version(&self) -> usize {
        self.state.lock().version
    }

    pub fn encoding(&self) -> CharacterEncoding {
        self.state.lock().encoding
    }

    pub fn line_ending(&self) -> LineEnding {
        self.state.lock().line_ending
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    pub fn text(&self) -> String {
        self.state.lock().content.to_string()
    }

    pub fn snapshot(&self) -> TextFileSnapshot {
        let state = self.state.lock();
        TextFileSnapshot {
            text: state.content.clone(),
            version: state.version,
            encoding: state.encoding,
            line_ending: state.line_ending,
        }
    }

    /// Replaces the text in the given char range.
    pub fn edit(&self, range: Range<usize>, new_text: &str) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.content.remove(range.clone());
        state.content.insert(range.start, new_text);
        let events = self.did_edit(&mut state);
        drop(state);
        self.subscriptions.publish(events);
    }

    pub fn set_text(&self, text: impl AsRef<str>) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.content = Rope::from_str(text.as_ref());
        let events = self.did_edit(&mut state);
        drop(state);
        self.subscriptions.publish(events);
    }

    fn did_edit(&self, state: &mut ModelState) -> Vec<TextFileEvent> {
        let was_dirty = self.capability == Capability::ReadWrite && state.has_unsaved_edits();
        post_inc(&mut state.version);
        let mut events = vec![TextFileEvent::Edited];
        if self.capability == Capability::ReadWrite {
            if state.loaded && state.file_state == FileState::Saved {
                state.file_state = FileState::Dirty;
            }
            if !was_dirty && state.has_unsaved_edits() {
                events.push(TextFileEvent::DirtyChanged(true));
            }
        }
        events
    }

    /// Marks the model dirty (or clean) without a content change, for
    /// callers that mutate state through side channels. A no-op until the
    /// first load completes: there is no baseline to be dirty against.
    pub fn set_dirty(&self, dirty: bool) {
        if self.is_readonly() {
            return;
        }
        let mut state = self.state.lock();
        if state.disposed || !state.loaded {
            return;
        }
        let was_dirty = state.has_unsaved_edits();
        if dirty {
            state.explicitly_dirty = true;
            if state.file_state == FileState::Saved {
                state.file_state = FileState::Dirty;
            }
        } else {
            state.explicitly_dirty = false;
            state.saved_version = state.version;
            if matches!(
                state.file_state,
                FileState::Dirty | FileState::Conflict | FileState::Error
            ) {
                state.file_state = FileState::Saved;
            }
        }
        let is_dirty = state.has_unsaved_edits();
        drop(state);
        if was_dirty != is_dirty {
            self.subscriptions
                .publish([TextFileEvent::DirtyChanged(is_dirty)]);
        }
    }

    /// Refreshes the model from the content store.
    ///
    /// Unsaved local edits always win: a dirty model returns untouched. An
    /// unchanged file (by mtime) is treated as a successful no-op. Read
    /// failures after a successful first load are absorbed, leaving the
    /// previous content in place; failures before it surface as an error and
    /// put the model in [`FileState::Error`].
    pub async fn load(&self) -> Result<()> {
        let if_modified_since = {
            let state = self.state.lock();
            if state.disposed {
                return Err(anyhow!("model was disposed: {:?}", self.resource));
            }
            if !self.is_readonly() && state.has_unsaved_edits() {
                return Ok(());
            }
            state.stat.map(|stat| stat.mtime)
        };

        match self.load_internal(if_modified_since, None).await {
            Ok(()) => Ok(()),
            Err(error) if fs::is_not_modified_error(&error) => Ok(()),
            Err(error) => {
                let mut state = self.state.lock();
                if state.loaded {
                    drop(state);
                    log::warn!("failed to reload {:?}: {:?}", self.resource, error);
                    Ok(())
                } else {
                    state.file_state = FileState::Error;
                    Err(error)
                }
            }
        }
    }

    async fn load_internal(
        &self,
        if_modified_since: Option<SystemTime>,
        encoding_override: Option<CharacterEncoding>,
    ) -> Result<()> {
        let file = self
            .fs
            .read(&self.resource, ReadOptions { if_modified_since })
            .await?;
        let encoding = encoding_override
            .or_else(|| CharacterEncoding::detect(&file.bytes))
            .unwrap_or_else(|| self.encoding());
        let mut text = encoding::decode(&file.bytes, encoding)
            .with_context(|| format!("decoding {:?} as {}", self.resource, encoding.label()))?;
        let line_ending = LineEnding::detect(&text);
        LineEnding::normalize(&mut text);
        let content = Rope::from_str(&text);

        let mut state = self.state.lock();
        if state.disposed {
            return Ok(());
        }
        let was_loaded = state.loaded;
        let was_dirty = !self.is_readonly() && state.has_unsaved_edits();
        let content_changed = content != state.content;
        state.content = content;
        state.encoding = encoding;
        state.line_ending = line_ending;
        post_inc(&mut state.version);
        state.saved_version = state.version;
        state.explicitly_dirty = false;
        state.stat = Some(file.metadata);
        state.loaded = true;
        state.file_state = FileState::Saved;
        state.save_epoch += 1;
        drop(state);

        let mut events = Vec::new();
        if was_loaded && content_changed {
            events.push(TextFileEvent::Edited);
        }
        if was_dirty {
            events.push(TextFileEvent::DirtyChanged(false));
        }
        if !events.is_empty() {
            self.subscriptions.publish(events);
        }
        Ok(())
    }

    /// Persists the model's content through the content store.
    ///
    /// A clean model returns without writing unless `options.force` is set;
    /// a forced save of unchanged content still counts as a save and fires
    /// [`TextFileEvent::Saved`]. Failures leave the model dirty and move it
    /// to [`FileState::Conflict`] when the file changed on disk behind the
    /// model's back, or [`FileState::Error`] otherwise; nothing is retried
    /// until the caller saves or reverts again.
    pub async fn save(&self, options: SaveOptions) -> Result<()> {
        if self.is_readonly() {
            return Ok(());
        }
        {
            let state = self.state.lock();
            if state.disposed {
                return Err(anyhow!("model was disposed: {:?}", self.resource));
            }
            if !state.loaded || (!state.has_unsaved_edits() && !options.force) {
                return Ok(());
            }
        }

        let _guard = self.save_gate.lock().await;

        // A save that queued behind another may find nothing left to write.
        let save_epoch = {
            let mut state = self.state.lock();
            if state.disposed {
                return Ok(());
            }
            if !state.has_unsaved_edits() && !options.force {
                return Ok(());
            }
            state.file_state = FileState::PendingSave;
            state.last_save_attempt_at = Some(SystemTime::now());
            state.save_epoch
        };

        let participants = self.participants.lock().clone();
        for participant in participants {
            participant.will_save(self).await.log_err();
        }

        let (bytes, version, expected_mtime) = {
            let state = self.state.lock();
            (
                encoding::encode(&state.content, state.encoding, state.line_ending),
                state.version,
                state.stat.map(|stat| stat.mtime),
            )
        };

        match self
            .fs
            .write(&self.resource, &bytes, WriteOptions { expected_mtime })
            .await
        {
            Ok(metadata) => {
                let mut state = self.state.lock();
                if state.disposed || state.save_epoch != save_epoch {
                    return Ok(());
                }
                let was_dirty = state.has_unsaved_edits();
                state.stat = Some(metadata);
                state.saved_version = version;
                state.explicitly_dirty = false;
                // Edits made while the write was in flight were not
                // persisted; they keep the model dirty.
                let still_dirty = state.has_unsaved_edits();
                state.file_state = if still_dirty {
                    FileState::Dirty
                } else {
                    FileState::Saved
                };
                drop(state);

                let mut events = Vec::new();
                if was_dirty && !still_dirty {
                    events.push(TextFileEvent::DirtyChanged(false));
                }
                events.push(TextFileEvent::Saved);
                self.subscriptions.publish(events);
                Ok(())
            }
            Err(error) => {
                let conflict = fs::is_modified_since_error(&error);
                let mut state = self.state.lock();
                if state.disposed || state.save_epoch != save_epoch {
                    return Err(error);
                }
                state.file_state = if conflict {
                    FileState::Conflict
                } else {
                    FileState::Error
                };
                drop(state);
                self.subscriptions
                    .publish([TextFileEvent::SaveFailed { conflict }]);
                Err(error)
            }
        }
    }

    /// Discards the dirty state. A soft revert keeps the in-memory content
    /// and makes it the new baseline; a hard revert restores the content
    /// from the store, discarding local edits.
    pub async fn revert(&self, options: RevertOptions) -> Result<()> {
        if options.soft {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(anyhow!("model was disposed: {:?}", self.resource));
            }
            let was_dirty = !self.is_readonly() && state.has_unsaved_edits();
            state.explicitly_dirty = false;
            state.saved_version = state.version;
            state.file_state = FileState::Saved;
            state.save_epoch += 1;
            drop(state);

            let mut events = Vec::new();
            if was_dirty {
                events.push(TextFileEvent::DirtyChanged(false));
            }
            events.push(TextFileEvent::Reverted);
            self.subscriptions.publish(events);
            Ok(())
        } else {
            if self.is_disposed() {
                return Err(anyhow!("model was disposed: {:?}", self.resource));
            }
            self.load_internal(None, None).await?;
            if !self.is_disposed() {
                self.subscriptions.publish([TextFileEvent::Reverted]);
            }
            Ok(())
        }
    }

    /// Changes the model's encoding. A no-op when the encoding already
    /// matches. `Encode` re-saves the current content under the new
    /// encoding; `Decode` throws away in-memory state and reinterprets the
    /// stored bytes.
    pub async fn set_encoding(
        &self,
        encoding: CharacterEncoding,
        mode: EncodingMode,
    ) -> Result<()> {
        {
            let state = self.state.lock();
            if state.disposed {
                return Err(anyhow!("model was disposed: {:?}", self.resource));
            }
            if state.encoding == encoding {
                return Ok(());
            }
        }
        match mode {
            EncodingMode::Encode => {
                self.state.lock().encoding = encoding;
                self.subscriptions
                    .publish([TextFileEvent::EncodingChanged(encoding)]);
                self.save(SaveOptions { force: true }).await
            }
            EncodingMode::Decode => {
                self.load_internal(None, Some(encoding)).await?;
                if !self.is_disposed() {
                    self.subscriptions
                        .publish([TextFileEvent::EncodingChanged(encoding)]);
                }
                Ok(())
            }
        }
    }

    /// Releases the model's content. Idempotent; only the first call fires
    /// [`TextFileEvent::Closed`]. An in-flight save is not aborted, but its
    /// completion no longer affects this model.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.save_epoch += 1;
        state.content = Rope::new();
        drop(state);
        self.subscriptions.publish([TextFileEvent::Closed]);
    }
}
