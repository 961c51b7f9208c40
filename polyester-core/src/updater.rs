//! The collection state machine.
//!
//! A [`CollectionUpdater`] owns one collection's manifest, the signed log head
//! of every known writer, and the materialized index. Local writes go
//! through [`CollectionUpdater::add`]; envelopes from peers go through
//! [`CollectionUpdater::merge`]. Neither returns an error: failures are
//! logged and leave committed state untouched.

use std::collections::BTreeMap;

use futures::future::join_all;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::async_store::{ObjectError, get_object, put_object};
use crate::codec::CodecError;
use crate::identity::{CryptoError, Identity};
use crate::model::{
    Collection, Entry, EntryBlock, EntryBlockList, Manifest, Proof, Provenance, PublicAccess,
};
use crate::options::{CollectionOptions, OptionsError};
use crate::resolve::{self, ClockRange, Write};
use crate::store::LocalStorage;
use crate::validate::{self, Severity, ValidationError, Validator};
use crate::{AsyncStore, Cid};

pub type PublishCallback = Box<dyn Fn(&Collection) + Send + Sync>;
pub type CloseCallback = Box<dyn Fn(&Cid) + Send + Sync>;
pub type UpdateCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Initialized,
    Closed,
}

/// What a call to [`CollectionUpdater::merge`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New writer logs were accepted and the index rebuilt.
    Applied,
    /// Newer logs were accepted but the snapshot did not change.
    Unchanged,
    /// No log in the envelope was newer than what is known.
    Stale,
    /// The envelope or one of its logs failed validation; nothing changed.
    Rejected,
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Object(#[from] ObjectError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("local storage error: {0}")]
    Storage(Box<dyn std::error::Error + Send + Sync>),
    #[error("stored object {cid} is malformed: {reason}")]
    Corrupt { cid: Cid, reason: String },
    #[error("collection is {0:?}")]
    NotOpen(State),
}

impl UpdateError {
    pub fn severity(&self) -> Severity {
        match self {
            UpdateError::Validation(err) => err.severity(),
            UpdateError::NotOpen(_) => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

fn storage_error<E: std::error::Error + Send + Sync + 'static>(err: E) -> UpdateError {
    UpdateError::Storage(Box::new(err))
}

/// Local storage key of a collection's snapshot id.
pub fn storage_key(address: &Cid) -> String {
    format!("/db/{}", address)
}

#[derive(Clone)]
struct WriterLog {
    list: EntryBlockList,
    len: usize,
}

pub struct CollectionUpdater<S, L, I> {
    name: String,
    options: CollectionOptions,
    store: S,
    storage: L,
    identity: I,
    public_key: String,
    state: State,
    manifest: Option<Manifest>,
    address: Option<Cid>,
    logs: BTreeMap<String, WriterLog>,
    index: IndexMap<String, Entry>,
    clock: u64,
    add_count: u64,
    snapshot: Option<Cid>,
    on_publish: Option<PublishCallback>,
    on_close: Option<CloseCallback>,
    on_update: Vec<UpdateCallback>,
}

impl<S, L, I> CollectionUpdater<S, L, I>
where
    S: AsyncStore,
    L: LocalStorage,
    I: Identity,
{
    pub fn new(options: CollectionOptions, store: S, storage: L, identity: I) -> Result<Self, OptionsError> {
        options.validate()?;
        let public_key = identity.public_key();
        Ok(CollectionUpdater {
            name: String::new(),
            options,
            store,
            storage,
            identity,
            public_key,
            state: State::Uninitialized,
            manifest: None,
            address: None,
            logs: BTreeMap::new(),
            index: IndexMap::new(),
            clock: 0,
            add_count: 0,
            snapshot: None,
            on_publish: None,
            on_close: None,
            on_update: Vec::new(),
        })
    }

    /// Sets the callback that receives outgoing envelopes.
    pub fn on_publish(&mut self, callback: impl Fn(&Collection) + Send + Sync + 'static) {
        self.on_publish = Some(Box::new(callback));
    }

    pub fn on_close(&mut self, callback: impl Fn(&Cid) + Send + Sync + 'static) {
        self.on_close = Some(Box::new(callback));
    }

    /// Registers a callback fired after every committed change, in
    /// registration order.
    pub fn on_update(&mut self, callback: impl Fn() + Send + Sync + 'static) {
        self.on_update.push(Box::new(callback));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn address(&self) -> Option<Cid> {
        self.address
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Highest clock assigned or observed so far.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn index(&self) -> &IndexMap<String, Entry> {
        &self.index
    }

    pub fn get(&self, id: &str) -> Option<&Entry> {
        self.index.get(id)
    }

    /// Entries stored across all known writer logs, whether or not they are
    /// currently effective or inside the clock window.
    pub fn num_entries(&self) -> usize {
        self.logs.values().map(|log| log.len).sum()
    }

    fn is_creator(&self, manifest: &Manifest) -> bool {
        self.public_key == manifest.creator_public_key
    }

    pub fn can_read(&self) -> bool {
        self.manifest
            .as_ref()
            .is_some_and(|m| self.is_creator(m) || m.public_access != PublicAccess::None)
    }

    pub fn can_write(&self) -> bool {
        self.manifest.as_ref().is_some_and(|m| {
            self.is_creator(m)
                || match m.public_access {
                    PublicAccess::None | PublicAccess::Read => false,
                    PublicAccess::ReadWrite | PublicAccess::ReadAnyWriteOwn => true,
                }
        })
    }

    fn clock_range(&self) -> ClockRange {
        ClockRange {
            lower: self.options.lower_clock,
            upper: self.options.upper_clock,
        }
    }

    fn opened(&self) -> Result<(Manifest, Cid), UpdateError> {
        match (self.state, &self.manifest, self.address) {
            (State::Initialized, Some(manifest), Some(address)) => Ok((manifest.clone(), address)),
            _ => Err(UpdateError::NotOpen(self.state)),
        }
    }

    fn report(&self, operation: &str, err: &UpdateError) {
        let name = &self.name;
        match err.severity() {
            Severity::Error => log::error!("{} on collection {:?} failed: {}", operation, name, err),
            Severity::Warning => log::warn!("{} on collection {:?} dropped: {}", operation, name, err),
        }
    }

    /// Resolves the manifest and restores any cached state.
    ///
    /// Returns false if the manifest at `options.address` is missing or
    /// invalid. A missing or unreadable snapshot is not a failure.
    pub async fn init(&mut self, name: &str) -> bool {
        if self.state != State::Uninitialized {
            log::warn!("collection {:?} cannot be initialized while {:?}", name, self.state);
            return false;
        }
        self.name = name.to_string();
        match self.try_init(name).await {
            Ok(()) => true,
            Err(err) => {
                self.report("init", &err);
                false
            }
        }
    }

    async fn try_init(&mut self, name: &str) -> Result<(), UpdateError> {
        let (manifest, address) = match self.options.address {
            Some(address) => {
                let value = get_object(&self.store, &address).await?;
                (validate::validate_manifest(value.as_ref())?, address)
            }
            None => {
                let access = self.options.public_access;
                let manifest = Manifest {
                    name: name.to_string(),
                    creator_public_key: if access.is_private() {
                        self.public_key.clone()
                    } else {
                        String::new()
                    },
                    public_access: access,
                    entry_block_size: self.options.entry_block_size,
                    conflict_resolution: self.options.conflict_resolution,
                    complexity: self.options.complexity,
                };
                let address = put_object(&self.store, &manifest).await?;
                (manifest, address)
            }
        };
        self.manifest = Some(manifest);
        self.address = Some(address);
        self.state = State::Initialized;

        let cached = self
            .storage
            .get_item(&storage_key(&address))
            .map_err(storage_error)?;
        if let Some(cached) = cached {
            match cached.parse::<Cid>() {
                Ok(cid) => self.restore(cid, address).await,
                Err(err) => log::warn!("ignoring malformed snapshot id {:?}: {}", cached, err),
            }
        }
        Ok(())
    }

    async fn restore(&mut self, cid: Cid, address: Cid) {
        let value = match get_object(&self.store, &cid).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                log::warn!("snapshot {} of collection {:?} is missing", cid, self.name);
                return;
            }
            Err(err) => {
                self.report("restore", &err.into());
                return;
            }
        };
        if let Ok(snapshot) = validate::validate_collection(Some(&value), &address) {
            if snapshot.sender_public_key == self.public_key {
                self.add_count = snapshot.add_count;
            }
        }
        self.merge(&value).await;
    }

    /// Appends local writes.
    ///
    /// A no-op without write access or with no objects. Objects that are not
    /// JSON objects with a string `_id` are dropped, as are, in
    /// `ReadAnyWriteOwn` collections, objects keyed by anything but the own
    /// public key.
    pub async fn add(&mut self, objects: Vec<Value>) {
        if let Err(err) = self.try_add(objects).await {
            self.report("add", &err);
        }
    }

    async fn try_add(&mut self, objects: Vec<Value>) -> Result<(), UpdateError> {
        let (manifest, address) = self.opened()?;
        if objects.is_empty() || !self.can_write() {
            return Ok(());
        }
        let own = self.public_key.clone();

        let mut clock = self.clock;
        let mut accepted = Vec::with_capacity(objects.len());
        for object in objects {
            let mut entry: Entry = match serde_json::from_value(object) {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("dropping object without a usable _id: {}", err);
                    continue;
                }
            };
            if manifest.public_access == PublicAccess::ReadAnyWriteOwn && entry.id != own {
                log::warn!("dropping {:?}: only {} may be written here", entry.id, own);
                continue;
            }
            clock += 1;
            entry.clock = clock;
            entry.identity = None;
            accepted.push(entry);
        }
        if accepted.is_empty() {
            return Ok(());
        }

        let mut outgoing = Vec::with_capacity(accepted.len());
        let mut local = Vec::with_capacity(accepted.len());
        for mut entry in accepted {
            let mut public = if manifest.public_access.is_encrypted() {
                self.encrypt_entry(&entry)?
            } else {
                entry.clone()
            };
            if manifest.complexity > 0 {
                let (signature, nonce) = self.identity.sign_with_proof(
                    &public.proof_bytes()?,
                    &address.to_string(),
                    manifest.complexity,
                );
                public.proof = Some(Proof {
                    signature,
                    nonce,
                    public_key: None,
                });
            } else if public.proof.is_none() {
                let (signature, nonce) = self.identity.sign_with_proof(&public.proof_bytes()?, "", 0);
                public.proof = Some(Proof {
                    signature,
                    nonce,
                    public_key: Some(own.clone()),
                });
            }
            entry.proof = public.proof.clone();
            entry.identity = Some(Provenance {
                public_key: own.clone(),
            });
            outgoing.push(public);
            local.push(entry);
        }

        let size = manifest.entry_block_size as usize;
        let (mut cids, mut len) = match self.logs.get(&own) {
            Some(log) => (log.list.entry_block_cids.clone(), log.len),
            None => (Vec::new(), 0),
        };
        let mut pending = Vec::new();
        if let Some(tail_cid) = cids.last().copied() {
            let tail = self.load_block(&tail_cid).await?;
            if tail.entries.len() < size {
                cids.pop();
                pending = tail.entries;
            }
        }
        len += outgoing.len();
        let mut add_count = self.add_count + outgoing.len() as u64;
        pending.extend(outgoing);
        cids.extend(self.write_blocks(&pending, size).await?);

        let mut list_clock = clock;
        let threshold = self.options.compact_threshold;
        if threshold > 0 && add_count >= threshold {
            let (compacted, live, last_clock) = self.compact(&cids, &manifest).await?;
            cids = compacted;
            len = live;
            list_clock = last_clock.unwrap_or(list_clock);
            add_count = 0;
        }

        let mut list = EntryBlockList::unsigned(own.clone(), cids, list_clock);
        list.signature = self.identity.sign(&list.signing_bytes()?);
        let mut logs = self.logs.clone();
        logs.insert(own.clone(), WriterLog { list: list.clone(), len });

        // Nothing is committed until the snapshot is durable.
        let snapshot = self.persist_snapshot(&address, &logs, add_count).await?;
        self.logs = logs;
        self.add_count = add_count;
        self.clock = clock;
        let range = self.clock_range();
        for entry in local {
            if range.contains(entry.clock) {
                resolve::apply(&mut self.index, entry, manifest.conflict_resolution);
            }
        }

        if let Some(cid) = snapshot {
            self.snapshot = Some(cid);
            self.publish(&Collection {
                sender_public_key: own,
                address,
                entry_block_lists: vec![list],
                add_count,
            });
            self.notify();
        }
        Ok(())
    }

    /// Rewrites the own log so it holds only effective entries.
    ///
    /// Returns the new block cids, the number of live entries and the clock
    /// of the last one.
    async fn compact(
        &self,
        cids: &[Cid],
        manifest: &Manifest,
    ) -> Result<(Vec<Cid>, usize, Option<u64>), UpdateError> {
        let entries = self.load_chain(cids).await?;
        let before = entries.len();
        let live = resolve::dedupe(entries, manifest.conflict_resolution);
        log::debug!(
            "compacted log of {:?} from {} to {} entries",
            self.name,
            before,
            live.len()
        );
        let last_clock = live.last().map(|e| e.clock);
        let cids = self
            .write_blocks(&live, manifest.entry_block_size as usize)
            .await?;
        Ok((cids, live.len(), last_clock))
    }

    /// Ingests an envelope from a peer, or a cached snapshot.
    ///
    /// Acceptance is all-or-nothing: if any log in the envelope fails
    /// validation, nothing is applied.
    pub async fn merge<C: Serialize + ?Sized>(&mut self, collection: &C) -> MergeOutcome {
        let value = match serde_json::to_value(collection) {
            Ok(value) => value,
            Err(err) => {
                log::error!("merge on collection {:?} failed: unreadable envelope: {}", self.name, err);
                return MergeOutcome::Rejected;
            }
        };
        match self.try_merge(value).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.report("merge", &err);
                MergeOutcome::Rejected
            }
        }
    }

    async fn try_merge(&mut self, value: Value) -> Result<MergeOutcome, UpdateError> {
        let (manifest, address) = self.opened()?;
        let collection = validate::validate_collection(Some(&value), &address)?;

        let mut candidates: BTreeMap<String, EntryBlockList> = BTreeMap::new();
        for list in collection.entry_block_lists {
            let known = self.logs.get(&list.public_key).map(|log| log.list.clock);
            if known.is_some_and(|clock| list.clock <= clock) {
                continue;
            }
            if candidates
                .get(&list.public_key)
                .is_some_and(|seen| seen.clock >= list.clock)
            {
                continue;
            }
            candidates.insert(list.public_key.clone(), list);
        }
        if candidates.is_empty() {
            log::debug!("merge on collection {:?}: nothing newer", self.name);
            return Ok(MergeOutcome::Stale);
        }

        let this: &Self = self;
        let validator = Validator::new(&manifest, &address, &this.identity);
        for list in candidates.values() {
            validator.entry_block_list(list)?;
        }

        let fetched = join_all(
            candidates
                .values()
                .map(|list| this.fetch_blocks(&list.entry_block_cids)),
        )
        .await;
        let previous = join_all(candidates.keys().map(|key| async move {
            match this.logs.get(key) {
                Some(log) => this.load_chain(&log.list.entry_block_cids).await,
                None => Ok(Vec::new()),
            }
        }))
        .await;
        let unchanged: Vec<String> = this
            .logs
            .keys()
            .filter(|key| !candidates.contains_key(*key))
            .cloned()
            .collect();
        let current = join_all(unchanged.iter().map(|key| async move {
            match this.logs.get(key) {
                Some(log) => this.load_chain(&log.list.entry_block_cids).await,
                None => Ok(Vec::new()),
            }
        }))
        .await;

        let mut accepted = Vec::with_capacity(candidates.len());
        for ((list, blocks), previous) in candidates.into_values().zip(fetched).zip(previous) {
            let blocks = blocks?;
            let previous = previous?;
            let tail = blocks.len().saturating_sub(1);
            let mut entries = Vec::new();
            for (i, (cid, value)) in blocks.iter().enumerate() {
                let block = validator.entry_block(cid, value.as_ref(), i == tail, &list.public_key)?;
                entries.extend(block.entries);
            }
            validator.entries(&list, &entries, &previous)?;
            accepted.push((list, entries));
        }
        let mut writes = Vec::new();
        for (writer, entries) in unchanged.into_iter().zip(current) {
            writes.extend(entries?.into_iter().map(|entry| Write {
                writer: writer.clone(),
                entry,
            }));
        }

        let mut logs = self.logs.clone();
        for (list, entries) in accepted {
            let writer = list.public_key.clone();
            logs.insert(
                writer.clone(),
                WriterLog {
                    list,
                    len: entries.len(),
                },
            );
            writes.extend(entries.into_iter().map(|entry| Write {
                writer: writer.clone(),
                entry,
            }));
        }

        let snapshot = self.persist_snapshot(&address, &logs, self.add_count).await?;
        self.logs = logs;
        let Some(cid) = snapshot else {
            return Ok(MergeOutcome::Unchanged);
        };
        self.snapshot = Some(cid);
        self.rebuild_index(writes, &manifest);
        self.notify();
        Ok(MergeOutcome::Applied)
    }

    /// Replaces the index with one materialized from every known write.
    fn rebuild_index(&mut self, mut writes: Vec<Write>, manifest: &Manifest) {
        resolve::sort_writes(&mut writes);
        if let Some(max) = writes.last().map(|w| w.entry.clock) {
            self.clock = self.clock.max(max);
        }

        let range = self.clock_range();
        let mut index = IndexMap::new();
        for Write { writer, entry } in writes {
            if !range.contains(entry.clock) {
                continue;
            }
            let mut entry = if manifest.public_access.is_encrypted() {
                match self.decrypt_entry(entry) {
                    Ok(entry) => entry,
                    Err(err) => {
                        log::warn!("skipping entry from {} that does not decrypt: {}", writer, err);
                        continue;
                    }
                }
            } else {
                entry
            };
            entry.identity = Some(Provenance { public_key: writer });
            resolve::apply(&mut index, entry, manifest.conflict_resolution);
        }
        self.index = index;
    }

    /// Republishes every known log so a newly joined peer can catch up.
    pub fn on_peer_joined(&self, peer: &str) {
        if self.state != State::Initialized || self.logs.is_empty() {
            return;
        }
        match self.full_collection() {
            Ok(collection) => {
                log::debug!(
                    "sending {} logs of {:?} to peer {}",
                    collection.entry_block_lists.len(),
                    self.name,
                    peer
                );
                self.publish(&collection);
            }
            Err(err) => self.report("peer join", &err),
        }
    }

    /// Closes the collection. Further calls to `add` and `merge` are dropped.
    pub fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }
        self.state = State::Closed;
        if let (Some(callback), Some(address)) = (&self.on_close, &self.address) {
            callback(address);
        }
    }

    fn publish(&self, collection: &Collection) {
        if let Some(callback) = &self.on_publish {
            callback(collection);
        }
    }

    fn notify(&self) {
        for callback in &self.on_update {
            callback();
        }
    }

    fn full_collection(&self) -> Result<Collection, UpdateError> {
        let address = self.address.ok_or(UpdateError::NotOpen(self.state))?;
        Ok(self.collection_of(address, &self.logs, self.add_count))
    }

    fn collection_of(
        &self,
        address: Cid,
        logs: &BTreeMap<String, WriterLog>,
        add_count: u64,
    ) -> Collection {
        Collection {
            sender_public_key: self.public_key.clone(),
            address,
            entry_block_lists: logs.values().map(|log| log.list.clone()).collect(),
            add_count,
        }
    }

    /// Stores a snapshot of `logs` and records its id locally.
    ///
    /// Returns `None` if the snapshot is identical to the last one. The
    /// caller commits the new id.
    async fn persist_snapshot(
        &self,
        address: &Cid,
        logs: &BTreeMap<String, WriterLog>,
        add_count: u64,
    ) -> Result<Option<Cid>, UpdateError> {
        let snapshot = self.collection_of(*address, logs, add_count);
        let cid = put_object(&self.store, &snapshot).await?;
        if self.snapshot == Some(cid) {
            return Ok(None);
        }
        self.storage
            .set_item(&storage_key(address), &cid.to_string())
            .map_err(storage_error)?;
        Ok(Some(cid))
    }

    async fn fetch_blocks(&self, cids: &[Cid]) -> Result<Vec<(Cid, Option<Value>)>, UpdateError> {
        let values = join_all(cids.iter().map(|cid| get_object(&self.store, cid))).await;
        cids.iter()
            .zip(values)
            .map(|(cid, value)| Ok((*cid, value?)))
            .collect()
    }

    /// Loads a block this node accepted earlier.
    async fn load_block(&self, cid: &Cid) -> Result<EntryBlock, UpdateError> {
        let value = get_object(&self.store, cid)
            .await?
            .ok_or(ValidationError::MissingBlock(*cid))?;
        serde_json::from_value(value).map_err(|e| UpdateError::Corrupt {
            cid: *cid,
            reason: e.to_string(),
        })
    }

    async fn load_chain(&self, cids: &[Cid]) -> Result<Vec<Entry>, UpdateError> {
        let blocks = join_all(cids.iter().map(|cid| self.load_block(cid))).await;
        let mut entries = Vec::new();
        for block in blocks {
            entries.extend(block?.entries);
        }
        Ok(entries)
    }

    async fn write_blocks(&self, entries: &[Entry], size: usize) -> Result<Vec<Cid>, UpdateError> {
        let mut cids = Vec::with_capacity(entries.len().div_ceil(size));
        for chunk in entries.chunks(size) {
            let block = EntryBlock {
                entries: chunk.to_vec(),
            };
            cids.push(put_object(&self.store, &block).await?);
        }
        Ok(cids)
    }

    fn encrypt_entry(&self, entry: &Entry) -> Result<Entry, UpdateError> {
        let payload = serde_json::to_string(&entry.fields).map_err(|e| CodecError::Encode(e.to_string()))?;
        let mut fields = Map::new();
        fields.insert("payload".into(), Value::String(self.identity.encrypt(&payload)?));
        Ok(Entry {
            id: self.identity.encrypt(&entry.id)?,
            clock: entry.clock,
            proof: entry.proof.clone(),
            identity: None,
            fields,
        })
    }

    fn decrypt_entry(&self, entry: Entry) -> Result<Entry, UpdateError> {
        let payload = entry
            .fields
            .get("payload")
            .and_then(Value::as_str)
            .ok_or_else(|| ValidationError::MissingPayload(entry.id.clone()))?;
        let plaintext = self.identity.decrypt(payload)?;
        let fields: Map<String, Value> =
            serde_json::from_str(&plaintext).map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(Entry {
            id: self.identity.decrypt(&entry.id)?,
            clock: entry.clock,
            proof: entry.proof,
            identity: None,
            fields,
        })
    }
}
