//! Multi-peer behaviour of collections sharing one content network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use polyester_core::{
    Cid, Collection, CollectionOptions, CollectionUpdater, ConflictResolution, Ed25519Identity, Entry, EntryBlock,
    EntryBlockList, Identity, MemoryStorage, MemoryStore, MergeOutcome, PublicAccess, get_object, leading_zero_bits,
    put_object,
};
use serde_json::{Value, json};

type Updater = CollectionUpdater<Arc<MemoryStore>, Arc<MemoryStorage>, Ed25519Identity>;

fn identity(seed: u8) -> Ed25519Identity {
    Ed25519Identity::from_seed([seed; 32])
}

struct Peer {
    db: Updater,
    published: Arc<Mutex<Vec<Collection>>>,
    updates: Arc<AtomicUsize>,
}

impl Peer {
    async fn open(store: &Arc<MemoryStore>, storage: Arc<MemoryStorage>, seed: u8, options: CollectionOptions) -> Peer {
        let mut db = CollectionUpdater::new(options, Arc::clone(store), storage, identity(seed)).unwrap();
        let published = Arc::new(Mutex::new(Vec::new()));
        let updates = Arc::new(AtomicUsize::new(0));

        let sink = Arc::clone(&published);
        db.on_publish(move |c| sink.lock().unwrap().push(c.clone()));
        let counter = Arc::clone(&updates);
        db.on_update(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(db.init("shared").await);
        Peer { db, published, updates }
    }

    async fn create(store: &Arc<MemoryStore>, seed: u8, options: CollectionOptions) -> Peer {
        Self::open(store, Arc::new(MemoryStorage::new()), seed, options).await
    }

    async fn join(store: &Arc<MemoryStore>, seed: u8, address: Cid) -> Peer {
        Self::create(store, seed, CollectionOptions::default().address(address)).await
    }

    fn address(&self) -> Cid {
        self.db.address().unwrap()
    }

    fn key(&self) -> String {
        self.db.public_key().to_string()
    }

    fn last_published(&self) -> Collection {
        self.published.lock().unwrap().last().cloned().unwrap()
    }

    fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    fn value(&self, id: &str) -> Option<Value> {
        self.db.get(id).and_then(|e| e.get("value")).cloned()
    }
}

fn entry(id: &str, clock: u64, value: &str) -> Entry {
    let mut entry = Entry::new(id).with("value", value);
    entry.clock = clock;
    entry
}

/// Builds a correctly signed single-block log for `seed` without going
/// through an updater.
async fn forge(store: &Arc<MemoryStore>, address: Cid, seed: u8, entries: Vec<Entry>) -> Collection {
    let signer = identity(seed);
    let clock = entries.last().map(|e| e.clock).unwrap_or(0);
    let block = put_object(store, &EntryBlock { entries }).await.unwrap();
    let mut list = EntryBlockList::unsigned(signer.public_key(), vec![block], clock);
    list.signature = signer.sign(&list.signing_bytes().unwrap());
    Collection {
        sender_public_key: signer.public_key(),
        address,
        entry_block_lists: vec![list],
        add_count: 0,
    }
}

async fn load_block(store: &Arc<MemoryStore>, cid: &Cid) -> EntryBlock {
    let value = get_object(store, cid).await.unwrap().unwrap();
    serde_json::from_value(value).unwrap()
}

fn read_write() -> CollectionOptions {
    CollectionOptions::default().public_access(PublicAccess::ReadWrite)
}

#[tokio::test]
async fn peers_converge() {
    let store = Arc::new(MemoryStore::new());
    let mut a = Peer::create(&store, 1, read_write()).await;
    let mut b = Peer::join(&store, 2, a.address()).await;

    a.db.add(vec![json!({"_id": "a1", "value": "from a"})]).await;
    assert_eq!(b.db.merge(&a.last_published()).await, MergeOutcome::Applied);
    assert_eq!(b.db.clock(), 1);

    b.db.add(vec![json!({"_id": "b1", "value": "from b"})]).await;
    assert_eq!(b.db.get("b1").unwrap().clock, 2);
    assert_eq!(a.db.merge(&b.last_published()).await, MergeOutcome::Applied);

    assert_eq!(a.db.index(), b.db.index());
    assert_eq!(a.db.num_entries(), 2);
    assert_eq!(b.db.num_entries(), 2);
    assert_eq!(a.db.get("b1").unwrap().identity.as_ref().unwrap().public_key, b.key());
}

#[tokio::test]
async fn remerge_is_stale() {
    let store = Arc::new(MemoryStore::new());
    let mut a = Peer::create(&store, 1, read_write()).await;
    let mut b = Peer::join(&store, 2, a.address()).await;

    a.db.add(vec![json!({"_id": "x", "value": "1"})]).await;
    let envelope = a.last_published();

    assert_eq!(b.db.merge(&envelope).await, MergeOutcome::Applied);
    let index = b.db.index().clone();
    assert_eq!(b.updates(), 1);

    assert_eq!(b.db.merge(&envelope).await, MergeOutcome::Stale);
    assert_eq!(b.db.index(), &index);
    assert_eq!(b.updates(), 1);

    // Our own delta echoed back changes nothing either.
    assert_eq!(a.db.merge(&envelope).await, MergeOutcome::Stale);
}

#[tokio::test]
async fn one_bad_log_rejects_the_whole_envelope() {
    let store = Arc::new(MemoryStore::new());
    let mut a = Peer::create(&store, 1, read_write()).await;
    let mut c = Peer::join(&store, 3, a.address()).await;
    let mut b = Peer::join(&store, 2, a.address()).await;

    a.db.add(vec![json!({"_id": "a", "value": "ok"})]).await;
    c.db.add(vec![json!({"_id": "c", "value": "ok"})]).await;

    let good = a.last_published().entry_block_lists[0].clone();
    let mut bad = c.last_published().entry_block_lists[0].clone();
    bad.signature = good.signature.clone();
    let envelope = Collection {
        sender_public_key: a.key(),
        address: a.address(),
        entry_block_lists: vec![good, bad],
        add_count: 0,
    };

    assert_eq!(b.db.merge(&envelope).await, MergeOutcome::Rejected);
    assert!(b.db.index().is_empty());
    assert_eq!(b.db.num_entries(), 0);
    assert_eq!(b.updates(), 0);

    assert_eq!(b.db.merge(&a.last_published()).await, MergeOutcome::Applied);
    assert_eq!(b.db.num_entries(), 1);
}

#[tokio::test]
async fn envelope_for_another_collection_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let mut a = Peer::create(&store, 1, read_write()).await;
    let mut other = Peer::create(&store, 1, read_write().entry_block_size(3)).await;
    assert_ne!(a.address(), other.address());

    other.db.add(vec![json!({"_id": "x"})]).await;
    assert_eq!(a.db.merge(&other.last_published()).await, MergeOutcome::Rejected);
    assert_eq!(a.db.merge(&json!(null)).await, MergeOutcome::Rejected);
    assert_eq!(a.db.num_entries(), 0);
}

#[tokio::test]
async fn history_cannot_be_rewritten() {
    let store = Arc::new(MemoryStore::new());
    let mut a = Peer::create(&store, 1, read_write()).await;
    let mut b = Peer::join(&store, 2, a.address()).await;
    let address = a.address();

    a.db.add(vec![json!({"_id": "k1", "value": "original"})]).await;
    assert_eq!(b.db.merge(&a.last_published()).await, MergeOutcome::Applied);

    let cid = a.last_published().entry_block_lists[0].entry_block_cids[0];
    let accepted = load_block(&store, &cid).await.entries;

    let mut altered = accepted.clone();
    altered[0].fields.insert("value".into(), json!("forged"));
    altered.push(entry("k2", 2, "new"));
    let forged = forge(&store, address, 1, altered).await;
    assert_eq!(b.db.merge(&forged).await, MergeOutcome::Rejected);

    let dropped = forge(&store, address, 1, vec![entry("k2", 2, "new")]).await;
    assert_eq!(b.db.merge(&dropped).await, MergeOutcome::Rejected);
    assert_eq!(b.value("k1"), Some(json!("original")));
    assert!(b.db.get("k2").is_none());

    let mut extended = accepted;
    extended.push(entry("k2", 2, "new"));
    let honest = forge(&store, address, 1, extended).await;
    assert_eq!(b.db.merge(&honest).await, MergeOutcome::Applied);
    assert_eq!(b.value("k1"), Some(json!("original")));
    assert_eq!(b.value("k2"), Some(json!("new")));
}

#[tokio::test]
async fn concurrent_writes_resolve_on_writer_key() {
    for policy in [ConflictResolution::LastWriteWins, ConflictResolution::FirstWriteWins] {
        let store = Arc::new(MemoryStore::new());
        let mut a = Peer::create(&store, 1, read_write().conflict_resolution(policy)).await;
        let mut b = Peer::join(&store, 2, a.address()).await;
        let mut c = Peer::join(&store, 3, a.address()).await;

        let (key_a, key_b) = (a.key(), b.key());
        a.db.add(vec![json!({"_id": "x", "value": key_a})]).await;
        b.db.add(vec![json!({"_id": "x", "value": key_b})]).await;
        assert_eq!(a.db.get("x").unwrap().clock, 1);
        assert_eq!(b.db.get("x").unwrap().clock, 1);

        assert_eq!(c.db.merge(&a.last_published()).await, MergeOutcome::Applied);
        assert_eq!(c.db.merge(&b.last_published()).await, MergeOutcome::Applied);
        assert_eq!(a.db.merge(&b.last_published()).await, MergeOutcome::Applied);
        assert_eq!(b.db.merge(&a.last_published()).await, MergeOutcome::Applied);

        let (low, high) = if key_a < key_b { (key_a, key_b) } else { (key_b, key_a) };
        let winner = match policy {
            ConflictResolution::LastWriteWins => high,
            ConflictResolution::FirstWriteWins => low,
        };
        for peer in [&a, &b, &c] {
            assert_eq!(peer.value("x"), Some(json!(winner)));
            assert_eq!(peer.db.get("x").unwrap().identity.as_ref().unwrap().public_key, winner);
        }
    }
}

#[tokio::test]
async fn read_only_collections_reject_other_writers() {
    let store = Arc::new(MemoryStore::new());
    let mut a = Peer::create(&store, 1, CollectionOptions::default()).await;
    let mut b = Peer::join(&store, 2, a.address()).await;

    assert!(b.db.can_read());
    assert!(!b.db.can_write());
    b.db.add(vec![json!({"_id": "mine"})]).await;
    assert_eq!(b.db.num_entries(), 0);
    assert!(b.published.lock().unwrap().is_empty());

    a.db.add(vec![json!({"_id": "notice", "value": "hello"})]).await;
    assert_eq!(b.db.merge(&a.last_published()).await, MergeOutcome::Applied);
    assert_eq!(b.value("notice"), Some(json!("hello")));

    let intruder = forge(&store, a.address(), 2, vec![entry("notice", 5, "defaced")]).await;
    assert_eq!(a.db.merge(&intruder).await, MergeOutcome::Rejected);
    assert_eq!(a.value("notice"), Some(json!("hello")));
}

#[tokio::test]
async fn writers_only_own_their_key_in_read_any_write_own() {
    let store = Arc::new(MemoryStore::new());
    let options = CollectionOptions::default().public_access(PublicAccess::ReadAnyWriteOwn);
    let mut a = Peer::create(&store, 1, options).await;
    let mut b = Peer::join(&store, 2, a.address()).await;

    assert!(b.db.can_write());
    let own = b.key();
    b.db.add(vec![json!({"_id": own, "value": "online"}), json!({"_id": "someone", "value": "x"})])
        .await;
    assert_eq!(b.db.num_entries(), 1);
    assert_eq!(b.db.index().keys().collect::<Vec<_>>(), vec![&own]);

    assert_eq!(a.db.merge(&b.last_published()).await, MergeOutcome::Applied);
    assert_eq!(a.value(&own), Some(json!("online")));

    let creator = a.key();
    let squatter = forge(&store, a.address(), 2, vec![entry(&creator, 2, "taken")]).await;
    assert_eq!(a.db.merge(&squatter).await, MergeOutcome::Rejected);
    assert!(a.db.get(&creator).is_none());
}

#[tokio::test]
async fn compaction_keeps_live_entries() {
    let store = Arc::new(MemoryStore::new());
    let mut a = Peer::create(&store, 1, CollectionOptions::default().compact_threshold(4)).await;
    let mut b = Peer::join(&store, 2, a.address()).await;

    a.db.add(vec![
        json!({"_id": "k1", "value": "v1"}),
        json!({"_id": "k2", "value": "v2"}),
        json!({"_id": "k3", "value": "v3"}),
    ])
    .await;
    assert_eq!(a.db.num_entries(), 3);
    assert_eq!(b.db.merge(&a.last_published()).await, MergeOutcome::Applied);

    a.db.add(vec![json!({"_id": "k2", "value": "v4"})]).await;
    assert_eq!(a.db.num_entries(), 3);

    let envelope = a.last_published();
    assert_eq!(envelope.add_count, 0);
    let list = &envelope.entry_block_lists[0];
    assert_eq!(list.clock, 4);
    assert_eq!(list.entry_block_cids.len(), 1);
    let block = load_block(&store, &list.entry_block_cids[0]).await;
    let live: Vec<(&str, u64)> = block.entries.iter().map(|e| (e.id.as_str(), e.clock)).collect();
    assert_eq!(live, vec![("k1", 1), ("k3", 3), ("k2", 4)]);

    // Dropping k2@2 changes what the clocks b already holds resolve to.
    assert_eq!(b.db.merge(&envelope).await, MergeOutcome::Rejected);
    assert_eq!(b.value("k2"), Some(json!("v2")));
    assert_eq!(b.db.clock(), 3);

    let mut c = Peer::join(&store, 3, a.address()).await;
    assert_eq!(c.db.merge(&envelope).await, MergeOutcome::Applied);
    assert_eq!(c.db.num_entries(), 3);
    assert_eq!(c.value("k2"), Some(json!("v4")));
    assert_eq!(c.db.index(), a.db.index());
}

#[tokio::test]
async fn first_write_wins_compaction_keeps_history() {
    let options = CollectionOptions::default()
        .compact_threshold(4)
        .conflict_resolution(ConflictResolution::FirstWriteWins);
    let store = Arc::new(MemoryStore::new());
    let mut a = Peer::create(&store, 1, options).await;
    let mut b = Peer::join(&store, 2, a.address()).await;

    a.db.add(vec![
        json!({"_id": "k1", "value": "v1"}),
        json!({"_id": "k2", "value": "v2"}),
        json!({"_id": "k3", "value": "v3"}),
    ])
    .await;
    assert_eq!(b.db.merge(&a.last_published()).await, MergeOutcome::Applied);

    a.db.add(vec![json!({"_id": "k2", "value": "late"})]).await;
    assert_eq!(a.db.num_entries(), 3);
    assert_eq!(a.db.clock(), 4);
    assert_eq!(a.value("k2"), Some(json!("v2")));

    let envelope = a.last_published();
    let list = &envelope.entry_block_lists[0];
    assert_eq!(list.clock, 3);
    let block = load_block(&store, &list.entry_block_cids[0]).await;
    let live: Vec<(&str, u64)> = block.entries.iter().map(|e| (e.id.as_str(), e.clock)).collect();
    assert_eq!(live, vec![("k1", 1), ("k2", 2), ("k3", 3)]);
    assert_eq!(b.db.merge(&envelope).await, MergeOutcome::Stale);

    a.db.add(vec![json!({"_id": "k4", "value": "v5"})]).await;
    assert_eq!(a.last_published().entry_block_lists[0].clock, 5);
    assert_eq!(b.db.merge(&a.last_published()).await, MergeOutcome::Applied);
    assert_eq!(b.value("k2"), Some(json!("v2")));
    assert_eq!(b.value("k4"), Some(json!("v5")));
    assert_eq!(b.db.index(), a.db.index());
}

#[tokio::test]
async fn clock_window_limits_the_index() {
    let store = Arc::new(MemoryStore::new());
    let mut a = Peer::create(&store, 1, CollectionOptions::default()).await;
    a.db.add((1..=4).map(|n| json!({"_id": format!("k{}", n)})).collect())
        .await;

    let options = CollectionOptions::default()
        .address(a.address())
        .clock_range(2, Some(4));
    let mut b = Peer::create(&store, 2, options).await;
    assert_eq!(b.db.merge(&a.last_published()).await, MergeOutcome::Applied);

    let mut ids: Vec<&String> = b.db.index().keys().collect();
    ids.sort();
    assert_eq!(ids, vec!["k2", "k3"]);
    assert_eq!(b.db.num_entries(), 4);
}

#[tokio::test]
async fn private_collections_are_encrypted_at_rest() {
    let store = Arc::new(MemoryStore::new());
    let storage = Arc::new(MemoryStorage::new());
    let options = CollectionOptions::default().public_access(PublicAccess::None);
    let mut a = Peer::open(&store, Arc::clone(&storage), 1, options).await;

    a.db.add(vec![json!({"_id": "diary", "value": "dear diary"})]).await;
    assert_eq!(a.value("diary"), Some(json!("dear diary")));

    let envelope = a.last_published();
    let block = load_block(&store, &envelope.entry_block_lists[0].entry_block_cids[0]).await;
    let stored = &block.entries[0];
    assert_ne!(stored.id, "diary");
    assert!(stored.get("value").is_none());
    let owner = identity(1);
    assert_eq!(owner.decrypt(&stored.id).unwrap(), "diary");
    let payload = stored.get("payload").and_then(Value::as_str).unwrap();
    let fields: Value = serde_json::from_str(&owner.decrypt(payload).unwrap()).unwrap();
    assert_eq!(fields, json!({"value": "dear diary"}));
    assert!(identity(2).decrypt(payload).is_err());

    let reopened = Peer::open(
        &store,
        storage,
        1,
        CollectionOptions::default().address(a.address()),
    )
    .await;
    assert_eq!(reopened.value("diary"), Some(json!("dear diary")));
    assert_eq!(reopened.db.clock(), 1);

    let mut outsider = Peer::join(&store, 2, a.address()).await;
    assert!(!outsider.db.can_read());
    assert_eq!(outsider.db.merge(&envelope).await, MergeOutcome::Applied);
    assert!(outsider.db.index().is_empty());
    assert_eq!(outsider.db.num_entries(), 1);
}

#[tokio::test]
async fn proof_of_work_is_required_and_checked() {
    let store = Arc::new(MemoryStore::new());
    let mut a = Peer::create(&store, 1, read_write().complexity(4)).await;
    let mut b = Peer::join(&store, 2, a.address()).await;

    a.db.add(vec![json!({"_id": "mined", "value": "work"})]).await;
    let envelope = a.last_published();
    let block = load_block(&store, &envelope.entry_block_lists[0].entry_block_cids[0]).await;
    let proof = block.entries[0].proof.clone().unwrap();
    assert!(proof.public_key.is_none());
    assert!(leading_zero_bits(&hex::decode(&proof.signature).unwrap()) >= 4);

    assert_eq!(b.db.merge(&envelope).await, MergeOutcome::Applied);
    assert_eq!(b.value("mined"), Some(json!("work")));

    let lazy = forge(&store, a.address(), 3, vec![entry("free", 1, "no work")]).await;
    assert_eq!(b.db.merge(&lazy).await, MergeOutcome::Rejected);
    assert!(b.db.get("free").is_none());
}

#[tokio::test]
async fn portable_proofs_carry_the_signer() {
    let store = Arc::new(MemoryStore::new());
    let mut a = Peer::create(&store, 1, CollectionOptions::default()).await;
    a.db.add(vec![json!({"_id": "note"})]).await;

    let proof = a.db.get("note").unwrap().proof.clone().unwrap();
    assert_eq!(proof.public_key, Some(a.key()));
}
