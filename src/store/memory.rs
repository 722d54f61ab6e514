use crate::codec::EncryptedFieldCodec;
use crate::error::{Error, Result};
use crate::schema::ENCRYPTED_TEXT_TYPE;
use crate::store::{FieldValues, Record, RecordId};
use crate::{RecordCursor, RecordStore, SchemaRegistry, SideEffectSuspension};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

type EntityRows = BTreeMap<RecordId, FieldValues>;

/// A queued forced rewrite of one field's stored value
#[derive(Debug, Clone)]
struct RewriteRequest {
    entity_type: String,
    id: RecordId,
    field: String,
}

/// Bookkeeping for one registered side-effect channel
#[derive(Debug, Default)]
struct ChannelState {
    suspended: bool,
    delivered: u64,
}

/// An in-memory implementation of the `RecordStore` trait.
///
/// Reads and writes pass transparently through the field codec: [`insert`]
/// and [`get`] deal in logical values while the rows hold stored
/// representations, the same shape a database column would. This
/// implementation is useful for testing and for migrating file-based
/// datasets; a production deployment backs the trait with its database.
///
/// [`insert`]: Self::insert
/// [`get`]: Self::get
#[derive(Debug)]
pub struct InMemoryRecordStore {
    /// Converts between logical and stored field values
    codec: Arc<EncryptedFieldCodec>,

    /// Field names declared `encrypted_text`, per entity type
    encrypted_fields: HashMap<String, HashSet<String>>,

    rows: Arc<RwLock<HashMap<String, EntityRows>>>,
    pending: Mutex<Vec<RewriteRequest>>,
    channels: Arc<Mutex<HashMap<String, ChannelState>>>,
    next_id: AtomicU64,
    commits: AtomicU64,
}

impl InMemoryRecordStore {
    /// Creates a store over the entity types known to the schema registry.
    pub fn new(codec: Arc<EncryptedFieldCodec>, registry: &dyn SchemaRegistry) -> Result<Self> {
        let mut encrypted_fields = HashMap::new();

        for entity in registry.all_metadata()? {
            let fields: HashSet<String> = entity
                .fields
                .iter()
                .filter(|field| field.is_encrypted())
                .map(|field| field.name.clone())
                .collect();

            encrypted_fields.insert(entity.entity_type, fields);
        }

        Ok(Self {
            codec,
            encrypted_fields,
            rows: Arc::new(RwLock::new(HashMap::new())),
            pending: Mutex::new(Vec::new()),
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            commits: AtomicU64::new(0),
        })
    }

    /// Registers a side-effect channel, e.g. a search index synchronizer or
    /// an audit trail subscriber. Each committed record change delivers one
    /// notification to every channel that is not suspended.
    pub fn register_channel(&self, name: impl Into<String>) {
        self.channels.lock().unwrap().entry(name.into()).or_default();
    }

    /// Returns the number of notifications a channel has received.
    pub fn delivered(&self, channel: &str) -> u64 {
        self.channels
            .lock()
            .unwrap()
            .get(channel)
            .map(|state| state.delivered)
            .unwrap_or(0)
    }

    /// Returns the number of commits issued against the store.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Inserts a record from logical field values, returning its id.
    pub fn insert(&self, entity_type: &str, values: FieldValues) -> Result<RecordId> {
        let encoded = self.encode_values(entity_type, &values)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.rows
            .write()
            .unwrap()
            .entry(entity_type.to_string())
            .or_default()
            .insert(id, encoded);
        self.deliver(1);

        Ok(id)
    }

    /// Seeds a record whose values are already stored representations.
    ///
    /// Intended for loading an existing dataset, so no side-effect channel is
    /// notified.
    pub fn insert_raw(&self, entity_type: &str, id: RecordId, values: FieldValues) -> Result<()> {
        self.managed_fields(entity_type)?;

        self.rows
            .write()
            .unwrap()
            .entry(entity_type.to_string())
            .or_default()
            .insert(id, values);
        self.next_id.fetch_max(id.saturating_add(1), Ordering::Relaxed);

        Ok(())
    }

    /// Returns the decoded record, or `None` when it does not exist.
    pub fn get(&self, entity_type: &str, id: RecordId) -> Result<Option<Record>> {
        let fields = self.managed_fields(entity_type)?;
        let rows = self.rows.read().unwrap();

        match rows.get(entity_type).and_then(|records| records.get(&id)) {
            Some(values) => {
                let decoded = decode_values(&self.codec, fields, values)?;

                Ok(Some(Record::new(id, decoded)))
            }
            None => Ok(None),
        }
    }

    /// Returns the raw stored value of one field, bypassing the codec.
    pub fn raw_value(&self, entity_type: &str, id: RecordId, field: &str) -> Option<String> {
        let rows = self.rows.read().unwrap();

        rows.get(entity_type)
            .and_then(|records| records.get(&id))
            .and_then(|values| values.get(field))
            .and_then(|value| value.clone())
    }

    /// Returns the raw rows of an entity type in id order.
    pub fn export_raw(&self, entity_type: &str) -> Vec<(RecordId, FieldValues)> {
        let rows = self.rows.read().unwrap();

        rows.get(entity_type)
            .map(|records| {
                records
                    .iter()
                    .map(|(id, values)| (*id, values.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn managed_fields(&self, entity_type: &str) -> Result<&HashSet<String>> {
        self.encrypted_fields
            .get(entity_type)
            .ok_or_else(|| Error::Persistence(format!("unknown entity type {}", entity_type)))
    }

    fn encode_values(&self, entity_type: &str, values: &FieldValues) -> Result<FieldValues> {
        let fields = self.managed_fields(entity_type)?;
        let mut encoded = HashMap::with_capacity(values.len());

        for (field, value) in values {
            let value = if fields.contains(field) {
                self.codec.to_storage(value.as_deref())?
            } else {
                value.clone()
            };

            encoded.insert(field.clone(), value);
        }

        Ok(encoded)
    }

    fn deliver(&self, changes: u64) {
        let mut channels = self.channels.lock().unwrap();

        for state in channels.values_mut() {
            if !state.suspended {
                state.delivered += changes;
            }
        }
    }
}

impl RecordStore for InMemoryRecordStore {
    fn count(&self, entity_type: &str) -> Result<u64> {
        let rows = self.rows.read().unwrap();

        Ok(rows
            .get(entity_type)
            .map(|records| records.len() as u64)
            .unwrap_or(0))
    }

    fn stream(&self, entity_type: &str) -> Result<Box<dyn RecordCursor>> {
        let encrypted_fields = self.managed_fields(entity_type)?.clone();

        // Snapshot the ids only; records are fetched one at a time
        let ids: Vec<RecordId> = {
            let rows = self.rows.read().unwrap();

            rows.get(entity_type)
                .map(|records| records.keys().copied().collect())
                .unwrap_or_default()
        };

        Ok(Box::new(MemoryCursor {
            codec: Arc::clone(&self.codec),
            rows: Arc::clone(&self.rows),
            entity_type: entity_type.to_string(),
            encrypted_fields,
            ids: ids.into_iter(),
        }))
    }

    fn queue_rewrite(&self, entity_type: &str, id: RecordId, field: &str) -> Result<()> {
        // Rewrites are defined for codec-managed fields only
        if !self.managed_fields(entity_type)?.contains(field) {
            return Err(Error::Persistence(format!(
                "field {}.{} is not declared {}",
                entity_type, field, ENCRYPTED_TEXT_TYPE
            )));
        }

        self.pending.lock().unwrap().push(RewriteRequest {
            entity_type: entity_type.to_string(),
            id,
            field: field.to_string(),
        });

        Ok(())
    }

    fn pending_rewrites(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn commit(&self) -> Result<usize> {
        let requests: Vec<RewriteRequest> = self.pending.lock().unwrap().drain(..).collect();

        let mut written = 0;
        let mut touched: HashSet<(&str, RecordId)> = HashSet::new();

        {
            let mut rows = self.rows.write().unwrap();

            for request in &requests {
                let values = rows
                    .get_mut(&request.entity_type)
                    .and_then(|records| records.get_mut(&request.id))
                    .ok_or_else(|| {
                        Error::Persistence(format!(
                            "record {}#{} vanished before commit",
                            request.entity_type, request.id
                        ))
                    })?;

                let current = values.get(&request.field).and_then(|value| value.as_deref());
                let rewritten = self.codec.rewrite(current)?;

                values.insert(request.field.clone(), rewritten);
                written += 1;
                touched.insert((request.entity_type.as_str(), request.id));
            }
        }

        self.commits.fetch_add(1, Ordering::Relaxed);
        self.deliver(touched.len() as u64);

        log::debug!(
            "committed {} field rewrites across {} records",
            written,
            touched.len()
        );

        Ok(written)
    }

    fn discard_pending(&self) {
        self.pending.lock().unwrap().clear();
    }

    fn suspend_side_effects(&self, channels: &[&str]) -> Result<Box<dyn SideEffectSuspension>> {
        let mut suspended = Vec::new();

        {
            let mut states = self.channels.lock().unwrap();

            for name in channels {
                // Unknown channels are ignored; already-suspended ones stay
                // owned by their current guard
                if let Some(state) = states.get_mut(*name) {
                    if !state.suspended {
                        state.suspended = true;
                        suspended.push((*name).to_string());
                    }
                }
            }
        }

        log::debug!("suspended side-effect channels: {:?}", suspended);

        Ok(Box::new(ChannelSuspension {
            channels: Arc::clone(&self.channels),
            suspended,
        }))
    }
}

/// Cursor over a snapshot of one entity type's record ids
struct MemoryCursor {
    codec: Arc<EncryptedFieldCodec>,
    rows: Arc<RwLock<HashMap<String, EntityRows>>>,
    entity_type: String,
    encrypted_fields: HashSet<String>,
    ids: std::vec::IntoIter<RecordId>,
}

impl RecordCursor for MemoryCursor {
    fn next_record(&mut self) -> Result<Option<Record>> {
        // Records deleted since the snapshot are skipped
        for id in self.ids.by_ref() {
            let rows = self.rows.read().unwrap();

            if let Some(values) = rows
                .get(&self.entity_type)
                .and_then(|records| records.get(&id))
            {
                let decoded = decode_values(&self.codec, &self.encrypted_fields, values)?;

                return Ok(Some(Record::new(id, decoded)));
            }
        }

        Ok(None)
    }
}

/// Guard restoring suspended channels when dropped
struct ChannelSuspension {
    channels: Arc<Mutex<HashMap<String, ChannelState>>>,
    suspended: Vec<String>,
}

impl SideEffectSuspension for ChannelSuspension {
    fn suspended(&self) -> &[String] {
        &self.suspended
    }
}

impl Drop for ChannelSuspension {
    fn drop(&mut self) {
        let mut channels = self.channels.lock().unwrap();

        for name in &self.suspended {
            if let Some(state) = channels.get_mut(name) {
                state.suspended = false;
            }
        }

        log::debug!("restored side-effect channels: {:?}", self.suspended);
    }
}

fn decode_values(
    codec: &EncryptedFieldCodec,
    encrypted_fields: &HashSet<String>,
    values: &FieldValues,
) -> Result<FieldValues> {
    let mut decoded = HashMap::with_capacity(values.len());

    for (field, value) in values {
        let value = if encrypted_fields.contains(field) {
            codec.from_storage(value.as_deref())?
        } else {
            value.clone()
        };

        decoded.insert(field.clone(), value);
    }

    Ok(decoded)
}
