//! The record codec boundary.
//!
//! The framework above hands us opaque record bytes; the codec is the one
//! component allowed to look inside, exposing the `(class_mod, class_name,
//! refs)` triple and a JSON state document. The built-in [`JsonRecordCodec`]
//! understands the record shape produced by the JSON pickle converter:
//!
//! ```json
//! {"@cls": ["persistent.mapping", "PersistentMapping"],
//!  "@refs": [4, 17],
//!  "@s": {"data": {}}}
//! ```
//!
//! Bytes the codec cannot decode (or whose encoding is not canonical, or
//! which exceed the compression threshold) are stored as an opaque payload
//! wrapped in `{"@bin": base64}`; decodable records are stored as
//! `{"@s": state}` with class and refs in their own columns. `load` must
//! return byte-identical input for every stored record, whichever shape it
//! took.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};

use crate::compress;
use crate::error::{Result, StorageError};

/// A record as the codec sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedRecord {
    pub class_mod: String,
    pub class_name: String,
    pub state: Value,
    pub refs: Vec<u64>,
}

/// Bytes ↔ record conversion. Implementations must be canonical:
/// `encode(decode(b)) == b` for every `b` produced by `encode`.
pub trait RecordCodec: Send + Sync {
    fn decode(&self, raw: &[u8]) -> Result<DecodedRecord>;
    fn encode(&self, record: &DecodedRecord) -> Result<Vec<u8>>;
}

/// The built-in codec for JSON record documents.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonRecordCodec;

impl RecordCodec for JsonRecordCodec {
    fn decode(&self, raw: &[u8]) -> Result<DecodedRecord> {
        let doc: Value = serde_json::from_slice(raw)?;
        let obj = doc
            .as_object()
            .ok_or_else(|| StorageError::BadPayload("record is not a JSON object".into()))?;
        let cls = obj
            .get("@cls")
            .and_then(Value::as_array)
            .ok_or_else(|| StorageError::BadPayload("record has no @cls".into()))?;
        let [class_mod, class_name] = cls.as_slice() else {
            return Err(StorageError::BadPayload("@cls is not a [module, name] pair".into()));
        };
        let (Some(class_mod), Some(class_name)) = (class_mod.as_str(), class_name.as_str()) else {
            return Err(StorageError::BadPayload("@cls entries are not strings".into()));
        };
        let state = obj.get("@s").cloned().unwrap_or(Value::Null);
        let refs = match obj.get("@refs") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_u64()
                        .ok_or_else(|| StorageError::BadPayload("@refs entry is not a zoid".into()))
                })
                .collect::<Result<_>>()?,
            Some(_) => return Err(StorageError::BadPayload("@refs is not an array".into())),
        };
        Ok(DecodedRecord {
            class_mod: class_mod.to_owned(),
            class_name: class_name.to_owned(),
            state,
            refs,
        })
    }

    fn encode(&self, record: &DecodedRecord) -> Result<Vec<u8>> {
        // serde_json maps are BTree-backed, so object keys serialize
        // sorted; this is what makes the encoding canonical.
        let mut doc = Map::new();
        doc.insert(
            "@cls".to_owned(),
            json!([record.class_mod, record.class_name]),
        );
        if !record.refs.is_empty() {
            doc.insert("@refs".to_owned(), json!(record.refs));
        }
        doc.insert("@s".to_owned(), record.state.clone());
        Ok(serde_json::to_vec(&Value::Object(doc))?)
    }
}

/// What actually lands in an object row.
#[derive(Clone, Debug)]
pub(crate) struct StoredRecord {
    pub class_mod: String,
    pub class_name: String,
    pub refs: Vec<u64>,
    /// Either `{"@s": state}` or `{"@bin": base64(payload)}`.
    pub state: Value,
    /// Raw record size before compression.
    pub state_size: i32,
}

/// Prepare raw record bytes for storage.
pub(crate) fn encode_for_store(
    codec: &dyn RecordCodec,
    raw: &[u8],
    compression_threshold: usize,
) -> StoredRecord {
    let decoded = codec.decode(raw).ok();

    // The queryable shape is only usable when re-encoding provably yields
    // the original bytes; anything else goes through the opaque payload so
    // load stays byte-exact.
    if raw.len() <= compression_threshold {
        if let Some(rec) = &decoded {
            if codec.encode(rec).is_ok_and(|enc| enc == raw) {
                return StoredRecord {
                    class_mod: rec.class_mod.clone(),
                    class_name: rec.class_name.clone(),
                    refs: rec.refs.clone(),
                    state: json!({ "@s": rec.state }),
                    state_size: raw.len() as i32,
                };
            }
        }
    }

    let payload = compress::pack(raw, compression_threshold);
    let (class_mod, class_name, refs) = match decoded {
        // Keep class and refs queryable even when the payload itself is
        // opaque; the packer walks refs no matter how the state is stored.
        Some(rec) => (rec.class_mod, rec.class_name, rec.refs),
        None => (String::new(), String::new(), Vec::new()),
    };
    StoredRecord {
        class_mod,
        class_name,
        refs,
        state: json!({ "@bin": BASE64.encode(payload) }),
        state_size: raw.len() as i32,
    }
}

/// Recover the raw record bytes from a stored row.
pub(crate) fn decode_from_store(
    codec: &dyn RecordCodec,
    class_mod: &str,
    class_name: &str,
    refs: &[u64],
    state: &Value,
) -> Result<Vec<u8>> {
    let obj = state
        .as_object()
        .ok_or_else(|| StorageError::BadPayload("stored state is not an object".into()))?;
    if let Some(bin) = obj.get("@bin") {
        let b64 = bin
            .as_str()
            .ok_or_else(|| StorageError::BadPayload("@bin is not a string".into()))?;
        let payload = BASE64
            .decode(b64)
            .map_err(|e| StorageError::BadPayload(format!("bad @bin base64: {e}")))?;
        return compress::unpack(&payload);
    }
    if let Some(inner) = obj.get("@s") {
        return codec.encode(&DecodedRecord {
            class_mod: class_mod.to_owned(),
            class_name: class_name.to_owned(),
            state: inner.clone(),
            refs: refs.to_vec(),
        });
    }
    Err(StorageError::BadPayload("stored state has neither @s nor @bin".into()))
}
