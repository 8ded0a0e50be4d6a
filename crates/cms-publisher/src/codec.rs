//! # Metadata Codec
//!
//! Encodes a batch of consignments as a CBOR map and decodes it back.
//!
//! ## Layout
//!
//! ```text
//! {
//!   "metadata": { "creation_slot": uint, "timestamp": "2024-01-01T00:00:00.25Z", "version": "1.0" },
//!   "org":      { "id": .., "name"?: .., "tax_id_number"?: .., "currency_id"?: .., "country_code"?: .. },
//!   "type":     "CONSIGNMENTS",
//!   "data": [
//!     { "id": hex, "goods": { item: uint }, "sender"?: org, "receiver": org,
//!       "tracking_status"?: text, "latitude"?: text, "longitude"?: text,
//!       "dispatched_at": "YYYY-MM-DDTHH:MM:SS[.fff]" }
//!   ]
//! }
//! ```
//!
//! `org` is present only when every record in the batch is sent by the
//! batch organisation; records then omit `sender`. Blank optional strings
//! are never emitted.
//!
//! Text forms follow the layout earlier publishers wrote: `timestamp` keeps
//! only the non-zero sub-second digit groups, `dispatched_at` is
//! [`DispatchTimestamp::iso_local`], and coordinates are shortest
//! round-trip decimals, switching to `d.dddE±n` outside `[1e-3, 1e7)`. The
//! byte size reported by [`EncodedMetadata::size`]
//! is the exact CBOR length and the only input to the packer's limit check.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use cms_core::{
    verify_declared_id, ConsignmentId, ConsignmentPayload, ConsignmentRecord, DispatchTimestamp,
    Geolocation, IntegrityError, Organisation, OrganisationId, VersionGroupKey,
};
use serde_cbor::Value;

use crate::error::CodecError;

/// Metadata protocol version written into every header.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Payload type tag for consignment batches.
pub const CONSIGNMENTS_TYPE: &str = "CONSIGNMENTS";

/// Batch-level header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataHeader {
    /// Chain tip slot when the batch was built.
    pub creation_slot: u64,
    pub timestamp: DateTime<Utc>,
}

/// A batch encoded as a structured map plus its wire bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedMetadata {
    pub value: Value,
    pub bytes: Vec<u8>,
}

impl EncodedMetadata {
    /// Exact encoded byte length.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Encodes batches for the packer. Must be pure.
pub trait BatchEncoder: Send + Sync {
    fn encode(
        &self,
        organisation_id: &OrganisationId,
        records: &[ConsignmentRecord],
        header: &MetadataHeader,
    ) -> Result<EncodedMetadata, CodecError>;
}

/// CBOR implementation of the metadata layout.
#[derive(Debug, Default, Clone, Copy)]
pub struct CborMetadataCodec;

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn put(map: &mut BTreeMap<Value, Value>, key: &str, value: Value) {
    map.insert(text(key), value);
}

fn put_non_blank(map: &mut BTreeMap<Value, Value>, key: &str, value: Option<&String>) {
    if let Some(v) = value.filter(|v| !v.trim().is_empty()) {
        put(map, key, text(v));
    }
}

fn encode_organisation(org: &Organisation) -> Value {
    let mut map = BTreeMap::new();
    put(&mut map, "id", text(org.id.as_str()));
    put_non_blank(&mut map, "name", org.name.as_ref());
    put_non_blank(&mut map, "tax_id_number", org.tax_id_number.as_ref());
    put_non_blank(&mut map, "currency_id", org.currency_id.as_ref());
    put_non_blank(&mut map, "country_code", org.country_code.as_ref());
    Value::Map(map)
}

/// Shortest round-trip decimal, always with a fraction digit, in scientific
/// notation outside `[1e-3, 1e7)`.
fn decimal_text(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    let magnitude = value.abs();
    if magnitude == 0.0 || (1e-3..1e7).contains(&magnitude) {
        let plain = value.to_string();
        return if plain.contains('.') {
            plain
        } else {
            format!("{plain}.0")
        };
    }
    let scientific = format!("{value:e}");
    match scientific.split_once('e') {
        Some((mantissa, exponent)) if mantissa.contains('.') => format!("{mantissa}E{exponent}"),
        Some((mantissa, exponent)) => format!("{mantissa}.0E{exponent}"),
        None => scientific,
    }
}

fn encode_record(record: &ConsignmentRecord, collapsed: bool) -> Value {
    let payload = record.payload();
    let mut map = BTreeMap::new();
    put(&mut map, "id", text(record.id().as_str()));

    let goods = payload
        .goods
        .iter()
        .map(|(item, qty)| (text(item), Value::Integer(i128::from(*qty))))
        .collect();
    put(&mut map, "goods", Value::Map(goods));

    if !collapsed {
        put(&mut map, "sender", encode_organisation(&payload.sender));
    }
    put(&mut map, "receiver", encode_organisation(&payload.receiver));
    put_non_blank(&mut map, "tracking_status", payload.tracking_status.as_ref());
    if let Some(geo) = &payload.geolocation {
        put(&mut map, "latitude", text(&decimal_text(geo.latitude())));
        put(&mut map, "longitude", text(&decimal_text(geo.longitude())));
    }
    put(&mut map, "dispatched_at", text(&payload.dispatched_at.iso_local()));
    Value::Map(map)
}

impl BatchEncoder for CborMetadataCodec {
    fn encode(
        &self,
        organisation_id: &OrganisationId,
        records: &[ConsignmentRecord],
        header: &MetadataHeader,
    ) -> Result<EncodedMetadata, CodecError> {
        let mut root = BTreeMap::new();

        let mut meta = BTreeMap::new();
        put(
            &mut meta,
            "creation_slot",
            Value::Integer(i128::from(header.creation_slot)),
        );
        put(
            &mut meta,
            "timestamp",
            text(&header.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
        put(&mut meta, "version", text(PROTOCOL_VERSION));
        put(&mut root, "metadata", Value::Map(meta));

        let collapsed = !records.is_empty()
            && records.iter().all(|r| r.sender_id() == organisation_id);
        if let (true, Some(first)) = (collapsed, records.first()) {
            put(&mut root, "org", encode_organisation(&first.payload().sender));
        }

        put(&mut root, "type", text(CONSIGNMENTS_TYPE));
        let data = records
            .iter()
            .map(|r| encode_record(r, collapsed))
            .collect();
        put(&mut root, "data", Value::Array(data));

        let value = Value::Map(root);
        let bytes = serde_cbor::to_vec(&value)?;
        Ok(EncodedMetadata { value, bytes })
    }
}

/// One consignment read back from ledger metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedConsignment {
    /// The id the publisher declared.
    pub declared_id: String,
    pub payload: ConsignmentPayload,
}

impl DecodedConsignment {
    pub fn version_group_key(&self) -> VersionGroupKey {
        self.payload.version_group_key()
    }

    /// Check the declared id against `version`.
    pub fn verify(&self, version: u32) -> Result<ConsignmentId, IntegrityError> {
        verify_declared_id(
            &self.declared_id,
            &self.payload.sender.id,
            &self.payload.receiver.id,
            &self.payload.dispatched_at,
            version,
        )
    }
}

/// A whole batch read back from ledger metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBatch {
    pub creation_slot: u64,
    pub timestamp: Option<DateTime<Utc>>,
    pub version: String,
    /// The collapsed sender, if the batch was collapsed.
    pub organisation: Option<Organisation>,
    pub consignments: Vec<DecodedConsignment>,
}

type CborMap = BTreeMap<Value, Value>;

fn field<'a>(map: &'a CborMap, key: &str) -> Option<&'a Value> {
    map.get(&text(key))
}

fn required<'a>(map: &'a CborMap, key: &str, path: &str) -> Result<&'a Value, CodecError> {
    field(map, key).ok_or_else(|| CodecError::MissingField(format!("{path}{key}")))
}

fn as_map<'a>(value: &'a Value, path: &str) -> Result<&'a CborMap, CodecError> {
    match value {
        Value::Map(m) => Ok(m),
        other => Err(invalid(path, format!("expected map, got {other:?}"))),
    }
}

fn as_text<'a>(value: &'a Value, path: &str) -> Result<&'a str, CodecError> {
    match value {
        Value::Text(s) => Ok(s),
        other => Err(invalid(path, format!("expected text, got {other:?}"))),
    }
}

fn as_u64(value: &Value, path: &str) -> Result<u64, CodecError> {
    match value {
        Value::Integer(i) => u64::try_from(*i).map_err(|_| invalid(path, format!("{i} out of range"))),
        other => Err(invalid(path, format!("expected unsigned integer, got {other:?}"))),
    }
}

fn as_f64(value: &Value, path: &str) -> Result<f64, CodecError> {
    match value {
        Value::Text(s) => s
            .parse()
            .map_err(|_| invalid(path, format!("{s:?} is not a decimal number"))),
        Value::Float(f) => Ok(*f),
        Value::Integer(i) => Ok(*i as f64),
        other => Err(invalid(path, format!("expected decimal, got {other:?}"))),
    }
}

fn invalid(path: &str, reason: String) -> CodecError {
    CodecError::InvalidField {
        field: path.to_string(),
        reason,
    }
}

fn optional_text(map: &CborMap, key: &str, path: &str) -> Result<Option<String>, CodecError> {
    field(map, key)
        .map(|v| as_text(v, &format!("{path}{key}")).map(str::to_string))
        .transpose()
}

fn decode_organisation(value: &Value, path: &str) -> Result<Organisation, CodecError> {
    let map = as_map(value, path)?;
    let prefix = format!("{path}.");
    let id = as_text(required(map, "id", &prefix)?, &format!("{prefix}id"))?;
    Ok(Organisation {
        id: OrganisationId::new(id)?,
        name: optional_text(map, "name", &prefix)?,
        tax_id_number: optional_text(map, "tax_id_number", &prefix)?,
        currency_id: optional_text(map, "currency_id", &prefix)?,
        country_code: optional_text(map, "country_code", &prefix)?,
    })
}

fn decode_consignment(
    value: &Value,
    index: usize,
    collapsed: Option<&Organisation>,
) -> Result<DecodedConsignment, CodecError> {
    let path = format!("data[{index}]");
    let map = as_map(value, &path)?;
    let prefix = format!("{path}.");

    let declared_id = as_text(required(map, "id", &prefix)?, &format!("{prefix}id"))?.to_string();

    let goods_map = as_map(required(map, "goods", &prefix)?, &format!("{prefix}goods"))?;
    let mut goods = BTreeMap::new();
    for (k, v) in goods_map {
        let item = as_text(k, &format!("{prefix}goods"))?;
        goods.insert(item.to_string(), as_u64(v, &format!("{prefix}goods.{item}"))?);
    }

    let sender = match (field(map, "sender"), collapsed) {
        (Some(v), _) => decode_organisation(v, &format!("{prefix}sender"))?,
        (None, Some(org)) => org.clone(),
        (None, None) => return Err(CodecError::MissingField(format!("{prefix}sender"))),
    };
    let receiver = decode_organisation(
        required(map, "receiver", &prefix)?,
        &format!("{prefix}receiver"),
    )?;

    let geolocation = match (field(map, "latitude"), field(map, "longitude")) {
        (Some(lat), Some(lon)) => Some(Geolocation::new(
            as_f64(lat, &format!("{prefix}latitude"))?,
            as_f64(lon, &format!("{prefix}longitude"))?,
        )?),
        (None, None) => None,
        _ => {
            return Err(invalid(
                &format!("{prefix}latitude"),
                "latitude and longitude must appear together".into(),
            ))
        }
    };

    let dispatched_at = DispatchTimestamp::parse(as_text(
        required(map, "dispatched_at", &prefix)?,
        &format!("{prefix}dispatched_at"),
    )?)?;

    Ok(DecodedConsignment {
        declared_id,
        payload: ConsignmentPayload {
            sender,
            receiver,
            goods,
            tracking_status: optional_text(map, "tracking_status", &prefix)?
                .filter(|s| !s.trim().is_empty()),
            geolocation,
            dispatched_at,
        },
    })
}

impl CborMetadataCodec {
    /// Decode CBOR metadata bytes.
    ///
    /// Returns `Ok(None)` for well-formed metadata of another payload type.
    pub fn decode(&self, bytes: &[u8]) -> Result<Option<DecodedBatch>, CodecError> {
        let value: Value = serde_cbor::from_slice(bytes)?;
        self.decode_value(&value)
    }

    /// Decode an already parsed metadata map.
    pub fn decode_value(&self, value: &Value) -> Result<Option<DecodedBatch>, CodecError> {
        let root = as_map(value, "$")?;

        let kind = field(root, "type").map(|v| as_text(v, "type")).transpose()?;
        if kind != Some(CONSIGNMENTS_TYPE) {
            tracing::warn!(payload_type = ?kind, "skipping non-consignment metadata");
            return Ok(None);
        }

        let meta = as_map(required(root, "metadata", "")?, "metadata")?;
        let creation_slot = as_u64(
            required(meta, "creation_slot", "metadata.")?,
            "metadata.creation_slot",
        )?;
        let timestamp = field(meta, "timestamp")
            .map(|v| {
                let raw = as_text(v, "metadata.timestamp")?;
                DateTime::parse_from_rfc3339(raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| invalid("metadata.timestamp", e.to_string()))
            })
            .transpose()?;
        let version = optional_text(meta, "version", "metadata.")?
            .unwrap_or_else(|| PROTOCOL_VERSION.to_string());

        let organisation = field(root, "org")
            .map(|v| decode_organisation(v, "org"))
            .transpose()?;

        let data = match required(root, "data", "")? {
            Value::Array(items) => items,
            other => return Err(invalid("data", format!("expected array, got {other:?}"))),
        };
        let consignments = data
            .iter()
            .enumerate()
            .map(|(i, v)| decode_consignment(v, i, organisation.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(DecodedBatch {
            creation_slot,
            timestamp,
            version,
            organisation,
            consignments,
        }))
    }
}
