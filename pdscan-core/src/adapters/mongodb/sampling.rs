//! MongoDB document sampling.
//!
//! Documents are read most recent first (`_id` descending, since ObjectIds
//! embed their creation time) with the driver fetching `fetch_size`
//! documents per round trip. Nested documents and arrays are flattened into
//! dot paths.

use crate::adapters::RecordBatchStream;
use crate::error::ScanError;
use crate::models::SampledRecord;
use futures::StreamExt;
use mongodb::Client;
use mongodb::bson::{Bson, Document, doc};
use mongodb::options::FindOptions;

/// Sort document for "most recent first".
pub fn most_recent_sort() -> Document {
    doc! { "_id": -1 }
}

/// Streams up to `sample_size` documents from `database.collection`.
///
/// # Errors
/// Returns a query error if the find command is rejected.
pub async fn sample_collection(
    client: &Client,
    database: &str,
    collection: &str,
    sample_size: u32,
    fetch_size: u32,
) -> crate::Result<RecordBatchStream> {
    let unit = format!("{}.{}", database, collection);
    let options = FindOptions::builder()
        .sort(most_recent_sort())
        .limit(i64::from(sample_size))
        .batch_size(fetch_size)
        .build();

    let cursor = client
        .database(database)
        .collection::<Document>(collection)
        .find(doc! {})
        .with_options(options)
        .await
        .map_err(|e| {
            ScanError::query_failed(format!("Failed to sample documents from '{}'", unit), e)
        })?;

    let chunk = usize::try_from(fetch_size.max(1)).unwrap_or(usize::MAX);
    Ok(cursor
        .map(move |result| {
            result.map(|doc| document_to_record(&doc)).map_err(|e| {
                ScanError::query_failed(format!("Failed to iterate cursor for '{}'", unit), e)
            })
        })
        .chunks(chunk)
        .map(|batch| batch.into_iter().collect::<crate::Result<Vec<_>>>())
        .boxed())
}

/// Flattens a BSON document into a record.
///
/// ObjectIds become hex strings and dates RFC 3339. Nulls, binaries and
/// code values are dropped.
pub fn document_to_record(doc: &Document) -> SampledRecord {
    let mut record = SampledRecord::new();
    for (key, value) in doc {
        flatten_bson(&mut record, key.clone(), value);
    }
    record
}

fn flatten_bson(record: &mut SampledRecord, path: String, value: &Bson) {
    match value {
        Bson::Document(nested) => {
            for (key, inner) in nested {
                flatten_bson(record, format!("{}.{}", path, key), inner);
            }
        }
        Bson::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                flatten_bson(record, format!("{}.{}", path, idx), item);
            }
        }
        Bson::String(s) | Bson::Symbol(s) => record.insert(path, s.as_str()),
        Bson::Int32(n) => record.insert(path, n.to_string()),
        Bson::Int64(n) => record.insert(path, n.to_string()),
        Bson::Double(n) => record.insert(path, n.to_string()),
        Bson::Boolean(b) => record.insert(path, b.to_string()),
        Bson::ObjectId(oid) => record.insert(path, oid.to_hex()),
        Bson::DateTime(dt) => {
            if let Ok(text) = dt.try_to_rfc3339_string() {
                record.insert(path, text);
            }
        }
        Bson::Decimal128(_) | Bson::Timestamp(_) | Bson::RegularExpression(_) => {
            record.insert(path, value.to_string());
        }
        _ => {}
    }
}
