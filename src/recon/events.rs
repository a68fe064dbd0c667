//! Storage "object created" notifications that announce a finished
//! inventory report. Each notice whose object is a `manifest.json` turns
//! into one reconciliation request; the report id is the name of the
//! directory holding the manifest.

use crate::recon::inventory::MANIFEST_FILE;
use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(rename = "Records", default)]
    records: Vec<EventRecord>,
}

#[derive(Debug, Deserialize)]
struct EventRecord {
    s3: Option<S3Entity>,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: BucketRef,
    object: ObjectRef,
}

/// Accepts both `{"name": ".."}` and a bare bucket string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BucketRef {
    Named { name: String },
    Bare(String),
}

impl BucketRef {
    fn name(&self) -> &str {
        match self {
            Self::Named { name } => name,
            Self::Bare(name) => name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ObjectRef {
    #[serde(alias = "name")]
    key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportNotice {
    pub bucket: String,
    pub manifest_key: String,
    pub report_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBatch {
    pub notices: Vec<ReportNotice>,
    /// Records that announced no report, with the reason.
    pub skipped: Vec<String>,
}

/// Object keys arrive form-encoded (`+` for space, `%XX` escapes).
fn decode_object_key(raw: &str) -> Result<String, std::string::FromUtf8Error> {
    urlencoding::decode(&raw.replace('+', " ")).map(|key| key.into_owned())
}

fn report_id_for(manifest_key: &str) -> Option<String> {
    let (parent, name) = manifest_key.rsplit_once('/')?;
    if name != MANIFEST_FILE {
        return None;
    }
    let id = parent.rsplit('/').next()?;
    if id.is_empty() {
        return None;
    }
    Some(id.to_string())
}

pub fn parse_events(raw: &str) -> Result<EventBatch> {
    let envelope: EventEnvelope =
        serde_json::from_str(raw).context("event payload is not a Records document")?;
    let mut batch = EventBatch::default();
    for (idx, record) in envelope.records.into_iter().enumerate() {
        let Some(s3) = record.s3 else {
            batch.skipped.push(format!("record {idx}: no s3 entity"));
            continue;
        };
        let manifest_key = match decode_object_key(&s3.object.key) {
            Ok(key) => key,
            Err(err) => {
                batch.skipped.push(format!(
                    "record {idx}: object key `{}` does not decode to UTF-8: {err}",
                    s3.object.key
                ));
                continue;
            }
        };
        match report_id_for(&manifest_key) {
            Some(report_id) => batch.notices.push(ReportNotice {
                bucket: s3.bucket.name().to_string(),
                manifest_key,
                report_id,
            }),
            None => batch
                .skipped
                .push(format!("record {idx}: `{manifest_key}` is not an inventory manifest")),
        }
    }
    Ok(batch)
}
