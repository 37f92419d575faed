use std::sync::LazyLock;

use serde_json::{json, Value};

use super::asset::{LIVE_VERSIONS, PHOTO_VERSIONS};

/// Zone every query targets.
pub(crate) const PRIMARY_ZONE: &str = "PrimarySync";

/// Record fields the asset model reads, apart from the per-rendition ones.
const RECORD_KEYS: &[&str] = &[
    "recordName",
    "recordType",
    "masterRef",
    "itemType",
    "filenameEnc",
    "assetDate",
    "addedDate",
    "isDeleted",
];

const RENDITION_SUFFIXES: &[&str] = &["Res", "Width", "Height", "FileType"];

/// `desiredKeys` of every listing page: the record fields plus the four
/// fields of each photo and live companion rendition.
pub(crate) static DESIRED_KEYS: LazyLock<Vec<String>> = LazyLock::new(|| {
    let renditions = PHOTO_VERSIONS.iter().chain(LIVE_VERSIONS).flat_map(|(_, prefix)| {
        RENDITION_SUFFIXES
            .iter()
            .map(move |suffix| format!("{prefix}{suffix}"))
    });
    RECORD_KEYS
        .iter()
        .map(|k| (*k).to_string())
        .chain(renditions)
        .collect()
});

pub(crate) fn zone_id() -> Value {
    json!({ "zoneName": PRIMARY_ZONE })
}

/// One `filterBy` entry with the `EQUALS` comparator.
pub(crate) fn equals_filter(field: &str, kind: &str, value: Value) -> Value {
    json!({
        "fieldName": field,
        "comparator": "EQUALS",
        "fieldValue": {"type": kind, "value": value},
    })
}

/// Body of a `records/query` page request starting at `rank`.
pub(crate) fn list_query(
    rank: i64,
    direction: &str,
    limit: usize,
    list_type: &str,
    filters: &[Value],
) -> Value {
    let mut filter_by = vec![
        equals_filter("startRank", "INT64", json!(rank)),
        equals_filter("direction", "STRING", json!(direction)),
    ];
    filter_by.extend(filters.iter().cloned());

    json!({
        "query": {
            "filterBy": filter_by,
            "recordType": list_type,
        },
        "resultsLimit": limit,
        "desiredKeys": &*DESIRED_KEYS,
        "zoneID": zone_id(),
    })
}

/// Body of the `HyperionIndexCountLookup` batch query for one object type.
pub(crate) fn count_query(obj_type: &str) -> Value {
    json!({
        "batch": [{
            "resultsLimit": 1,
            "query": {
                "filterBy": [{
                    "fieldName": "indexCountID",
                    "fieldValue": {"type": "STRING_LIST", "value": [obj_type]},
                    "comparator": "IN",
                }],
                "recordType": "HyperionIndexCountLookup",
            },
            "zoneWide": true,
            "zoneID": zone_id(),
        }]
    })
}

/// Body of the library indexing state lookup.
pub(crate) fn indexing_state_query() -> Value {
    json!({
        "query": {"recordType": "CheckIndexingState"},
        "zoneID": zone_id(),
    })
}

/// Body of the user folder listing.
pub(crate) fn folders_query() -> Value {
    json!({
        "query": {"recordType": "CPLAlbumByPositionLive"},
        "zoneID": zone_id(),
    })
}
