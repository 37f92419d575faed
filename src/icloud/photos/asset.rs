use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::download::paths::{clean_filename, clean_name, date_folder};
use crate::types::{FileStructure, VersionSize};

/// Field prefixes of the still image renditions.
pub(super) const PHOTO_VERSIONS: &[(VersionSize, &str)] = &[
    (VersionSize::Original, "resOriginal"),
    (VersionSize::Medium, "resJPEGMed"),
    (VersionSize::Thumb, "resJPEGThumb"),
];

/// Field prefixes of the live photo companion video renditions.
pub(super) const LIVE_VERSIONS: &[(VersionSize, &str)] = &[
    (VersionSize::Original, "resOriginalVidCompl"),
    (VersionSize::Medium, "resVidMed"),
    (VersionSize::Thumb, "resVidSmall"),
];

/// One downloadable rendition of an asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetVersion {
    pub filename: String,
    pub width: u64,
    pub height: u64,
    pub size: u64,
    pub url: String,
    pub asset_type: String,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct Versions {
    photo: HashMap<VersionSize, AssetVersion>,
    live: HashMap<VersionSize, AssetVersion>,
}

/// A remote asset: the `CPLMaster` record joined with its optional
/// `CPLAsset` overlay. Serialized as `{"master_record", "asset_record"}`,
/// which is also the checkpoint store's payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoAsset {
    master_record: Value,
    #[serde(default)]
    asset_record: Option<Value>,
    #[serde(skip)]
    versions: OnceLock<Versions>,
}

impl PhotoAsset {
    pub fn new(master_record: Value, asset_record: Option<Value>) -> Self {
        Self {
            master_record,
            asset_record,
            versions: OnceLock::new(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// The unique record name from the master record.
    pub fn id(&self) -> &str {
        self.master_record["recordName"].as_str().unwrap_or_else(|| {
            warn!("Missing expected field: recordName");
            ""
        })
    }

    /// Decoded `filenameEnc`, or `None` when absent or undecodable.
    fn raw_filename(&self) -> Option<String> {
        let enc = &self.master_record["fields"]["filenameEnc"];
        let value = enc["value"].as_str().filter(|v| !v.is_empty())?;
        match enc["type"].as_str().unwrap_or("ENCRYPTED_BYTES") {
            "STRING" => Some(value.to_string()),
            "ENCRYPTED_BYTES" => {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(value)
                    .ok()?;
                String::from_utf8(decoded).ok().filter(|s| !s.is_empty())
            }
            other => {
                warn!(kind = other, "Unsupported filenameEnc type");
                None
            }
        }
    }

    /// Cleaned file name; the live companion swaps everything after the
    /// first `.` for `.MOV`.
    pub fn filename(&self, live_photo: bool) -> String {
        let name = match self.raw_filename() {
            Some(name) => clean_filename(&name),
            None => clean_filename(self.id()),
        };
        if !live_photo {
            return name;
        }
        match name.split_once('.') {
            Some((stem, _)) => format!("{stem}.MOV"),
            None => format!("{name}.MOV"),
        }
    }

    /// Byte size of the original rendition.
    pub fn size(&self) -> u64 {
        self.master_record["fields"]["resOriginalRes"]["value"]["size"]
            .as_u64()
            .unwrap_or(0)
    }

    /// When the asset was added to the library (master `created` stamp).
    pub fn added_date(&self) -> DateTime<Utc> {
        millis(&self.master_record["created"]["timestamp"]).unwrap_or_default()
    }

    /// Capture date from the overlay, or the added date without one.
    pub fn asset_date(&self) -> DateTime<Utc> {
        self.asset_record
            .as_ref()
            .and_then(|a| millis(&a["fields"]["assetDate"]["value"]))
            .unwrap_or_else(|| self.added_date())
    }

    pub fn is_live_photo(&self) -> bool {
        let fields = &self.master_record["fields"];
        let has_url = |res: &str| {
            fields[res]["value"]["downloadURL"]
                .as_str()
                .is_some_and(|u| !u.is_empty())
        };
        has_url("resOriginalRes") && has_url("resOriginalVidComplRes")
    }

    /// Rendition of the given size, or `None` when it has no download URL.
    pub fn version(&self, size: VersionSize, live_photo: bool) -> Option<&AssetVersion> {
        let versions = self.versions.get_or_init(|| self.pack_versions());
        let map = if live_photo {
            &versions.live
        } else {
            &versions.photo
        };
        map.get(&size)
    }

    fn pack_versions(&self) -> Versions {
        Versions {
            photo: self.pack(PHOTO_VERSIONS, false),
            live: self.pack(LIVE_VERSIONS, true),
        }
    }

    fn pack(
        &self,
        lookup: &[(VersionSize, &str)],
        live_photo: bool,
    ) -> HashMap<VersionSize, AssetVersion> {
        let fields = &self.master_record["fields"];
        let filename = self.filename(live_photo);
        lookup
            .iter()
            .filter_map(|(size, prefix)| {
                let res = &fields[format!("{prefix}Res")]["value"];
                let url = res["downloadURL"].as_str().filter(|u| !u.is_empty())?;
                Some((
                    *size,
                    AssetVersion {
                        filename: filename.clone(),
                        width: fields[format!("{prefix}Width")]["value"]
                            .as_u64()
                            .unwrap_or(0),
                        height: fields[format!("{prefix}Height")]["value"]
                            .as_u64()
                            .unwrap_or(0),
                        size: res["size"].as_u64().unwrap_or(0),
                        url: url.to_string(),
                        asset_type: fields[format!("{prefix}FileType")]["value"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        checksum: res["fileChecksum"].as_str().map(str::to_string),
                    },
                ))
            })
            .collect()
    }

    /// `{output}/{date folder}` for this asset's capture date.
    pub fn output_dir(&self, output: &Path, folder_structure: &str) -> PathBuf {
        date_folder(output, folder_structure, &self.asset_date())
    }

    /// Deterministic local file path inside `dir`.
    pub fn local_path(
        &self,
        dir: &Path,
        size: VersionSize,
        structure: FileStructure,
        live_photo: bool,
    ) -> PathBuf {
        let filename = self.filename(live_photo);
        let (stem, ext) = match filename.rfind('.') {
            Some(pos) => filename.split_at(pos),
            None => (filename.as_str(), ""),
        };
        let name = match structure {
            FileStructure::Name => stem.to_string(),
            FileStructure::Id => clean_name(self.id()),
        };
        match size {
            VersionSize::Original => dir.join(format!("{name}{ext}")),
            other => dir.join(format!("{name}_{}{ext}", other.as_str())),
        }
    }
}

fn millis(value: &Value) -> Option<DateTime<Utc>> {
    let ms = value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))?;
    DateTime::from_timestamp_millis(ms)
}

impl std::fmt::Display for PhotoAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<PhotoAsset: id={}>", self.id())
    }
}
