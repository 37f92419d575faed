use base64::Engine;
use serde_json::json;

use super::album::{AlbumQuery, Direction};
use super::cloudkit::Record;
use super::queries::equals_filter;

pub const ALL_PHOTOS: &str = "All Photos";
pub const RECENTLY_DELETED: &str = "Recently Deleted";

// Apple's sentinel folder IDs: containers, not real albums.
const ROOT_FOLDER: &str = "----Root-Folder----";
const PROJECT_ROOT_FOLDER: &str = "----Project-Root-Folder----";

const USER_FOLDER_LIST_TYPE: &str = "CPLContainerRelationLiveByAssetDate";

pub struct FolderDef {
    pub obj_type: &'static str,
    pub list_type: &'static str,
    pub smart_album: Option<&'static str>,
}

impl FolderDef {
    pub fn query(&self) -> AlbumQuery {
        AlbumQuery {
            obj_type: self.obj_type.to_string(),
            list_type: self.list_type.to_string(),
            direction: Direction::Ascending,
            filters: self
                .smart_album
                .map(|v| vec![equals_filter("smartAlbum", "STRING", json!(v))])
                .unwrap_or_default(),
        }
    }
}

const fn smart(obj_type: &'static str, value: &'static str) -> FolderDef {
    FolderDef {
        obj_type,
        list_type: "CPLAssetAndMasterInSmartAlbumByAssetDate",
        smart_album: Some(value),
    }
}

/// Built-in albums every library exposes.
pub fn smart_folders() -> Vec<(&'static str, FolderDef)> {
    vec![
        (
            ALL_PHOTOS,
            FolderDef {
                obj_type: "CPLAssetByAddedDate",
                list_type: "CPLAssetAndMasterByAddedDate",
                smart_album: None,
            },
        ),
        (
            "Time-lapse",
            smart("CPLAssetInSmartAlbumByAssetDate:Timelapse", "TIMELAPSE"),
        ),
        ("Videos", smart("CPLAssetInSmartAlbumByAssetDate:Video", "VIDEO")),
        ("Slo-mo", smart("CPLAssetInSmartAlbumByAssetDate:Slomo", "SLOMO")),
        (
            "Bursts",
            FolderDef {
                obj_type: "CPLAssetBurstStackAssetByAssetDate",
                list_type: "CPLBurstStackAssetAndMasterByAssetDate",
                smart_album: None,
            },
        ),
        (
            "Favorites",
            smart("CPLAssetInSmartAlbumByAssetDate:Favorite", "FAVORITE"),
        ),
        (
            "Panoramas",
            smart("CPLAssetInSmartAlbumByAssetDate:Panorama", "PANORAMA"),
        ),
        (
            "Screenshots",
            smart("CPLAssetInSmartAlbumByAssetDate:Screenshot", "SCREENSHOT"),
        ),
        ("Live", smart("CPLAssetInSmartAlbumByAssetDate:Live", "LIVE")),
        (
            RECENTLY_DELETED,
            FolderDef {
                obj_type: "CPLAssetDeletedByExpungedDate",
                list_type: "CPLAssetAndMasterDeletedByExpungedDate",
                smart_album: None,
            },
        ),
        (
            "Hidden",
            FolderDef {
                obj_type: "CPLAssetHiddenByAssetDate",
                list_type: "CPLAssetAndMasterHiddenByAssetDate",
                smart_album: None,
            },
        ),
    ]
}

/// Turn a `CPLAlbumByPositionLive` record into a named album query.
/// Sentinels, deleted folders and folders without a usable name yield `None`.
pub fn user_folder(record: &Record) -> Option<(String, AlbumQuery)> {
    let id = record.record_name.as_str();
    if id == ROOT_FOLDER || id == PROJECT_ROOT_FOLDER {
        return None;
    }
    if record.fields["isDeleted"]["value"].as_bool().unwrap_or(false) {
        return None;
    }
    let encoded = record.fields["albumNameEnc"]["value"].as_str()?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let name = String::from_utf8(decoded).ok()?;
    if name.is_empty() {
        return None;
    }

    Some((
        name,
        AlbumQuery {
            obj_type: format!("CPLContainerRelationNotDeletedByAssetDate:{id}"),
            list_type: USER_FOLDER_LIST_TYPE.to_string(),
            direction: Direction::Ascending,
            filters: vec![equals_filter("parentId", "STRING", json!(id))],
        },
    ))
}
