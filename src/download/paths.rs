use std::fmt::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Local, Timelike, Utc};

/// Characters replaced by `_` in local names.
const INVALID_NAME_CHARS: &[char] = &[
    ' ', '!', '@', '#', '$', '%', '^', '&', '(', ')', '+', '=', '[', ']', '{', '}', ';', ':', '\'',
    '"', ',', '.', '<', '>', '/', '?', '\\', '|',
];

/// Replace every filesystem- or shell-hostile character with `_`.
pub fn clean_name(name: &str) -> String {
    name.chars()
        .map(|c| if INVALID_NAME_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

/// Like [`clean_name`], but the extension (from the last `.`) is kept as is.
pub fn clean_filename(filename: &str) -> String {
    match filename.rfind('.') {
        Some(pos) if !filename[pos..].contains('/') => {
            let (stem, ext) = filename.split_at(pos);
            let mut out = clean_name(stem);
            out.push_str(ext);
            out
        }
        _ => clean_name(filename),
    }
}

/// `output` plus the date subfolders for `date` in local time.
///
/// `folder_structure` is a date format such as `"%Y/%m"` or the wrapped
/// `"{:%Y/%m/%d}"`. Empty, `"/"` and `"none"` (case-insensitive) put files
/// directly under `output`.
pub fn date_folder(output: &Path, folder_structure: &str, date: &DateTime<Utc>) -> PathBuf {
    let trimmed = folder_structure.trim();
    if trimmed.is_empty() || trimmed == "/" || trimmed.eq_ignore_ascii_case("none") {
        return output.to_path_buf();
    }

    let format_str = trimmed
        .strip_prefix("{:")
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(trimmed);

    let date_path = expand_date_format(format_str, &date.with_timezone(&Local));

    let mut path = output.to_path_buf();
    for component in date_path.split('/') {
        if !component.is_empty() {
            path.push(component);
        }
    }
    path
}

/// Expand date format tokens (%Y, %m, %d, %H, %M, %S) in a single pass.
fn expand_date_format(format_str: &str, date: &DateTime<Local>) -> String {
    let mut result = String::with_capacity(format_str.len() + 8);
    let mut chars = format_str.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '%' {
            match chars.peek() {
                Some('Y') => {
                    chars.next();
                    let _ = write!(result, "{:04}", date.year());
                }
                Some('m') => {
                    chars.next();
                    let _ = write!(result, "{:02}", date.month());
                }
                Some('d') => {
                    chars.next();
                    let _ = write!(result, "{:02}", date.day());
                }
                Some('H') => {
                    chars.next();
                    let _ = write!(result, "{:02}", date.hour());
                }
                Some('M') => {
                    chars.next();
                    let _ = write!(result, "{:02}", date.minute());
                }
                Some('S') => {
                    chars.next();
                    let _ = write!(result, "{:02}", date.second());
                }
                _ => result.push(c), // Unknown token, keep the %
            }
        } else {
            result.push(c);
        }
    }

    result
}

/// Sibling temp path the transfer streams into before the final rename.
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}
