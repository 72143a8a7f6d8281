//! Path sanitizer
//!
//! Pure functions that map feed titles, episode titles and enclosure URLs
//! onto bounded file names that are valid on every platform we write to.
//! The same input always produces the same name, including when it has to
//! be truncated.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use unicode_normalization::UnicodeNormalization;
use url::Url;

/// Upper bound for a file name, in UTF-8 bytes
pub const MAX_FILE_NAME_BYTES: usize = 180;
/// Upper bound for a directory name, in UTF-8 bytes
pub const MAX_DIR_NAME_BYTES: usize = 120;
/// Longest extension accepted, without the dot
pub const MAX_EXTENSION_LEN: usize = 8;
/// Highest `" (n)"` counter tried before falling back to a hashed name
pub const MAX_UNIQUE_SUFFIX: u32 = 999;
/// Suffix of in-progress downloads
pub const PART_SUFFIX: &str = ".part";

const PLACEHOLDER: char = '_';
const HASH_LEN: usize = 8;
const FALLBACK_NAME: &str = "untitled";
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];
const WINDOWS_MAX_PATH: usize = 260;

/// Sanitize an episode title (or any string) into a file name
pub fn sanitize_file_name(input: &str) -> String {
    sanitize_component(input, MAX_FILE_NAME_BYTES)
}

/// Sanitize a feed title into a directory name
pub fn sanitize_directory_name(input: &str) -> String {
    sanitize_component(input, MAX_DIR_NAME_BYTES)
}

/// Sanitize one path component and bound it to `max_bytes`.
///
/// Windows rules (reserved device names, trailing dots and spaces, the
/// reserved character set) are applied on every platform so a download
/// tree can be copied to any filesystem.
pub fn sanitize_component(input: &str, max_bytes: usize) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.nfc() {
        let c = match c {
            '\t' | '\n' | '\r' => ' ',
            c if c.is_control() => continue,
            c if INVALID_CHARS.contains(&c) => PLACEHOLDER,
            c => c,
        };
        if c == PLACEHOLDER && out.ends_with(PLACEHOLDER) {
            continue;
        }
        out.push(c);
    }

    let mut out = trim_name(&out).to_string();
    if out.is_empty() {
        out = FALLBACK_NAME.to_string();
    }

    if is_reserved_name(&out) {
        out.insert(0, PLACEHOLDER);
    }

    if out.len() > max_bytes {
        out = truncate_with_hash(&out, input, max_bytes);
    }
    out
}

/// Leading spaces and trailing dots or spaces are not portable
fn trim_name(name: &str) -> &str {
    name.trim_start_matches(' ')
        .trim_end_matches(|c: char| c == '.' || c == ' ')
}

fn is_reserved_name(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name).trim_end();
    RESERVED_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(stem))
}

fn truncate_with_hash(name: &str, original: &str, max_bytes: usize) -> String {
    let suffix = format!("{}{}", PLACEHOLDER, short_hash(original));
    let mut cut = max_bytes.saturating_sub(suffix.len()).min(name.len());
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    let head = name[..cut].trim_end_matches(|c: char| c == '.' || c == ' ' || c == PLACEHOLDER);
    let mut out = String::with_capacity(head.len() + suffix.len());
    out.push_str(head);
    out.push_str(&suffix);
    out
}

/// First bytes of the SHA-256 digest, URL-safe base64 encoded
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut encoded = URL_SAFE_NO_PAD.encode(&digest[..6]);
    encoded.truncate(HASH_LEN);
    encoded
}

/// Derive a file extension, including the leading dot.
///
/// Tries the last segment of `url`, then `hint` (a bare file name or a
/// `Content-Disposition` value), then `fallback`. Returns an empty string
/// when none of them yields a usable extension.
pub fn get_extension(url: Option<&str>, hint: Option<&str>, fallback: &str) -> String {
    url.and_then(extension_from_url)
        .or_else(|| hint.and_then(extension_from_hint))
        .or_else(|| normalize_extension(fallback))
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default()
}

/// Extension carried by the URL path, if any
pub fn extension_from_url(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw).ok()?;
    let segment = parsed.path_segments()?.last()?;
    let decoded = urlencoding::decode(segment).ok()?;
    extension_of(&decoded)
}

/// Extension carried by a file name or `Content-Disposition` value
pub fn extension_from_hint(hint: &str) -> Option<String> {
    let name = filename_from_content_disposition(hint).unwrap_or_else(|| hint.to_string());
    let file = name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(&name);
    extension_of(file)
}

/// Extract the file name from a `Content-Disposition` header value.
///
/// `filename*` (RFC 5987) wins over `filename`.
pub fn filename_from_content_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    for part in value.split(';') {
        let Some((key, val)) = part.trim().split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let val = val.trim().trim_matches('"');
        if key == "filename*" {
            let encoded = val.rsplit_once("''").map(|(_, v)| v).unwrap_or(val);
            if let Ok(decoded) = urlencoding::decode(encoded) {
                return Some(decoded.into_owned());
            }
        } else if key == "filename" && !val.is_empty() {
            plain = Some(val.to_string());
        }
    }
    plain
}

fn extension_of(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    normalize_extension(ext)
}

fn normalize_extension(raw: &str) -> Option<String> {
    let ext: String = raw
        .trim_start_matches('.')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if ext.is_empty() || ext.len() > MAX_EXTENSION_LEN {
        None
    } else {
        Some(ext)
    }
}

/// Compose `<root>/<feed>/<episode><extension>`, bounding each segment.
///
/// The episode segment leaves room for the extension and the `.part`
/// suffix inside [`MAX_FILE_NAME_BYTES`].
pub fn build_download_path(
    root: &Path,
    feed_title: &str,
    episode_title: &str,
    extension: &str,
) -> PathBuf {
    let dir = sanitize_directory_name(feed_title);
    let budget = MAX_FILE_NAME_BYTES.saturating_sub(extension.len() + PART_SUFFIX.len());
    let stem = sanitize_component(episode_title, budget);
    apply_long_path_prefix(root.join(dir).join(format!("{stem}{extension}")))
}

/// The `.part` sibling of a final path
pub fn part_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(PART_SUFFIX);
    PathBuf::from(raw)
}

/// Replace the extension of `path`, keeping the rest of the name
pub fn with_extension(path: &Path, extension: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| FALLBACK_NAME.to_string());
    path.with_file_name(format!("{stem}{extension}"))
}

/// Return `candidate`, or the first free `"<stem> (n)<ext>"` sibling.
///
/// After [`MAX_UNIQUE_SUFFIX`] taken names a hashed name is used instead.
pub fn ensure_unique_path(candidate: &Path) -> PathBuf {
    if !is_occupied(candidate) {
        return candidate.to_path_buf();
    }

    let stem = candidate
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| FALLBACK_NAME.to_string());
    let ext = candidate
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    for n in 1..=MAX_UNIQUE_SUFFIX {
        let path = candidate.with_file_name(format!("{stem} ({n}){ext}"));
        if !is_occupied(&path) {
            return path;
        }
    }

    let mut salt: u64 = 0;
    loop {
        let hash = short_hash(&format!("{}#{salt}", candidate.display()));
        let path = candidate.with_file_name(format!("{stem}{PLACEHOLDER}{hash}{ext}"));
        if !is_occupied(&path) {
            return path;
        }
        salt += 1;
    }
}

fn is_occupied(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

/// Add the Windows extended-length prefix to long absolute paths.
///
/// `C:\...` becomes `\\?\C:\...` and `\\server\share\...` becomes
/// `\\?\UNC\server\share\...`. Short, relative or already prefixed paths
/// are returned unchanged.
pub fn to_extended_length_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    if raw.len() < WINDOWS_MAX_PATH || raw.starts_with(r"\\?\") {
        return path.to_path_buf();
    }
    let raw = raw.replace('/', "\\");
    if let Some(unc) = raw.strip_prefix(r"\\") {
        PathBuf::from(format!(r"\\?\UNC\{unc}"))
    } else if is_drive_absolute(&raw) {
        PathBuf::from(format!(r"\\?\{raw}"))
    } else {
        path.to_path_buf()
    }
}

fn is_drive_absolute(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'\\'
}

#[cfg(windows)]
fn apply_long_path_prefix(path: PathBuf) -> PathBuf {
    to_extended_length_path(&path)
}

#[cfg(not(windows))]
fn apply_long_path_prefix(path: PathBuf) -> PathBuf {
    path
}
