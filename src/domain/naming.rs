use parking_lot::Mutex;
use std::collections::HashMap;

/// Characters that are unsafe in storage keys and URLs.
pub const UNSAFE_CHARS: &str = "#\"';?:@&=+$,%!\r\n";

/// Longest storage key segment kept verbatim.
pub const MAX_SEGMENT_LEN: usize = 250;

const SLASH_TOKEN: &str = ".slash.";

/// Escapes a metric/variant/filename so it can be used as a single storage
/// key segment.
///
/// Back-slashes are normalized to slashes, surrounding slashes dropped, inner
/// slashes replaced by `.slash.` and every unsafe character hex encoded as
/// `0x{hh}`.
pub fn escape_storage_name(part: &str) -> String {
    let normalized = part.replace('\\', "/");
    let slashed = normalized.trim_matches('/').replace('/', SLASH_TOKEN);

    let mut escaped = String::with_capacity(slashed.len());
    for c in slashed.chars() {
        if UNSAFE_CHARS.contains(c) {
            escaped.push_str(&format!("0x{:02x}", c as u32));
        } else {
            escaped.push(c);
        }
    }
    escaped
}

/// Shortens an over-long key segment by hashing it, keeping the final
/// extension when that is enough to fit.
pub fn limit_segment(segment: &str) -> String {
    if segment.len() <= MAX_SEGMENT_LEN {
        return segment.to_string();
    }

    if let Some((stem, ext)) = segment.rsplit_once('.') {
        let shortened = format!("{:x}.{ext}", md5::compute(stem.as_bytes()));
        if shortened.len() <= MAX_SEGMENT_LEN {
            return shortened;
        }
    }

    format!("{:x}", md5::compute(segment.as_bytes()))
}

/// Builds the storage key and full destination URL of an upload.
///
/// Returns `(key, url)`. The key is the slash-joined list of the non-empty
/// prefix, metric, variant and filename; metric, variant and filename are
/// escaped, and every segment is length limited.
pub fn build_target(
    storage_uri: &str,
    key_prefix: Option<&str>,
    metric: &str,
    variant: &str,
    filename: &str,
) -> (String, String) {
    let escaped = [
        escape_storage_name(metric),
        escape_storage_name(variant),
        escape_storage_name(filename),
    ];

    let key = key_prefix
        .into_iter()
        .map(str::to_string)
        .chain(escaped)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/");

    let key = key
        .split('/')
        .map(limit_segment)
        .collect::<Vec<_>>()
        .join("/");

    let base = storage_uri.trim_matches('/');
    let mut url = format!("{base}/{}", key.trim_matches('/'));
    if storage_uri.starts_with('/') {
        url.insert(0, '/');
    }

    (key, quote_http_path(&url))
}

/// Percent-encodes the path of http(s) URLs; any other scheme is returned
/// untouched.
pub fn quote_http_path(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
        return url.to_string();
    }
    let Some(path_start) = rest.find('/') else {
        return url.to_string();
    };

    let (authority, path) = rest.split_at(path_start);
    let quoted = path
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("{scheme}://{authority}{quoted}")
}

/// Per `(metric, variant)` upload counters used for filename rotation.
#[derive(Debug, Default)]
pub struct FileNameCounters {
    counters: Mutex<HashMap<String, u64>>,
}

impl FileNameCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next count for the pair, starting at 0.
    pub fn next(&self, metric: &str, variant: &str) -> u64 {
        let mut counters = self.counters.lock();
        let slot = counters
            .entry(format!("{metric}_{variant}"))
            .and_modify(|count| *count += 1)
            .or_insert(0);
        *slot
    }
}

/// Default upload file name, rotating inside `history_size` slots.
pub fn rotated_file_name(metric: &str, variant: &str, count: u64, history_size: i64) -> String {
    let slot = if history_size < 1 {
        count
    } else {
        count % history_size as u64
    };
    format!("{metric}_{variant}_{slot:08}")
}
