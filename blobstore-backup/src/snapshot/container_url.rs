//! Redaction of container URLs before they reach logs or error messages.

use std::collections::BTreeMap;

use url::Url;

const REDACTED: &str = "REDACTED";

/// Replaces every query parameter except `snapshot` with `REDACTED`.
///
/// Parameters come out sorted by key. Input that does not parse as a URL is
/// returned unchanged so it can still be logged.
pub fn sanitise(raw: &str) -> String {
    let Ok(mut parsed) = Url::parse(raw) else {
        return raw.to_string();
    };

    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in parsed.query_pairs() {
        params.entry(key.into_owned()).or_default().push(value.into_owned());
    }

    if params.is_empty() {
        parsed.set_query(None);
        return parsed.to_string();
    }

    {
        let mut query = parsed.query_pairs_mut();
        query.clear();
        for (key, values) in &params {
            if key == "snapshot" {
                for value in values {
                    query.append_pair(key, value);
                }
            } else {
                query.append_pair(key, REDACTED);
            }
        }
    }

    parsed.to_string()
}
