//! Canonical query and header maps.
//!
//! Both maps normalise on insert (percent-encoding for query pairs,
//! lower-casing and trimming for headers) and render in strict byte order,
//! so rendering an already-sorted map is idempotent.

use std::collections::BTreeMap;

/// Percent-encode everything except the RFC 3986 unreserved set.
pub fn uri_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Decode `%XX` escapes and `+` in a raw query string component.
fn uri_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(digit: u8) -> Option<u8> {
    (digit as char).to_digit(16).map(|d| d as u8)
}

/// Query parameters, stored encoded and ordered by encoded key then value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalQuery {
    pairs: BTreeMap<String, Vec<String>>,
}

impl CanonicalQuery {
    /// Parse `a=1&b=2` (already URL-encoded) into a canonical map.
    pub fn parse(raw: &str) -> Self {
        let mut query = Self::default();
        for pair in raw.trim_start_matches('?').split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            query.insert(&uri_decode(key), &uri_decode(value));
        }
        query
    }

    /// Add a raw (unencoded) pair.
    pub fn insert(&mut self, key: &str, value: &str) {
        let values = self.pairs.entry(uri_encode(key)).or_default();
        values.push(uri_encode(value));
        values.sort();
    }

    /// Merge another map's pairs into this one.
    pub fn merge(&mut self, other: CanonicalQuery) {
        for (key, mut values) in other.pairs {
            let entry = self.pairs.entry(key).or_default();
            entry.append(&mut values);
            entry.sort();
        }
    }

    /// Whether the map has no pairs.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// `k=v&k=v`, sorted; empty string when there are no pairs.
    pub fn render(&self) -> String {
        self.pairs
            .iter()
            .flat_map(|(key, values)| values.iter().map(move |value| format!("{key}={value}")))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Signed headers keyed by lower-cased name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalHeaders {
    headers: BTreeMap<String, String>,
}

impl CanonicalHeaders {
    /// Add a header; a later value for the same name replaces the earlier one.
    pub fn insert(&mut self, name: &str, value: &str) {
        self.headers
            .insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    /// Look up a header by (case-insensitive) name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// `name:value\n` per header, sorted, including the trailing newline.
    pub fn render(&self) -> String {
        self.headers
            .iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect()
    }

    /// Sorted names joined with `;`.
    pub fn signed_names(&self) -> String {
        self.headers.keys().cloned().collect::<Vec<_>>().join(";")
    }

    /// Iterate `(name, value)` pairs in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_encode_reserved() {
        assert_eq!(uri_encode("AKID/20200101/us-east-1"), "AKID%2F20200101%2Fus-east-1");
        assert_eq!(uri_encode("a b+c=d"), "a%20b%2Bc%3Dd");
        assert_eq!(uri_encode("safe-_.~"), "safe-_.~");
        assert_eq!(uri_encode("!*'()"), "%21%2A%27%28%29");
    }

    #[test]
    fn test_query_sorted_by_encoded_key() {
        let mut query = CanonicalQuery::default();
        query.insert("withUserData", "true");
        query.insert("type", "ucore");
        query.insert("X-Amz-Date", "20200101T000000Z");
        assert_eq!(
            query.render(),
            "X-Amz-Date=20200101T000000Z&type=ucore&withUserData=true"
        );
    }

    #[test]
    fn test_query_parse_matches_insert() {
        let parsed = CanonicalQuery::parse("type=ucore&withUserData=true");
        let mut built = CanonicalQuery::default();
        built.insert("withUserData", "true");
        built.insert("type", "ucore");
        assert_eq!(parsed, built);
    }

    #[test]
    fn test_query_parse_decodes_before_encoding() {
        let query = CanonicalQuery::parse("?path=%2Fa%2Fb&q=x+y");
        assert_eq!(query.render(), "path=%2Fa%2Fb&q=x%20y");
    }

    #[test]
    fn test_empty_query_renders_empty() {
        assert_eq!(CanonicalQuery::parse("").render(), "");
        assert!(CanonicalQuery::default().is_empty());
    }

    #[test]
    fn test_render_is_idempotent() {
        let query = CanonicalQuery::parse("b=2&a=1&c=3");
        let again = CanonicalQuery::parse(&query.render());
        assert_eq!(query.render(), again.render());
    }

    #[test]
    fn test_header_insertion_order_is_irrelevant() {
        let mut forward = CanonicalHeaders::default();
        forward.insert("Host", "api.example.com");
        forward.insert("X-Amz-Date", "20200101T000000Z");
        forward.insert("Content-Type", "application/json");

        let mut reverse = CanonicalHeaders::default();
        reverse.insert("content-type", "application/json");
        reverse.insert("x-amz-date", "20200101T000000Z");
        reverse.insert("host", "api.example.com");

        assert_eq!(forward, reverse);
        assert_eq!(forward.render(), reverse.render());
        assert_eq!(forward.signed_names(), "content-type;host;x-amz-date");

        // Re-inserting the sorted output changes nothing.
        let mut resorted = CanonicalHeaders::default();
        for (name, value) in forward.iter() {
            resorted.insert(name, value);
        }
        assert_eq!(resorted.render(), forward.render());
    }

    #[test]
    fn test_headers_lowercased_and_trimmed() {
        let mut headers = CanonicalHeaders::default();
        headers.insert("X-Amz-Date", " 20200101T000000Z ");
        headers.insert("Host", "example.com");
        assert_eq!(headers.render(), "host:example.com\nx-amz-date:20200101T000000Z\n");
        assert_eq!(headers.signed_names(), "host;x-amz-date");
        assert_eq!(headers.get("HOST"), Some("example.com"));
    }
}
