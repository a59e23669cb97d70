//! Header normalization
//!
//! Converts raw header fields returned by a session into [`HeaderRecord`]s.

use log::debug;

use crate::models::{EmailAddress, FetchedHeaders, HeaderRecord};

/// Normalize fetched headers into a header record for `folder`
pub fn normalize_headers(folder: &str, headers: FetchedHeaders) -> HeaderRecord {
    let mut builder = HeaderRecord::builder(headers.uid, folder)
        .subject(
            headers
                .subject
                .as_deref()
                .map(decode_encoded_words)
                .unwrap_or_default()
                .trim(),
        )
        .has_unsubscribe(
            headers
                .list_unsubscribe
                .as_deref()
                .is_some_and(|v| !v.trim().is_empty()),
        )
        .flagged(headers.flagged)
        .received_at(headers.internal_date);

    if let Some(from) = headers.from.as_deref() {
        builder = builder.sender(EmailAddress::parse(&decode_encoded_words(from)));
    }

    builder.build()
}

/// Decode RFC 2047 encoded words (`=?charset?B|Q?text?=`) in a header value.
///
/// Charsets are resolved through `mailparse`, so legacy encodings such as
/// windows-1252 or koi8-r decode to the right characters. A value that
/// cannot be parsed as a header is returned unchanged.
pub fn decode_encoded_words(value: &str) -> String {
    if !value.contains("=?") {
        return value.to_string();
    }

    let raw = format!("Subject: {}", value);
    match mailparse::parse_header(raw.as_bytes()) {
        Ok((header, _)) => header.get_value(),
        Err(e) => {
            debug!("Keeping undecodable header value: {}", e);
            value.to_string()
        }
    }
}
