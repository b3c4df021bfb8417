//! Body serialization utilities.

use bytes::Bytes;

use crate::{Error, Result};

/// Serialize a value to JSON bytes.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
///
/// ```
/// use hookline_core::to_json;
///
/// let bytes = to_json(&serde_json::json!({"refreshToken": "r1"})).expect("serialize");
/// assert_eq!(bytes.as_ref(), br#"{"refreshToken":"r1"}"#);
/// ```
pub fn to_json<T: serde::Serialize>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(Into::into)
}

/// Serialize a value to form URL-encoded bytes.
///
/// # Errors
///
/// Returns an error if form serialization fails.
pub fn to_form<T: serde::Serialize>(value: &T) -> Result<Bytes> {
    serde_html_form::to_string(value)
        .map(|s| Bytes::from(s.into_bytes()))
        .map_err(Into::into)
}

/// Serialize a value to a query string.
///
/// Repeated fields (`Vec<T>`) become repeated parameters (`tags=a&tags=b`).
///
/// # Errors
///
/// Returns an error if query serialization fails.
pub fn to_query_string<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_html_form::to_string(value).map_err(Into::into)
}

/// Deserialize JSON bytes, reporting the path of the first mismatch.
///
/// # Errors
///
/// Returns [`Error::JsonDeserialization`] if the body does not match `T`.
pub fn from_json<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let deserializer = &mut serde_json::Deserializer::from_slice(bytes);
    serde_path_to_error::deserialize(deserializer).map_err(|err| {
        let path = err.path().to_string();
        Error::json_deserialization(path, err.into_inner().to_string())
    })
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Tokens {
        access: String,
        expires: u64,
    }

    #[test]
    fn to_form_encodes_pairs() {
        #[derive(Serialize)]
        struct Login {
            user: &'static str,
            scope: Vec<&'static str>,
        }

        let bytes = to_form(&Login {
            user: "alice",
            scope: vec!["read", "write"],
        })
        .expect("serialize");
        check!(bytes.as_ref() == b"user=alice&scope=read&scope=write");
    }

    #[test]
    fn query_string_skips_none() {
        #[derive(Serialize)]
        struct Search {
            q: &'static str,
            #[serde(skip_serializing_if = "Option::is_none")]
            page: Option<u32>,
        }

        let query = to_query_string(&Search { q: "rust", page: None }).expect("serialize");
        check!(query == "q=rust");
    }

    #[test]
    fn from_json_roundtrips_valid_body() {
        let tokens: Tokens = from_json(br#"{"access":"a","expires":60}"#).expect("deserialize");
        check!(
            tokens
                == Tokens {
                    access: "a".to_string(),
                    expires: 60
                }
        );
    }

    #[test]
    fn from_json_reports_path() {
        let_assert!(
            Err(Error::JsonDeserialization { path, .. }) =
                from_json::<Tokens>(br#"{"access":"a","expires":"soon"}"#)
        );
        check!(path == "expires");
    }
}
