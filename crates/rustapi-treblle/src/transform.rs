//! Body-to-JSON conversion, with an optional user-supplied override.
//!
//! # Example
//!
//! ```ignore
//! use rustapi_treblle::{TreblleConfig, Transformer};
//!
//! let config = TreblleConfig::new()
//!     .request_transformer(|body: &bytes::Bytes| {
//!         let text = std::str::from_utf8(body)?;
//!         Ok(serde_json::json!({ "lines": text.lines().count() }))
//!     });
//! ```

use crate::error::{CaptureError, Side};
use bytes::Bytes;
use serde_json::{json, Value};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Error type user transformers may return.
pub type TransformError = Box<dyn std::error::Error + Send + Sync>;

/// A user-supplied body conversion.
///
/// Implemented for every `Fn(&Bytes) -> Result<Value, TransformError>`.
pub trait BodyTransformer: Send + Sync + 'static {
    /// Convert raw body bytes into the value placed in the payload.
    fn transform(&self, body: &Bytes) -> Result<Value, TransformError>;
}

impl<F> BodyTransformer for F
where
    F: Fn(&Bytes) -> Result<Value, TransformError> + Send + Sync + 'static,
{
    fn transform(&self, body: &Bytes) -> Result<Value, TransformError> {
        self(body)
    }
}

/// How a captured body becomes a JSON value.
#[derive(Clone, Default)]
pub enum Transformer {
    /// Decode the bytes as JSON text.
    ///
    /// Empty bodies become `{}`; anything that is not JSON becomes an
    /// `{"unparsed": true, "size": n}` marker.
    #[default]
    DefaultJsonDecode,
    /// The caller's conversion, used verbatim.
    UserSupplied(Arc<dyn BodyTransformer>),
}

impl fmt::Debug for Transformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transformer::DefaultJsonDecode => f.write_str("DefaultJsonDecode"),
            Transformer::UserSupplied(_) => f.write_str("UserSupplied(..)"),
        }
    }
}

impl Transformer {
    /// Wrap a user conversion.
    pub fn user<T: BodyTransformer>(transformer: T) -> Self {
        Transformer::UserSupplied(Arc::new(transformer))
    }

    /// Check if this is a caller-supplied hook.
    pub fn is_user_supplied(&self) -> bool {
        matches!(self, Transformer::UserSupplied(_))
    }

    /// Convert a body.
    ///
    /// User hooks run behind a panic boundary; both errors and panics come
    /// back as a [`CaptureError`] for the given side.
    pub fn apply(&self, side: Side, body: &Bytes) -> Result<Value, CaptureError> {
        match self {
            Transformer::DefaultJsonDecode => Ok(decode_json(body)),
            Transformer::UserSupplied(hook) => {
                match catch_unwind(AssertUnwindSafe(|| hook.transform(body))) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(CaptureError::Transform {
                        side,
                        message: err.to_string(),
                    }),
                    Err(panic) => Err(CaptureError::TransformPanicked {
                        side,
                        message: panic_message(panic.as_ref()),
                    }),
                }
            }
        }
    }
}

/// Default conversion.
pub fn decode_json(body: &Bytes) -> Value {
    if body.is_empty() {
        return json!({});
    }
    serde_json::from_slice(body).unwrap_or_else(|_| json!({ "unparsed": true, "size": body.len() }))
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_decodes_json() {
        let body = Bytes::from_static(br#"{"a": [1, 2]}"#);
        let value = Transformer::default().apply(Side::Request, &body).unwrap();
        assert_eq!(value, json!({"a": [1, 2]}));
    }

    #[test]
    fn test_default_marks_non_json() {
        let body = Bytes::from_static(b"<html></html>");
        let value = Transformer::default().apply(Side::Response, &body).unwrap();
        assert_eq!(value, json!({"unparsed": true, "size": 13}));
    }

    #[test]
    fn test_default_empty_body() {
        let value = decode_json(&Bytes::new());
        assert_eq!(value, json!({}));
    }

    #[test]
    fn test_user_hook_output_used_verbatim() {
        let hook = Transformer::user(|body: &Bytes| -> Result<Value, TransformError> {
            Ok(json!({ "len": body.len() }))
        });
        let value = hook.apply(Side::Request, &Bytes::from_static(b"{}")).unwrap();
        assert_eq!(value, json!({"len": 2}));
    }

    #[test]
    fn test_user_hook_error_is_contained() {
        let hook = Transformer::user(|_: &Bytes| -> Result<Value, TransformError> {
            Err("bad input".into())
        });
        let err = hook.apply(Side::Request, &Bytes::new()).unwrap_err();
        assert!(matches!(err, CaptureError::Transform { side: Side::Request, .. }));
        assert!(err.to_string().contains("bad input"));
    }

    #[test]
    fn test_user_hook_panic_is_contained() {
        let hook = Transformer::user(|_: &Bytes| -> Result<Value, TransformError> {
            panic!("transformer exploded")
        });
        let err = hook.apply(Side::Response, &Bytes::new()).unwrap_err();
        match err {
            CaptureError::TransformPanicked { side, message } => {
                assert_eq!(side, Side::Response);
                assert_eq!(message, "transformer exploded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
