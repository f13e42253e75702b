//! Translation between httparse and the `http` crate's header types.

use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::Result;

/// Limit for the number of header lines the parser will accept.
pub const MAX_HEADERS: usize = 124;

/// Trait to convert raw httparse output into `http` types.
pub trait FromHttparse<T>: Sized {
    /// Convert raw httparse data to a rich type.
    fn from_httparse(raw: T) -> Result<Self>;
}

impl<'b: 'h, 'h> FromHttparse<&'b [httparse::Header<'h>]> for HeaderMap {
    fn from_httparse(raw: &'b [httparse::Header<'h>]) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for header in raw {
            let name = HeaderName::from_bytes(header.name.as_bytes())?;
            let value = HeaderValue::from_bytes(header.value)?;
            // A repeated header name keeps only its last occurrence.
            headers.insert(name, value);
        }

        Ok(headers)
    }
}
