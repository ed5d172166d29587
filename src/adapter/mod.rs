//! Hosting adapters
//!
//! The pipeline only ever sees `InboundRequest` and `ResponseHead`. An
//! adapter translates a web framework's native request into the former,
//! exposes its native response through `HostResponse`, and maps the
//! pipeline's `Outcome` back onto the wire.

use crate::types::ResponseHead;
use std::collections::HashMap;

pub mod axum;

/// Read access to an application response before it is delivered
pub trait HostResponse {
    fn status(&self) -> u16;

    fn headers(&self) -> HashMap<String, String>;

    /// True once part of the response has reached the client
    ///
    /// Hosts that buffer the response until the pipeline hands it back
    /// never commit early.
    fn committed(&self) -> bool {
        false
    }

    fn head(&self) -> ResponseHead {
        ResponseHead {
            status: self.status(),
            headers: self.headers(),
            committed: self.committed(),
        }
    }
}

impl HostResponse for ResponseHead {
    fn status(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> HashMap<String, String> {
        self.headers.clone()
    }

    fn committed(&self) -> bool {
        self.committed
    }
}

/// Flatten a header map, joining repeated names with ", "
///
/// Values that are not valid UTF-8 are skipped.
pub fn flatten_headers<'a, I>(headers: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut out: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        let Ok(value) = std::str::from_utf8(value) else {
            continue;
        };
        out.entry(name.to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}
