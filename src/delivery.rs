//! Delivery date lookup on the reservation profile page.
//!
//! The profile page inlines its state as a JSON-like blob. The date lives in
//! a fragment shaped like `copyOverride":"Estimated Delivery: <date>"`, which
//! is located by plain substring search rather than parsing.

use thiserror::Error;
use tracing::info;

use crate::config::Endpoints;
use crate::session::{HttpError, HttpSession};

const DATE_LABEL: &str = "Estimated Delivery: ";
const DATE_MARKER: &str = "copyOverride\":\"Estimated Delivery: ";
/// Bytes examined from the start of the marker.
const WINDOW: usize = 100;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetching reservation profile page: {0}")]
    Http(#[from] HttpError),
    #[error("no delivery date found")]
    NotFound,
    #[error("no delivery date found (short string)")]
    ShortString,
}

/// Fetch the profile page for `reservation` and pull out the delivery date.
pub fn fetch_delivery_date<S: HttpSession>(
    session: &S,
    endpoints: &Endpoints,
    reservation: &str,
) -> Result<String, FetchError> {
    info!(reservation, "requesting reservation details");
    let page = session.get(&endpoints.profile_url(reservation))?;
    extract_delivery_date(&page.body)
}

/// Find the delivery date in a profile page body.
///
/// Takes a fixed window from the marker, splits it on `"` and returns the
/// third piece minus its label. The result is opaque text, never parsed.
pub fn extract_delivery_date(body: &str) -> Result<String, FetchError> {
    let loc = body.find(DATE_MARKER).ok_or(FetchError::NotFound)?;
    if loc + WINDOW > body.len() {
        return Err(FetchError::ShortString);
    }

    let mut end = loc + WINDOW;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    let window = &body[loc..end];

    let piece = window.split('"').nth(2).ok_or(FetchError::NotFound)?;
    Ok(piece.strip_prefix(DATE_LABEL).unwrap_or(piece).to_string())
}
