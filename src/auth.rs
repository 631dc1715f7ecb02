use thiserror::Error;
use tracing::{info, warn};

use crate::config::{Credentials, Endpoints};
use crate::form::{extract_hidden_fields, LOGIN_FORM_ID};
use crate::session::{HttpError, HttpSession};

/// Text only present on pages rendered for a signed-in user.
pub const SIGNED_IN_MARKER: &str = "Sign Out";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("fetching login form page: {0}")]
    LoginPage(#[source] HttpError),
    #[error("submitting login form: {0}")]
    Submit(#[source] HttpError),
    #[error("account page does not say Sign Out")]
    NotSignedIn,
}

/// Sign in on `session`. On success the session's cookie store holds an
/// authenticated session.
pub fn login<S: HttpSession>(
    session: &S,
    endpoints: &Endpoints,
    credentials: &Credentials,
) -> Result<(), AuthError> {
    info!("requesting login form");
    let form_page = session
        .get(&endpoints.login_url())
        .map_err(AuthError::LoginPage)?;

    let hidden = extract_hidden_fields(&form_page.body, LOGIN_FORM_ID);
    if hidden.is_empty() {
        warn!(url = %form_page.url, "login form has no hidden fields");
    }

    let mut fields: Vec<(String, String)> = hidden.into_iter().collect();
    fields.push(("identity".to_string(), credentials.username.clone()));
    fields.push(("credential".to_string(), credentials.password.clone()));

    info!(username = %credentials.username, "logging in");
    // Post back to wherever the login page redirected us.
    let account_page = session
        .post_form(&form_page.url, &fields)
        .map_err(AuthError::Submit)?;

    if !account_page.body.contains(SIGNED_IN_MARKER) {
        return Err(AuthError::NotSignedIn);
    }
    Ok(())
}
