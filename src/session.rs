use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Browser identification sent with every request; the portal rejects
/// non-browser clients.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

const MAX_REDIRECTS: u32 = 10;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },
    #[error("reading response from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: std::io::Error,
    },
}

/// A fetched page: the URL it finally resolved to and its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub url: String,
    pub body: String,
}

/// Trait for HTTP sessions to allow mocking. Implementations carry cookies
/// between calls.
pub trait HttpSession {
    fn get(&self, url: &str) -> Result<Page, HttpError>;
    fn post_form(&self, url: &str, fields: &[(String, String)]) -> Result<Page, HttpError>;
}

/// Produces brand new sessions with empty cookie stores.
pub trait Connector {
    type Session: HttpSession;

    fn connect(&self) -> Self::Session;
}

pub struct UreqConnector {
    user_agent: String,
    timeout: Duration,
}

impl UreqConnector {
    pub fn new(user_agent: &str, timeout: Duration) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            timeout,
        }
    }
}

impl Connector for UreqConnector {
    type Session = UreqSession;

    fn connect(&self) -> UreqSession {
        debug!("creating fresh cookie store");
        let agent = ureq::AgentBuilder::new()
            .user_agent(&self.user_agent)
            .timeout(self.timeout)
            .redirects(MAX_REDIRECTS)
            .build();
        UreqSession { agent }
    }
}

/// Blocking HTTP session. The agent owns the cookie jar, so dropping the
/// session drops every cookie with it.
pub struct UreqSession {
    agent: ureq::Agent,
}

impl UreqSession {
    fn read(url: &str, resp: Result<ureq::Response, ureq::Error>) -> Result<Page, HttpError> {
        // Error statuses still carry a page worth inspecting; the callers
        // decide on content, not on status codes.
        let resp = match resp {
            Ok(r) => r,
            Err(ureq::Error::Status(code, r)) => {
                debug!(url, code, "non-success status");
                r
            }
            Err(e) => {
                return Err(HttpError::Transport {
                    url: url.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        let final_url = resp.get_url().to_string();
        let body = resp.into_string().map_err(|source| HttpError::Body {
            url: url.to_string(),
            source,
        })?;
        Ok(Page {
            url: final_url,
            body,
        })
    }
}

impl HttpSession for UreqSession {
    fn get(&self, url: &str) -> Result<Page, HttpError> {
        Self::read(url, self.agent.get(url).call())
    }

    fn post_form(&self, url: &str, fields: &[(String, String)]) -> Result<Page, HttpError> {
        let pairs: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let resp = self
            .agent
            .post(url)
            .set("Content-Type", "application/x-www-form-urlencoded")
            .send_form(&pairs);
        Self::read(url, resp)
    }
}
