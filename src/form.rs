//! Hidden field extraction from the login form.
//!
//! The login page embeds anti-forgery tokens as `<input type="hidden">`
//! elements inside `<form id="form">`. They must be echoed back verbatim
//! with the credentials for the submission to be accepted.

use scraper::{Html, Node};
use std::collections::BTreeMap;

/// Id attribute of the login form on the portal.
pub const LOGIN_FORM_ID: &str = "form";

/// Hidden input names mapped to their values for one login attempt.
pub type HiddenFields = BTreeMap<String, String>;

/// Parse `html` and collect the hidden inputs of the form whose id is
/// `form_id`.
///
/// Any other `<form>` is skipped together with its whole subtree. Hidden
/// inputs that sit outside every form are kept. Returns an empty map when
/// nothing matches.
pub fn extract_hidden_fields(html: &str, form_id: &str) -> HiddenFields {
    let document = Html::parse_document(html);
    let mut fields = HiddenFields::new();

    let mut stack = vec![document.tree.root()];
    while let Some(node) = stack.pop() {
        if let Node::Element(el) = node.value() {
            match el.name() {
                "form" if el.attr("id") != Some(form_id) => continue,
                "input" => {
                    let hidden = el
                        .attr("type")
                        .is_some_and(|t| t.eq_ignore_ascii_case("hidden"));
                    if hidden {
                        fields.insert(
                            el.attr("name").unwrap_or_default().to_string(),
                            el.attr("value").unwrap_or_default().to_string(),
                        );
                    }
                }
                _ => {}
            }
        }
        // Reverse so siblings pop in document order; a repeated name keeps
        // the last value seen.
        stack.extend(node.children().rev());
    }

    fields
}
