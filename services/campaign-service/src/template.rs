use std::collections::HashMap;

use crate::models::Contact;

/// Replace every `{{name}}` token in `text` with its value from `vars`.
///
/// Tokens without a mapping substitute the empty string; their names are
/// surfaced as a warning so a typo'd variable does not vanish silently.
/// Text without tokens passes through untouched, which makes rendering
/// idempotent on already-rendered output.
pub fn render(text: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut unmatched: Vec<&str> = Vec::new();

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => unmatched.push(name),
                }
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated token, keep the literal text.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);

    if !unmatched.is_empty() {
        unmatched.sort_unstable();
        unmatched.dedup();
        tracing::warn!(
            tokens = ?unmatched,
            "unmatched template tokens substituted with empty string"
        );
    }

    out
}

/// Default variable set for one recipient: `name`, `email`, `company`.
/// Campaign-supplied overrides win on key collision.
pub fn contact_vars(contact: &Contact, overrides: &HashMap<String, String>) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert("name".to_string(), contact.name.clone());
    vars.insert("email".to_string(), contact.email.clone());
    vars.insert(
        "company".to_string(),
        contact.company.clone().unwrap_or_default(),
    );
    for (key, value) in overrides {
        vars.insert(key.clone(), value.clone());
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContactStatus, ContactType};

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_every_occurrence() {
        let rendered = render(
            "Hi {{name}}, welcome {{name}} to {{company}}",
            &vars(&[("name", "Ana"), ("company", "Acme")]),
        );
        assert_eq!(rendered, "Hi Ana, welcome Ana to Acme");
    }

    #[test]
    fn unknown_tokens_become_empty_string() {
        let rendered = render("Hello {{missing}}!", &vars(&[("name", "Ana")]));
        assert_eq!(rendered, "Hello !");
    }

    #[test]
    fn rendering_is_idempotent_on_rendered_text() {
        let mapping = vars(&[("name", "Ana")]);
        let once = render("Hi {{name}}", &mapping);
        let twice = render(&once, &mapping);
        assert_eq!(once, twice);
    }

    #[test]
    fn unterminated_token_is_kept_literally() {
        let rendered = render("Hi {{name", &vars(&[("name", "Ana")]));
        assert_eq!(rendered, "Hi {{name");
    }

    #[test]
    fn campaign_overrides_win_over_contact_defaults() {
        let contact = Contact {
            id: 1,
            email: "a@x.com".to_string(),
            name: "Ana".to_string(),
            company: Some("Acme".to_string()),
            contact_type: ContactType::Customer,
            status: ContactStatus::Active,
            tags: Vec::new(),
            last_contacted: None,
        };
        let overrides = vars(&[("name", "friend"), ("offer", "20% off")]);
        let merged = contact_vars(&contact, &overrides);
        assert_eq!(merged.get("name").unwrap(), "friend");
        assert_eq!(merged.get("email").unwrap(), "a@x.com");
        assert_eq!(merged.get("company").unwrap(), "Acme");
        assert_eq!(merged.get("offer").unwrap(), "20% off");
    }

    #[test]
    fn missing_company_defaults_to_empty() {
        let contact = Contact {
            id: 2,
            email: "b@x.com".to_string(),
            name: "Bo".to_string(),
            company: None,
            contact_type: ContactType::Partner,
            status: ContactStatus::Active,
            tags: Vec::new(),
            last_contacted: None,
        };
        let merged = contact_vars(&contact, &HashMap::new());
        assert_eq!(merged.get("company").unwrap(), "");
    }
}
