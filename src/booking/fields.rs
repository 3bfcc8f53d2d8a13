//! Form field discovery and filling
//!
//! French portals never agree on form markup, so fields are found by
//! substring heuristics over name, id and placeholder attributes. A field
//! that cannot be found is skipped, not fatal; the portal will complain at
//! submission if it actually needed the value.

use tracing::debug;

use crate::browser::{BrowserError, Session};

use super::types::ClientRecord;

/// Form fields the workflow knows how to fill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    LastName,
    FirstName,
    Email,
    Phone,
    BirthDate,
    ForeignId,
    Nationality,
}

impl FieldKind {
    /// Attribute substrings that identify the field, most specific first
    pub fn patterns(&self) -> &'static [&'static str] {
        match self {
            Self::LastName => &["nom_famille", "lastname", "last_name", "surname", "nom"],
            Self::FirstName => &["prenom", "firstname", "first_name", "givenname"],
            Self::Email => &["email", "courriel", "mail"],
            Self::Phone => &["telephone", "portable", "mobile", "phone", "tel"],
            Self::BirthDate => &["naissance", "birthdate", "birth", "dob"],
            Self::ForeignId => &["agdref", "etranger", "foreign", "numero_etranger"],
            Self::Nationality => &["nationalite", "nationality"],
        }
    }
}

/// Case-insensitive attribute-substring selectors for one pattern.
///
/// Each variant is probed on its own: a single union selector would pin
/// visibility checking to the first match in document order, and an invisible
/// name match hides a perfectly visible placeholder match further down.
pub fn attribute_selectors(pattern: &str) -> [String; 5] {
    [
        format!("input[name*='{p}' i]", p = pattern),
        format!("input[id*='{p}' i]", p = pattern),
        format!("input[placeholder*='{p}' i]", p = pattern),
        format!("textarea[name*='{p}' i]", p = pattern),
        format!("textarea[id*='{p}' i]", p = pattern),
    ]
}

/// Fill every field a value exists for. Returns the number of fields filled.
pub async fn fill_client_fields(
    session: &Session,
    client: &ClientRecord,
) -> Result<u32, BrowserError> {
    let values: Vec<(FieldKind, Option<&str>)> = vec![
        (FieldKind::LastName, Some(client.last_name.as_str())),
        (FieldKind::FirstName, Some(client.first_name.as_str())),
        (FieldKind::Email, Some(client.email.as_str())),
        (FieldKind::Phone, client.phone.as_deref()),
        (FieldKind::BirthDate, client.birth_date.as_deref()),
        (FieldKind::ForeignId, client.foreign_id.as_deref()),
        (FieldKind::Nationality, client.nationality.as_deref()),
    ];

    let mut filled = 0;
    for (kind, value) in values {
        let Some(value) = value else { continue };
        if fill_field(session, kind, value).await? {
            filled += 1;
        } else {
            debug!("No visible field for {:?}, skipping", kind);
        }
    }
    Ok(filled)
}

/// Try each pattern's attribute variants until one matches a visible input
async fn fill_field(
    session: &Session,
    kind: FieldKind,
    value: &str,
) -> Result<bool, BrowserError> {
    for pattern in kind.patterns() {
        for selector in attribute_selectors(pattern) {
            if !session.is_visible(&selector).await.unwrap_or(false) {
                continue;
            }
            session.set_field_value(&selector, value).await?;
            debug!("Filled {:?} via {}", kind, selector);
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_attribute_variant_is_its_own_selector() {
        let selectors = attribute_selectors("prenom");
        assert!(selectors.contains(&"input[name*='prenom' i]".to_string()));
        assert!(selectors.contains(&"input[id*='prenom' i]".to_string()));
        assert!(selectors.contains(&"input[placeholder*='prenom' i]".to_string()));
        assert!(selectors.contains(&"textarea[name*='prenom' i]".to_string()));
        // No unions: visibility must be judged per variant
        assert!(selectors.iter().all(|s| !s.contains(',')));
    }

    #[test]
    fn specific_patterns_come_before_generic_ones() {
        // "nom" would also match "prenom" markup, so it must be tried last
        let patterns = FieldKind::LastName.patterns();
        assert_eq!(*patterns.last().unwrap(), "nom");
        assert!(patterns.contains(&"lastname"));

        let phone = FieldKind::Phone.patterns();
        assert_eq!(*phone.last().unwrap(), "tel");
    }
}
