//! Buffered-body rehydration with role-aware masking.

use std::collections::HashMap;

use veil_core::keys::Role;
use veil_detector::mask_value;

/// Apply a role to a vault snapshot: viewers see masked values, everyone
/// else the originals. The SSE rehydrator takes the result as its mapping.
pub fn role_view(mappings: HashMap<String, String>, role: Role) -> HashMap<String, String> {
    match role {
        Role::Viewer => mappings
            .into_iter()
            .map(|(token, original)| (token, mask_value(&original)))
            .collect(),
        _ => mappings,
    }
}

/// Substitute every vault token appearing in a buffered body.
pub fn rehydrate_text(text: &str, mappings: &HashMap<String, String>, role: Role) -> String {
    if mappings.is_empty() || !text.contains('[') {
        return text.to_string();
    }

    let mut out = text.to_string();
    for (token, original) in mappings {
        if !out.contains(token.as_str()) {
            continue;
        }
        let replacement = match role {
            Role::Viewer => mask_value(original),
            _ => original.clone(),
        };
        out = out.replace(token.as_str(), &replacement);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mappings() -> HashMap<String, String> {
        HashMap::from([("[CCCD_1]".to_string(), "012345678901".to_string())])
    }

    #[test]
    fn test_admin_sees_original() {
        let out = rehydrate_text("id is [CCCD_1]", &mappings(), Role::Admin);
        assert_eq!(out, "id is 012345678901");
    }

    #[test]
    fn test_viewer_sees_masked_length_preserving() {
        let out = rehydrate_text("id is [CCCD_1]", &mappings(), Role::Viewer);
        assert!(!out.contains("012345678901"));
        assert!(out.contains("xx"));
        // Masked value is exactly as long as the original.
        assert_eq!(out.len(), "id is 012345678901".len());
    }

    #[test]
    fn test_unknown_token_untouched() {
        let out = rehydrate_text("keep [EMAIL_7]", &mappings(), Role::Admin);
        assert_eq!(out, "keep [EMAIL_7]");
    }

    #[test]
    fn test_role_view_masks_for_viewer_only() {
        let admin = role_view(mappings(), Role::Operator);
        assert_eq!(admin["[CCCD_1]"], "012345678901");

        let viewer = role_view(mappings(), Role::Viewer);
        assert_ne!(viewer["[CCCD_1]"], "012345678901");
        assert_eq!(viewer["[CCCD_1]"].len(), 12);
    }
}
