//! Download filename rules shared by both source families.

pub const MAX_FILENAME_CHARS: usize = 150;
pub const DEFAULT_FILENAME: &str = "video";

/// Replaces `<>:"/\|?*` and control characters with `_`, caps the result at
/// [`MAX_FILENAME_CHARS`] characters and falls back to [`DEFAULT_FILENAME`].
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|character| {
            if character.is_control() || matches!(character, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') {
                '_'
            } else {
                character
            }
        })
        .take(MAX_FILENAME_CHARS)
        .collect();

    let trimmed = replaced.trim();
    if trimmed.is_empty() {
        DEFAULT_FILENAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// `attachment` disposition with an ASCII `filename` and the exact name in
/// `filename*` so non-ASCII titles survive header encoding.
pub fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    if safe_ascii == filename {
        return format!("attachment; filename=\"{safe_ascii}\"");
    }
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        format!("{DEFAULT_FILENAME}.mp4")
    } else {
        compact.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORBIDDEN: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

    #[test]
    fn strips_forbidden_and_control_characters() {
        let sanitized = sanitize_filename("a<b>c:d\"e/f\\g|h?i*j\u{0007}k\nl");
        assert!(!sanitized.chars().any(|c| FORBIDDEN.contains(&c) || c.is_control()));
        assert_eq!(sanitized, "a_b_c_d_e_f_g_h_i_j_k_l");
    }

    #[test]
    fn caps_length_at_150_characters() {
        let long = "ç".repeat(400);
        let sanitized = sanitize_filename(&long);
        assert_eq!(sanitized.chars().count(), MAX_FILENAME_CHARS);
    }

    #[test]
    fn falls_back_when_empty() {
        assert_eq!(sanitize_filename(""), "video");
        assert_eq!(sanitize_filename("   "), "video");
    }

    #[test]
    fn keeps_regular_titles_untouched() {
        assert_eq!(sanitize_filename("My Clip (2024)"), "My Clip (2024)");
    }

    #[test]
    fn disposition_is_plain_for_ascii_names() {
        assert_eq!(
            build_content_disposition("instagram_ABC.mp4"),
            "attachment; filename=\"instagram_ABC.mp4\""
        );
    }

    #[test]
    fn disposition_carries_utf8_name_for_unicode_titles() {
        let header = build_content_disposition("Canção.mp4");
        assert!(header.starts_with("attachment; filename=\"Can__o.mp4\""));
        assert!(header.contains("filename*=UTF-8''Can%C3%A7%C3%A3o.mp4"));
    }
}
