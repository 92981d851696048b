//! Language code helpers.

/// ISO 639-2 bibliographic codes and their terminology equivalents.
const LANGUAGE_ALIASES: &[(&str, &str)] = &[
    ("alb", "sqi"),
    ("arm", "hye"),
    ("baq", "eus"),
    ("bur", "mya"),
    ("chi", "zho"),
    ("cze", "ces"),
    ("dut", "nld"),
    ("fre", "fra"),
    ("geo", "kat"),
    ("ger", "deu"),
    ("gre", "ell"),
    ("ice", "isl"),
    ("mac", "mkd"),
    ("mao", "mri"),
    ("may", "msa"),
    ("per", "fas"),
    ("rum", "ron"),
    ("slo", "slk"),
    ("tib", "bod"),
    ("wel", "cym"),
];

/// Canonical form of a three-letter language code.
///
/// Codes with unprintable characters become `"???"`, blanks become
/// underscores and bibliographic codes map to their terminology form.
pub fn normalize_language_code(code: &str) -> String {
    if code.chars().any(|c| !(c.is_ascii_graphic() || c == ' ')) {
        return "???".to_string();
    }
    let code: String = code
        .chars()
        .map(|c| if c == ' ' { '_' } else { c.to_ascii_lowercase() })
        .collect();
    LANGUAGE_ALIASES
        .iter()
        .find(|(b, _)| *b == code)
        .map(|(_, t)| t.to_string())
        .unwrap_or(code)
}

/// Decide whether `code` beats the best language seen so far.
///
/// `level` holds the index in `preferences` of the best match so far,
/// `None` before the first call. A strictly better index wins. When nothing
/// has been accepted yet the first code is taken even if it is not
/// preferred, and `level` is set past every real preference. `code` may
/// list alternatives separated by `+`.
pub fn is_preferred_language(preferences: &[String], code: &str, level: &mut Option<usize>) -> bool {
    let mut found = false;

    for part in code.split('+') {
        let part = normalize_language_code(part);
        let position = preferences
            .iter()
            .position(|p| normalize_language_code(p) == part);
        if let Some(i) = position {
            if level.map_or(true, |l| i < l) {
                *level = Some(i);
                found = true;
            }
        }
    }

    if level.is_none() {
        *level = Some(usize::MAX);
        return true;
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefs() -> Vec<String> {
        vec!["deu".to_string(), "eng".to_string()]
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_language_code("ger"), "deu");
        assert_eq!(normalize_language_code("ENG"), "eng");
        assert_eq!(normalize_language_code("A 1"), "a_1");
        assert_eq!(normalize_language_code("e\u{1}g"), "???");
    }

    #[test]
    fn test_first_code_always_taken() {
        let mut level = None;
        assert!(is_preferred_language(&prefs(), "fra", &mut level));
        assert_eq!(level, Some(usize::MAX));
        // A later non-preferred code loses
        assert!(!is_preferred_language(&prefs(), "ita", &mut level));
    }

    #[test]
    fn test_strictly_better_wins() {
        let mut level = None;
        assert!(is_preferred_language(&prefs(), "eng", &mut level));
        assert_eq!(level, Some(1));
        assert!(!is_preferred_language(&prefs(), "eng", &mut level));
        assert!(is_preferred_language(&prefs(), "ger", &mut level));
        assert_eq!(level, Some(0));
        assert!(!is_preferred_language(&prefs(), "eng", &mut level));
    }

    #[test]
    fn test_plus_separated_codes() {
        let mut level = Some(usize::MAX);
        assert!(is_preferred_language(&prefs(), "fra+eng", &mut level));
        assert_eq!(level, Some(1));
    }

    #[test]
    fn test_no_preferences() {
        let mut level = None;
        assert!(is_preferred_language(&[], "deu", &mut level));
        assert!(!is_preferred_language(&[], "eng", &mut level));
    }
}
