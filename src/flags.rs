use lazy_static::lazy_static;
use std::collections::HashMap;

// Location names as the profile API reports them -> glyph
const COUNTRY_FLAGS: &[(&str, &str)] = &[
    ("Afghanistan", "🇦🇫"),
    ("Africa", "🌍"),
    ("Albania", "🇦🇱"),
    ("Algeria", "🇩🇿"),
    ("Argentina", "🇦🇷"),
    ("Australia", "🇦🇺"),
    ("Austria", "🇦🇹"),
    ("Bangladesh", "🇧🇩"),
    ("Belgium", "🇧🇪"),
    ("Brazil", "🇧🇷"),
    ("Canada", "🇨🇦"),
    ("Chile", "🇨🇱"),
    ("China", "🇨🇳"),
    ("Colombia", "🇨🇴"),
    ("Croatia", "🇭🇷"),
    ("Czech Republic", "🇨🇿"),
    ("Czechia", "🇨🇿"),
    ("Cyprus", "🇨🇾"),
    ("Denmark", "🇩🇰"),
    ("Egypt", "🇪🇬"),
    ("Europe", "🇪🇺"),
    ("European Union", "🇪🇺"),
    ("Finland", "🇫🇮"),
    ("France", "🇫🇷"),
    ("Germany", "🇩🇪"),
    ("Greece", "🇬🇷"),
    ("Hong Kong", "🇭🇰"),
    ("Hungary", "🇭🇺"),
    ("Iceland", "🇮🇸"),
    ("India", "🇮🇳"),
    ("Indonesia", "🇮🇩"),
    ("Iran", "🇮🇷"),
    ("Iraq", "🇮🇶"),
    ("Ireland", "🇮🇪"),
    ("Israel", "🇮🇱"),
    ("Italy", "🇮🇹"),
    ("Japan", "🇯🇵"),
    ("Kenya", "🇰🇪"),
    ("Malaysia", "🇲🇾"),
    ("Mexico", "🇲🇽"),
    ("Montenegro", "🇲🇪"),
    ("Netherlands", "🇳🇱"),
    ("New Zealand", "🇳🇿"),
    ("Nigeria", "🇳🇬"),
    ("Norway", "🇳🇴"),
    ("Pakistan", "🇵🇰"),
    ("Philippines", "🇵🇭"),
    ("Poland", "🇵🇱"),
    ("Portugal", "🇵🇹"),
    ("Romania", "🇷🇴"),
    ("Russia", "🇷🇺"),
    ("Saudi Arabia", "🇸🇦"),
    ("Singapore", "🇸🇬"),
    ("Slovakia", "🇸🇰"),
    ("Slovenia", "🇸🇮"),
    ("South Africa", "🇿🇦"),
    ("Korea", "🇰🇷"),
    ("South Korea", "🇰🇷"),
    ("Spain", "🇪🇸"),
    ("Sweden", "🇸🇪"),
    ("Switzerland", "🇨🇭"),
    ("Taiwan", "🇹🇼"),
    ("Thailand", "🇹🇭"),
    ("Turkey", "🇹🇷"),
    ("Ukraine", "🇺🇦"),
    ("United Arab Emirates", "🇦🇪"),
    ("United Kingdom", "🇬🇧"),
    ("United States", "🇺🇸"),
    ("Venezuela", "🇻🇪"),
    ("Viet Nam", "🇻🇳"),
    ("Vietnam", "🇻🇳"),
    ("East Asia & Pacific", "🌏"),
    ("East Asia and Pacific", "🌏"),
    ("East Asia", "🌏"),
    ("West Asia", "🌏"),
    ("Middle East", "🌏"),
    ("Middle East & North Africa", "🌏"),
    ("Sub-Saharan Africa", "🌍"),
    ("North Africa", "🌍"),
    ("South Asia", "🌏"),
    ("Central Asia", "🌏"),
    ("Southeast Asia", "🌏"),
    ("Latin America", "🌎"),
    ("Latin America & Caribbean", "🌎"),
    ("Caribbean", "🌎"),
    ("North America", "🌎"),
    ("South America", "🌎"),
    ("Oceania", "🌏"),
    ("Pacific", "🌏"),
];

const VIETNAM_FLAG: &str = "🇻🇳";

lazy_static! {
    // lowercased name -> glyph (first table entry wins)
    static ref BY_LOWER: HashMap<String, &'static str> = index_by(|name| name.to_lowercase());
    // lowercased name with all whitespace removed -> glyph
    static ref BY_SQUASHED: HashMap<String, &'static str> = index_by(squash);
}

fn index_by(key: impl Fn(&str) -> String) -> HashMap<String, &'static str> {
    let mut map = HashMap::new();
    for (name, flag) in COUNTRY_FLAGS {
        map.entry(key(name)).or_insert(*flag);
    }
    map
}

fn squash(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

/// Map a location string to its flag glyph.
///
/// Tries, in order: exact name, case-insensitive name, case-insensitive name
/// with whitespace removed. Anything mentioning both "viet" and "nam" falls
/// back to the Vietnam flag because its name comes back in too many forms.
/// Empty and unknown locations give `None`.
pub fn resolve(location: Option<&str>) -> Option<&'static str> {
    let trimmed = location?.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some((_, flag)) = COUNTRY_FLAGS.iter().find(|(name, _)| *name == trimmed) {
        return Some(flag);
    }

    let lower = trimmed.to_lowercase();
    if let Some(flag) = BY_LOWER.get(&lower) {
        return Some(flag);
    }

    if let Some(flag) = BY_SQUASHED.get(&squash(&lower)) {
        return Some(flag);
    }

    if lower.contains("viet") && lower.contains("nam") {
        return Some(VIETNAM_FLAG);
    }

    None
}

/// Text of the annotation span: leading space, glyph, location.
pub fn flag_label(flag: &str, location: &str) -> String {
    format!(" {} {}", flag, location)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_case_insensitive_names_resolve() {
        assert_eq!(resolve(Some("Japan")), Some("🇯🇵"));
        assert_eq!(resolve(Some("japan")), Some("🇯🇵"));
        assert_eq!(resolve(Some("UNITED STATES")), Some("🇺🇸"));
        assert_eq!(resolve(Some("Latin America & Caribbean")), Some("🌎"));
    }

    #[test]
    fn vietnam_spellings_share_one_glyph() {
        let expected = Some(VIETNAM_FLAG);
        for name in ["Viet Nam", "Vietnam", "VIETNAM", "  vietnam  ", "viet   nam"] {
            assert_eq!(resolve(Some(name)), expected, "{:?}", name);
        }
        assert_eq!(resolve(Some("Socialist Republic of Viet Nam")), expected);
    }

    #[test]
    fn whitespace_is_ignored_for_matching() {
        assert_eq!(resolve(Some("  NewZealand ")), Some("🇳🇿"));
        assert_eq!(resolve(Some("hong\tkong")), Some("🇭🇰"));
    }

    #[test]
    fn unknown_or_empty_locations_give_none() {
        assert_eq!(resolve(None), None);
        assert_eq!(resolve(Some("")), None);
        assert_eq!(resolve(Some("   ")), None);
        assert_eq!(resolve(Some("Atlantis")), None);
    }

    #[test]
    fn label_has_leading_space() {
        assert_eq!(flag_label("🇯🇵", "Japan"), " 🇯🇵 Japan");
    }
}
