//! MySQL collation ids.
//!
//! `TABLE_MAP` metadata only carries numeric collation ids. The names are
//! needed because character decoding keys off the collation family.

/// Known collation ids and their names.
const COLLATIONS: &[(u32, &str)] = &[
    (1, "big5_chinese_ci"),
    (3, "dec8_swedish_ci"),
    (4, "cp850_general_ci"),
    (5, "latin1_german1_ci"),
    (6, "hp8_english_ci"),
    (7, "koi8r_general_ci"),
    (8, "latin1_swedish_ci"),
    (9, "latin2_general_ci"),
    (10, "swe7_swedish_ci"),
    (11, "ascii_general_ci"),
    (12, "ujis_japanese_ci"),
    (13, "sjis_japanese_ci"),
    (15, "latin1_danish_ci"),
    (24, "gb2312_chinese_ci"),
    (28, "gbk_chinese_ci"),
    (31, "latin1_german2_ci"),
    (33, "utf8_general_ci"),
    (45, "utf8mb4_general_ci"),
    (46, "utf8mb4_bin"),
    (47, "latin1_bin"),
    (48, "latin1_general_ci"),
    (49, "latin1_general_cs"),
    (63, "binary"),
    (65, "ascii_bin"),
    (76, "utf8_tolower_ci"),
    (83, "utf8_bin"),
    (94, "latin1_spanish_ci"),
    (192, "utf8_unicode_ci"),
    (224, "utf8mb4_unicode_ci"),
    (255, "utf8mb4_0900_ai_ci"),
    (309, "utf8mb4_0900_bin"),
];

/// Name of a collation id, if known.
pub fn collation_name(id: u32) -> Option<&'static str> {
    COLLATIONS
        .iter()
        .find(|(known, _)| *known == id)
        .map(|(_, name)| *name)
}

/// Name for a collation id, falling back to the decimal id for unknown ones.
pub fn collation_label(id: u32) -> String {
    collation_name(id)
        .map(str::to_string)
        .unwrap_or_else(|| id.to_string())
}

/// Whether text in this collation is single-byte Latin-1.
pub fn is_latin1(collation: &str) -> bool {
    collation.to_lowercase().contains("latin1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_collations() {
        assert_eq!(collation_name(8), Some("latin1_swedish_ci"));
        assert_eq!(collation_name(33), Some("utf8_general_ci"));
        assert_eq!(collation_name(63), Some("binary"));
        assert_eq!(collation_name(9999), None);
        assert_eq!(collation_label(9999), "9999");
    }

    #[test]
    fn test_latin1_family() {
        assert!(is_latin1("latin1_swedish_ci"));
        assert!(is_latin1("LATIN1_BIN"));
        assert!(!is_latin1("utf8mb4_general_ci"));
    }
}
