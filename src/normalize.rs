//! Canonical forms for French commune names.
//!
//! Spreadsheet inputs spell the same commune many ways (`St Etienne`,
//! `SAINT-ÉTIENNE`, `Saint  Etienne Cedex 2`). Everything is folded to an
//! upper-case, accent-free form with `SAINT-`/`SAINTE-` prefixes and no
//! postal `CEDEX` suffix, so identical places compare equal.

use once_cell::sync::Lazy;
use regex::Regex;

static SAINT_ABBREV_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bST[\s\-]+").expect("valid regex"));
static SAINTE_ABBREV_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bSTE[\s\-]+").expect("valid regex"));
static SAINT_SPACED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(SAINTE?)\s+").expect("valid regex"));
static CEDEX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\bCEDEX\b\s*\d*").expect("valid regex"));
static HYPHEN_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"-+").expect("valid regex"));
static HYPHEN_SPACING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*-\s*").expect("valid regex"));

/// Returns `true` for values a spreadsheet reader produces for empty cells.
pub fn is_blank(raw: &str) -> bool {
    let trimmed = raw.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan")
}

pub fn normalize_commune_name(raw: &str) -> Option<String> {
    if is_blank(raw) {
        return None;
    }

    let upper: String = raw.to_uppercase().chars().flat_map(fold_accent).collect();
    let mut name = collapse_whitespace(&upper);

    name = SAINTE_ABBREV_RE.replace_all(&name, "SAINTE-").into_owned();
    name = SAINT_ABBREV_RE.replace_all(&name, "SAINT-").into_owned();
    name = SAINT_SPACED_RE.replace_all(&name, "$1-").into_owned();
    name = CEDEX_RE.replace_all(&name, "").into_owned();
    name = HYPHEN_RUN_RE.replace_all(&name, "-").into_owned();
    name = HYPHEN_SPACING_RE.replace_all(&name, "-").into_owned();
    let name = collapse_whitespace(&name);

    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fold_accent(c: char) -> FoldedChar {
    match c {
        'À' | 'Â' | 'Ä' | 'Á' | 'Ã' => FoldedChar::One('A'),
        'Ç' => FoldedChar::One('C'),
        'É' | 'È' | 'Ê' | 'Ë' => FoldedChar::One('E'),
        'Î' | 'Ï' | 'Í' | 'Ì' => FoldedChar::One('I'),
        'Ô' | 'Ö' | 'Ó' | 'Ò' | 'Õ' => FoldedChar::One('O'),
        'Ù' | 'Û' | 'Ü' | 'Ú' => FoldedChar::One('U'),
        'Ÿ' => FoldedChar::One('Y'),
        'Ñ' => FoldedChar::One('N'),
        'Œ' => FoldedChar::Two('O', 'E'),
        'Æ' => FoldedChar::Two('A', 'E'),
        '’' | '`' => FoldedChar::One('\''),
        other => FoldedChar::One(other),
    }
}

enum FoldedChar {
    One(char),
    Two(char, char),
    Done,
}

impl Iterator for FoldedChar {
    type Item = char;

    fn next(&mut self) -> Option<char> {
        match std::mem::replace(self, FoldedChar::Done) {
            FoldedChar::One(c) => Some(c),
            FoldedChar::Two(first, second) => {
                *self = FoldedChar::One(second);
                Some(first)
            }
            FoldedChar::Done => None,
        }
    }
}
