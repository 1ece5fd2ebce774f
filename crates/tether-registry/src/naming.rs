//! Method name normalization.
//!
//! Host code tends to name things `Calc.Add` while the peer side expects
//! `calc.add`. A [`NamingConvention`] folds every name the same way at
//! registration and at lookup, so both agree no matter which style the
//! caller used.

/// How method names are folded before they reach the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamingConvention {
    /// Names are used verbatim.
    AsIs,
    /// Each dotted segment is camel-cased and empty segments are removed:
    /// `"Calc..AddTwo"` becomes `"calc.addTwo"`.
    #[default]
    CamelCase,
}

impl NamingConvention {
    /// Applies the convention to a (possibly dotted) name.
    pub fn apply(self, name: &str) -> String {
        match self {
            Self::AsIs => name.to_owned(),
            Self::CamelCase => name
                .split('.')
                .filter(|segment| !segment.is_empty())
                .map(camel_case_segment)
                .collect::<Vec<_>>()
                .join("."),
        }
    }
}

/// Camel-cases a single segment.
///
/// Only a leading run of uppercase letters is lowered. The last letter of
/// that run stays uppercase when a lowercase letter follows it, so
/// acronyms fold naturally: `URLValue` → `urlValue`, `ID` → `id`,
/// `Add` → `add`. Segments that don't start with an uppercase letter are
/// left alone.
fn camel_case_segment(segment: &str) -> String {
    let mut chars: Vec<char> = segment.chars().collect();
    if !chars.first().is_some_and(|c| c.is_uppercase()) {
        return segment.to_owned();
    }

    for i in 0..chars.len() {
        if i == 1 && !chars[i].is_uppercase() {
            break;
        }
        let next = chars.get(i + 1).copied();
        if i > 0 && next.is_some_and(|c| !c.is_uppercase()) {
            if next.is_some_and(char::is_whitespace) {
                chars[i] = lower(chars[i]);
            }
            break;
        }
        chars[i] = lower(chars[i]);
    }

    chars.into_iter().collect()
}

fn lower(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}
